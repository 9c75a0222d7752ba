use lectern_llm::Source;
use lectern_render::{CitationResolver, CitationTarget};

/// Resolves `[N]` against the sources captured for one message.
///
/// A source's `citation_number` wins; sources without one are addressed by
/// their 1-based position.
#[derive(Debug, Clone, Copy)]
pub struct SourceCitations<'a> {
    sources: &'a [Source],
}

impl<'a> SourceCitations<'a> {
    pub fn new(sources: &'a [Source]) -> Self {
        Self { sources }
    }

    pub fn source(&self, index: u32) -> Option<&'a Source> {
        self.sources
            .iter()
            .find(|source| source.citation_number == Some(index))
            .or_else(|| {
                let position = usize::try_from(index).ok()?.checked_sub(1)?;
                self.sources
                    .get(position)
                    .filter(|source| source.citation_number.is_none())
            })
    }
}

impl CitationResolver for SourceCitations<'_> {
    fn resolve(&self, index: u32) -> Option<CitationTarget> {
        self.source(index).map(|source| {
            CitationTarget::new(source.filename.clone()).with_href(format!("#source-{index}"))
        })
    }
}
