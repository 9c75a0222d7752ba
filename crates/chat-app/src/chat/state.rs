use lectern_llm::{Intent, Source};

/// Data captured by the one in-flight turn.
///
/// `accumulated` only grows while the turn streams; once terminated the
/// state is frozen and only read to build the assistant message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    accumulated: String,
    sources: Vec<Source>,
    intent: Option<Intent>,
    suggested_questions: Vec<String>,
    terminated: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one flushed batch. Returns false once the turn is terminated.
    pub fn append(&mut self, batch: &str) -> bool {
        if self.terminated {
            tracing::warn!(bytes = batch.len(), "dropping text delivered after turn ended");
            return false;
        }
        self.accumulated.push_str(batch);
        true
    }

    pub fn set_sources(&mut self, sources: Vec<Source>) {
        if !self.terminated {
            self.sources = sources;
        }
    }

    pub fn set_intent(&mut self, intent: Intent) {
        if !self.terminated {
            self.intent = Some(intent);
        }
    }

    pub fn set_suggested_questions(&mut self, questions: Vec<String>) {
        if !self.terminated {
            self.suggested_questions = questions;
        }
    }

    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn intent(&self) -> Option<&Intent> {
        self.intent.as_ref()
    }

    pub fn suggested_questions(&self) -> &[String] {
        &self.suggested_questions
    }
}
