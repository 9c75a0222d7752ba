use serde::{Deserialize, Serialize};

/// One retrieved document the backend cites in its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_preview: Option<String>,
    /// Number the answer text uses in `[N]` markers for this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

impl Source {
    pub fn new(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            score: 0.0,
            chunk_preview: None,
            citation_number: None,
            chunk_id: None,
        }
    }

    pub fn with_citation_number(mut self, citation_number: u32) -> Self {
        self.citation_number = Some(citation_number);
        self
    }
}

/// Classified purpose of the user's question, e.g. `summarize` / "Summary".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: String,
    pub label: String,
}

impl Intent {
    pub fn new(kind: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            label: label.into(),
        }
    }
}

/// Typed event decoded from one SSE block of the chat stream.
///
/// Exactly one `Error` or `Done` terminates a stream; every other variant may
/// repeat and interleave before that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        content: String,
    },
    Sources {
        sources: Vec<Source>,
    },
    Intent {
        intent: String,
        label: String,
    },
    SuggestedQuestions {
        questions: Vec<String>,
    },
    DiscussionTitle {
        discussion_id: String,
        title: String,
    },
    Error {
        error: String,
    },
    Done {},
}

impl StreamEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn done() -> Self {
        Self::Done {}
    }

    /// True for the two variants that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done {})
    }

    /// Short wire name, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Sources { .. } => "sources",
            Self::Intent { .. } => "intent",
            Self::SuggestedQuestions { .. } => "suggested_questions",
            Self::DiscussionTitle { .. } => "discussion_title",
            Self::Error { .. } => "error",
            Self::Done {} => "done",
        }
    }
}
