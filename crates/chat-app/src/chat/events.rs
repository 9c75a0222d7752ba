use lectern_llm::{Intent, Source};

use crate::chat::ids::DiscussionId;
use crate::chat::message::{ChatMessage, StreamTarget};

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `done` arrived, or the transport ended without a terminator.
    Finalized,
    Errored { message: String },
    /// The user stopped the turn; the message is truncated and flagged.
    Cancelled,
}

impl TurnOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finalized)
    }
}

/// Notification sent to listeners of a [`StreamController`](crate::chat::StreamController).
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    TurnStarted {
        target: StreamTarget,
        user_message: ChatMessage,
    },
    /// Content so far after a flush, with its incremental markup.
    ContentUpdated {
        target: StreamTarget,
        content: String,
        html: String,
    },
    SourcesUpdated {
        target: StreamTarget,
        sources: Vec<Source>,
    },
    IntentUpdated {
        target: StreamTarget,
        intent: Intent,
    },
    SuggestedQuestionsUpdated {
        target: StreamTarget,
        questions: Vec<String>,
    },
    TitleChanged {
        discussion_id: DiscussionId,
        title: String,
    },
    /// The turn's single assistant message, rendered by the full renderer.
    MessageFinalized {
        target: StreamTarget,
        message: ChatMessage,
        outcome: TurnOutcome,
        html: String,
    },
}
