use std::fmt;

use chrono::{DateTime, Utc};
use lectern_llm::{Intent, Source};
use serde::{Deserialize, Serialize};

use crate::chat::ids::{DiscussionId, MessageId};

/// Identifier for one streaming turn.
///
/// This must change on every send so stale handles can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key of one turn: the discussion it belongs to plus its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub discussion_id: DiscussionId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(discussion_id: DiscussionId, session_id: StreamSessionId) -> Self {
        Self {
            discussion_id,
            session_id,
        }
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}#{}", self.discussion_id, self.session_id.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of a discussion's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_questions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Set when the user stopped the turn; the content is truncated.
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sources: None,
            suggested_questions: None,
            intent: None,
            stopped: false,
            provider: None,
            response_time_ms: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Lifecycle of the controller's single outbound stream.
///
/// Terminal phases are transient: the controller resets to `Idle` right after
/// the assistant message is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Finalized(StreamTarget),
    Errored {
        target: StreamTarget,
        message: String,
    },
    Cancelled(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
    ResetToIdle,
}

/// Rejection reason for illegal phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

impl fmt::Display for StreamTransitionRejection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStreaming { active, attempted } => write!(
                formatter,
                "turn {active} is still streaming, cannot start {attempted}"
            ),
            Self::NoActiveStream => write!(formatter, "no turn is streaming"),
            Self::SessionMismatch { active, attempted } => {
                write!(formatter, "turn {attempted} does not match active turn {active}")
            }
        }
    }
}

pub type StreamTransitionResult = Result<StreamPhase, StreamTransitionRejection>;

impl StreamPhase {
    /// Returns the streaming target if and only if the phase is `Streaming`.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Finalized(_) | Self::Errored { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition.
    ///
    /// Any terminal transition must name the streaming turn exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, || Self::Finalized(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, || Self::Errored { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, || Self::Cancelled(target))
            }
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) => Err(StreamTransitionRejection::AlreadyStreaming {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Finalized(_) | Self::Errored { .. } | Self::Cancelled(_) => {
                Ok(Self::Streaming(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce() -> Self,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Finalized(_) | Self::Errored { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn target(session: u64) -> StreamTarget {
        StreamTarget::new(
            DiscussionId::parse("1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap(),
            StreamSessionId::new(session),
        )
    }

    #[test]
    fn walks_full_lifecycle() {
        let streaming = StreamPhase::Idle
            .apply(StreamTransition::Start(target(1)))
            .unwrap();
        assert_eq!(streaming.active_target(), Some(target(1)));
        assert!(streaming.accepts_stream_event(target(1)));
        assert!(!streaming.accepts_stream_event(target(2)));

        let failed = streaming
            .apply(StreamTransition::Fail {
                target: target(1),
                message: "boom".to_string(),
            })
            .unwrap();
        assert_eq!(
            failed,
            StreamPhase::Errored {
                target: target(1),
                message: "boom".to_string()
            }
        );
        assert!(failed.apply(StreamTransition::ResetToIdle).unwrap().is_idle());
    }

    #[test]
    fn rejects_second_start_while_streaming() {
        let streaming = StreamPhase::Streaming(target(1));
        assert_eq!(
            streaming.apply(StreamTransition::Start(target(2))),
            Err(StreamTransitionRejection::AlreadyStreaming {
                active: target(1),
                attempted: target(2),
            })
        );
        assert!(streaming.apply(StreamTransition::Start(target(1))).is_err());
    }

    #[test]
    fn terminal_transitions_require_matching_session() {
        let streaming = StreamPhase::Streaming(target(3));
        assert_eq!(
            streaming.apply(StreamTransition::Complete(target(2))),
            Err(StreamTransitionRejection::SessionMismatch {
                active: target(3),
                attempted: target(2),
            })
        );

        let cancelled = streaming.apply(StreamTransition::Cancel(target(3))).unwrap();
        assert_eq!(cancelled, StreamPhase::Cancelled(target(3)));
        assert_eq!(
            cancelled.apply(StreamTransition::Complete(target(3))),
            Err(StreamTransitionRejection::NoActiveStream)
        );
    }
}
