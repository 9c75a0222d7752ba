pub mod buffer;
pub mod citations;
pub mod controller;
pub mod events;
pub mod ids;
pub mod message;
pub mod state;

pub use buffer::{
    ChunkBuffer, DEFAULT_FLUSH_INTERVAL, FlushCallback, FlushScheduler, FlushSink, ManualScheduler,
    ScheduledFlush, TokioFrameScheduler,
};
pub use citations::SourceCitations;
pub use controller::{
    ControllerError, ControllerResult, DEFAULT_PROVIDER, StreamController, TurnHandle,
    TurnOptions,
};
pub use events::{ChatUpdate, TurnOutcome};
pub use ids::{DiscussionId, IdError, IdResult, MessageId};
pub use message::{
    ChatMessage, Role, StreamPhase, StreamSessionId, StreamTarget, StreamTransition,
    StreamTransitionRejection, StreamTransitionResult,
};
pub use state::StreamState;
