//! Event transport for streamed chat turns.
//!
//! Decodes the backend's server-sent event stream into typed [`StreamEvent`]s
//! and hands them to the consumer over a cancellable [`EventStream`].
mod event;
mod http;
mod request;
mod sse;
mod transport;

pub use event::{Intent, Source, StreamEvent};
pub use http::{
    DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, HttpTransport,
    PROVIDERS_PATH, ProviderInfo, STREAM_PATH, TransportConfig, error_detail,
};
pub use request::{ChatRequest, ResearchMode};
pub use sse::SseDecoder;
pub use transport::{
    BoxFuture, CancelSignal, EventSender, EventStream, StreamHandle, StreamTransport,
    TransportError, TransportResult, TransportWorker, make_event_stream,
};
