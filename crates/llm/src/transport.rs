use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::event::StreamEvent;
use crate::request::ChatRequest;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;
pub type CancelSignal = oneshot::Receiver<()>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("stream request for discussion '{discussion_id}' has an empty message"))]
    EmptyMessage {
        stage: &'static str,
        discussion_id: String,
    },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("connection to {url} failed on `{stage}`, {source}"))]
    Connect {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {detail}"))]
    Status {
        stage: &'static str,
        status: u16,
        detail: String,
    },
    #[snafu(display("stream read failed on `{stage}`, {source}"))]
    Read {
        stage: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[snafu(display("no data received from backend for {timeout:?}"))]
    IdleTimeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[snafu(display("failed to decode backend response on `{stage}`, {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
}

/// Receiving half of one turn's event stream.
///
/// Dropping the stream signals cancellation to the worker that feeds it.
pub struct EventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl EventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Waits for the next event; `None` once the worker has finished.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Asks the worker to stop at its next suspension point.
    ///
    /// Returns false when cancellation was already requested or the worker is gone.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// An opened connection: the consumer side plus the future that drives IO.
///
/// The caller decides where the worker runs (usually `tokio::spawn`).
pub struct StreamHandle {
    pub stream: EventStream,
    pub worker: TransportWorker,
}

/// Source of typed chat events for one turn.
pub trait StreamTransport: Send + Sync {
    /// Opens one single-use connection for `request`.
    ///
    /// Connection failures after this returns are delivered as a synthetic
    /// [`StreamEvent::Error`] rather than as an `Err`.
    fn open(&self, request: ChatRequest) -> TransportResult<StreamHandle>;
}

/// Creates the channel pair every transport feeds.
pub fn make_event_stream() -> (EventSender, EventStream, CancelSignal) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, EventStream::new(event_rx, cancel_tx), cancel_rx)
}

/// Surfaces a connection-level failure as the stream's terminal event.
pub(crate) fn emit_error_event(event_tx: &EventSender, error: &TransportError) {
    let _ = event_tx.send(StreamEvent::error(error.to_string()));
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn stream_yields_events_in_order_then_ends() {
        let (event_tx, stream, _cancel_rx) = make_event_stream();
        event_tx.send(StreamEvent::chunk("a")).unwrap();
        event_tx.send(StreamEvent::chunk("b")).unwrap();
        event_tx.send(StreamEvent::done()).unwrap();
        drop(event_tx);

        let events = stream.collect::<Vec<_>>().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::chunk("a"),
                StreamEvent::chunk("b"),
                StreamEvent::done()
            ]
        );
    }

    #[tokio::test]
    async fn cancel_signals_worker_once() {
        let (_event_tx, mut stream, cancel_rx) = make_event_stream();

        assert!(stream.cancel());
        assert!(stream.is_cancelled());
        assert!(!stream.cancel());
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn dropping_stream_signals_cancellation() {
        let (_event_tx, stream, cancel_rx) = make_event_stream();
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }
}
