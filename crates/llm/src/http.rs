use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::request::ChatRequest;
use crate::sse::SseDecoder;
use crate::transport::{
    BuildClientSnafu, CancelSignal, ConnectSnafu, DecodeResponseSnafu, EmptyMessageSnafu,
    EventSender, StreamHandle, StreamTransport, TransportError, TransportResult, TransportWorker,
    emit_error_event, make_event_stream,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const STREAM_PATH: &str = "/api/chat/stream";
pub const PROVIDERS_PATH: &str = "/api/chat/providers";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// One entry of the backend's provider listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub configured: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderListing {
    providers: Vec<ProviderInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Streams chat events from the backend over HTTP server-sent events.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: TransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Lists the LLM providers the backend can route a turn to.
    pub async fn list_providers(&self) -> TransportResult<Vec<ProviderInfo>> {
        let url = self.config.url(PROVIDERS_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(ConnectSnafu {
                stage: "send-provider-request",
                url: url.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                stage: "provider-http-status",
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        let listing = response
            .json::<ProviderListing>()
            .await
            .context(DecodeResponseSnafu {
                stage: "decode-provider-listing",
            })?;
        Ok(listing.providers)
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        url: String,
        request: ChatRequest,
        idle_timeout: Duration,
        event_tx: EventSender,
        mut cancel_rx: CancelSignal,
    ) {
        let discussion_id = request.discussion_id.clone();
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(%discussion_id, "stream cancelled before the backend responded");
                return;
            }
            response = tokio::time::timeout(idle_timeout, client.post(&url).json(&request).send()) => response,
        };

        let response = match response {
            Ok(response) => response.context(ConnectSnafu {
                stage: "send-stream-request",
                url: url.clone(),
            }),
            Err(_) => Err(TransportError::IdleTimeout {
                stage: "await-stream-headers",
                timeout: idle_timeout,
            }),
        };
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(%discussion_id, error = %error, "failed to open chat stream");
                emit_error_event(&event_tx, &error);
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = TransportError::Status {
                stage: "stream-http-status",
                status: status.as_u16(),
                detail: error_detail(&body),
            };
            tracing::error!(%discussion_id, error = %error, "backend rejected chat stream");
            emit_error_event(&event_tx, &error);
            return;
        }

        tracing::debug!(%discussion_id, status = status.as_u16(), "chat stream opened");
        pump_events(
            Box::pin(response.bytes_stream()),
            idle_timeout,
            &event_tx,
            cancel_rx,
        )
        .await;
    }
}

impl StreamTransport for HttpTransport {
    fn open(&self, request: ChatRequest) -> TransportResult<StreamHandle> {
        ensure!(
            !request.message.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "open-stream",
                discussion_id: request.discussion_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.url(STREAM_PATH),
            request,
            self.config.idle_timeout,
            event_tx,
            cancel_rx,
        ));

        Ok(StreamHandle { stream, worker })
    }
}

/// Decodes a response body into events until it ends, fails, goes idle, or is cancelled.
///
/// Forwarding stops after the first terminal event.
pub(crate) async fn pump_events<S, E>(
    mut body: S,
    idle_timeout: Duration,
    event_tx: &EventSender,
    mut cancel_rx: CancelSignal,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(pending_bytes = decoder.pending_len(), "chat stream cancelled");
                return;
            }
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };

        match next {
            Ok(Some(Ok(bytes))) => {
                for event in decoder.push(&bytes) {
                    let terminal = event.is_terminal();
                    if event_tx.send(event).is_err() || terminal {
                        return;
                    }
                }
            }
            Ok(Some(Err(source))) => {
                let error = TransportError::Read {
                    stage: "read-stream-body",
                    source: Box::new(source),
                };
                tracing::error!(error = %error, "chat stream connection failed");
                emit_error_event(event_tx, &error);
                return;
            }
            Ok(None) => break,
            Err(_) => {
                let error = TransportError::IdleTimeout {
                    stage: "read-stream-body",
                    timeout: idle_timeout,
                };
                tracing::error!(error = %error, "chat stream went idle");
                emit_error_event(event_tx, &error);
                return;
            }
        }
    }

    if let Some(event) = decoder.finish() {
        let _ = event_tx.send(event);
    }
    tracing::debug!("chat stream body exhausted");
}

/// Message from a non-2xx body; FastAPI-style `{"detail": ...}` when present.
pub fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.detail,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}
