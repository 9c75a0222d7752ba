//! Discussion collaborators: creation, navigation and message history.
use std::collections::HashMap;

use lectern_llm::{BoxFuture, error_detail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::chat::{ChatMessage, DiscussionId, IdError};

pub const DEFAULT_DISCUSSION_TITLE: &str = "New Chat";
const DISCUSSIONS_PATH: &str = "/api/discussions";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DiscussionError {
    #[snafu(display("discussion '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        id: DiscussionId,
    },
    #[snafu(display("request to {url} failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {detail}"))]
    Status {
        stage: &'static str,
        status: u16,
        detail: String,
    },
    #[snafu(display("failed to decode discussion response on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned an unusable discussion id on `{stage}`, {source}"))]
    InvalidId {
        stage: &'static str,
        source: IdError,
    },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
}

pub type DiscussionResult<T> = Result<T, DiscussionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discussion {
    pub id: DiscussionId,
    pub title: String,
}

/// Where discussions live. The controller calls it before a turn opens and
/// once per materialized message.
pub trait DiscussionService: Send + Sync {
    fn create_discussion<'a>(&'a self, title: &'a str) -> BoxFuture<'a, DiscussionResult<Discussion>>;

    /// Makes `id` the discussion the user is looking at.
    fn navigate_to(&self, id: DiscussionId) -> BoxFuture<'_, DiscussionResult<()>>;

    fn persist_message(&self, id: DiscussionId, message: &ChatMessage) -> DiscussionResult<()>;
}

#[derive(Debug, Clone)]
struct DiscussionRecord {
    title: String,
    messages: Vec<ChatMessage>,
}

/// Process-local discussions, used offline and in tests.
#[derive(Debug, Default)]
pub struct InMemoryDiscussions {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    order: Vec<DiscussionId>,
    records: HashMap<DiscussionId, DiscussionRecord>,
    active: Option<DiscussionId>,
}

impl InMemoryDiscussions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discussions(&self) -> Vec<Discussion> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| {
                inner.records.get(id).map(|record| Discussion {
                    id: *id,
                    title: record.title.clone(),
                })
            })
            .collect()
    }

    pub fn messages(&self, id: DiscussionId) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .records
            .get(&id)
            .map(|record| record.messages.clone())
            .unwrap_or_default()
    }

    pub fn active(&self) -> Option<DiscussionId> {
        self.inner.lock().active
    }

    fn insert(&self, title: &str) -> Discussion {
        let title = normalize_title(title);
        let id = DiscussionId::new_v7();
        let mut inner = self.inner.lock();
        inner.order.push(id);
        inner.records.insert(
            id,
            DiscussionRecord {
                title: title.clone(),
                messages: Vec::new(),
            },
        );
        Discussion { id, title }
    }
}

impl DiscussionService for InMemoryDiscussions {
    fn create_discussion<'a>(&'a self, title: &'a str) -> BoxFuture<'a, DiscussionResult<Discussion>> {
        Box::pin(async move { Ok(self.insert(title)) })
    }

    fn navigate_to(&self, id: DiscussionId) -> BoxFuture<'_, DiscussionResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            ensure!(
                inner.records.contains_key(&id),
                NotFoundSnafu {
                    stage: "navigate-discussion",
                    id,
                }
            );
            inner.active = Some(id);
            Ok(())
        })
    }

    fn persist_message(&self, id: DiscussionId, message: &ChatMessage) -> DiscussionResult<()> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&id).context(NotFoundSnafu {
            stage: "persist-message",
            id,
        })?;
        record.messages.push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CreateDiscussionBody<'a> {
    title: &'a str,
}

#[derive(Debug, Deserialize)]
struct DiscussionResponse {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

/// Discussions kept by the chat backend.
///
/// The backend stores both sides of a turn while streaming, so persisted
/// messages only land in the local history cache.
#[derive(Debug)]
pub struct HttpDiscussions {
    base_url: String,
    client: reqwest::Client,
    history: Mutex<HashMap<DiscussionId, Vec<ChatMessage>>>,
}

impl HttpDiscussions {
    pub fn new(base_url: impl Into<String>) -> DiscussionResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "build-discussion-client",
            })?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            client,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn messages(&self, id: DiscussionId) -> Vec<ChatMessage> {
        self.history.lock().get(&id).cloned().unwrap_or_default()
    }

    async fn post(
        &self,
        url: String,
        body: Option<&CreateDiscussionBody<'_>>,
        stage: &'static str,
    ) -> DiscussionResult<reqwest::Response> {
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.context(RequestSnafu {
            stage,
            url: url.clone(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage,
                status: status.as_u16(),
                detail: error_detail(&body),
            }
            .fail();
        }
        Ok(response)
    }
}

impl DiscussionService for HttpDiscussions {
    fn create_discussion<'a>(&'a self, title: &'a str) -> BoxFuture<'a, DiscussionResult<Discussion>> {
        Box::pin(async move {
            let title = normalize_title(title);
            let url = format!("{}{DISCUSSIONS_PATH}", self.base_url);
            let response = self
                .post(url, Some(&CreateDiscussionBody { title: &title }), "create-discussion")
                .await?;
            let created = response
                .json::<DiscussionResponse>()
                .await
                .context(DecodeSnafu {
                    stage: "decode-created-discussion",
                })?;
            let id = DiscussionId::parse(&created.id).context(InvalidIdSnafu {
                stage: "parse-created-discussion-id",
            })?;

            tracing::info!(discussion = %id, "created discussion");
            Ok(Discussion {
                id,
                title: created.title.unwrap_or(title),
            })
        })
    }

    fn navigate_to(&self, id: DiscussionId) -> BoxFuture<'_, DiscussionResult<()>> {
        Box::pin(async move {
            let url = format!("{}{DISCUSSIONS_PATH}/{id}/activate", self.base_url);
            self.post(url, None, "activate-discussion").await?;
            Ok(())
        })
    }

    fn persist_message(&self, id: DiscussionId, message: &ChatMessage) -> DiscussionResult<()> {
        self.history
            .lock()
            .entry(id)
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

fn normalize_title(title: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        DEFAULT_DISCUSSION_TITLE.to_string()
    } else {
        title.to_string()
    }
}
