//! One streaming turn, end to end.
//!
//! [`StreamController::send_message`] opens the transport and returns a
//! [`TurnHandle`]. Events are then consumed either by
//! [`StreamController::run_turn`] or, for hosts with their own event loop, by
//! feeding [`StreamController::handle_event`]. Every entry point checks the
//! handle against the active turn, so a stale or already-finished handle is
//! rejected instead of touching the next turn's state.
use std::sync::Arc;
use std::time::Instant;

use lectern_llm::{
    ChatRequest, EventStream, Intent, ResearchMode, StreamEvent, StreamTransport, TransportError,
};
use lectern_render::{incremental, render_final};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::buffer::{ChunkBuffer, FlushScheduler};
use crate::chat::citations::SourceCitations;
use crate::chat::events::{ChatUpdate, TurnOutcome};
use crate::chat::ids::DiscussionId;
use crate::chat::message::{
    ChatMessage, StreamPhase, StreamSessionId, StreamTarget, StreamTransition,
    StreamTransitionRejection,
};
use crate::chat::state::StreamState;
use crate::discussion::{DEFAULT_DISCUSSION_TITLE, Discussion, DiscussionError, DiscussionService};

pub const DEFAULT_PROVIDER: &str = "mistral";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ControllerError {
    #[snafu(display("refusing to send an empty message on `{stage}`"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("turn {active} is still streaming on `{stage}`"))]
    TurnActive {
        stage: &'static str,
        active: StreamTarget,
    },
    #[snafu(display("turn {target} is not the active turn on `{stage}`"))]
    StaleTurn {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("failed to create discussion on `{stage}`, {source}"))]
    CreateDiscussion {
        stage: &'static str,
        source: DiscussionError,
    },
    #[snafu(display("failed to persist message on `{stage}`, {source}"))]
    PersistMessage {
        stage: &'static str,
        source: DiscussionError,
    },
    #[snafu(display("failed to open stream on `{stage}`, {source}"))]
    OpenTransport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("illegal stream transition on `{stage}`: {rejection}"))]
    Transition {
        stage: &'static str,
        rejection: StreamTransitionRejection,
    },
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Per-turn request settings that are not part of the message itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOptions {
    pub provider: String,
    pub research_mode: ResearchMode,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub document_ids: Vec<String>,
    pub attachment_ids: Vec<String>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER)
    }
}

impl TurnOptions {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            research_mode: ResearchMode::default(),
            temperature: None,
            max_tokens: None,
            document_ids: Vec::new(),
            attachment_ids: Vec::new(),
        }
    }

    fn request(&self, discussion_id: DiscussionId, message: String) -> ChatRequest {
        let mut request = ChatRequest::new(discussion_id.to_string(), message, &self.provider)
            .with_research_mode(self.research_mode)
            .with_document_ids(self.document_ids.clone())
            .with_attachment_ids(self.attachment_ids.clone());
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

/// Caller's token for one turn.
///
/// Clones share the stop signal, so a UI task can stop a turn that another
/// task is driving with [`StreamController::run_turn`].
#[derive(Debug, Clone)]
pub struct TurnHandle {
    target: StreamTarget,
    stop: CancellationToken,
}

impl TurnHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Asks the running turn loop to stop at its next suspension point.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }
}

struct ActiveTurn {
    target: StreamTarget,
    stream: EventStream,
    worker: JoinHandle<()>,
    buffer: ChunkBuffer,
    flushed: mpsc::UnboundedReceiver<String>,
    state: StreamState,
    started_at: Instant,
}

enum Step {
    Stop,
    Batch(String),
    Event(Option<StreamEvent>),
}

pub struct StreamController {
    transport: Arc<dyn StreamTransport>,
    discussions: Arc<dyn DiscussionService>,
    scheduler: Arc<dyn FlushScheduler>,
    options: TurnOptions,
    phase: StreamPhase,
    discussion: Option<Discussion>,
    history: Vec<ChatMessage>,
    active: Option<ActiveTurn>,
    next_session_id: u64,
    updates: mpsc::UnboundedSender<ChatUpdate>,
}

impl StreamController {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        discussions: Arc<dyn DiscussionService>,
        scheduler: Arc<dyn FlushScheduler>,
        options: TurnOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let controller = Self {
            transport,
            discussions,
            scheduler,
            options,
            phase: StreamPhase::Idle,
            discussion: None,
            history: Vec::new(),
            active: None,
            next_session_id: 0,
            updates,
        };
        (controller, updates_rx)
    }

    /// Continues an existing discussion instead of creating one on first send.
    pub fn with_discussion(mut self, discussion: Discussion, history: Vec<ChatMessage>) -> Self {
        self.discussion = Some(discussion);
        self.history = history;
        self
    }

    pub fn phase(&self) -> &StreamPhase {
        &self.phase
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn discussion(&self) -> Option<&Discussion> {
        self.discussion.as_ref()
    }

    pub fn options(&self) -> &TurnOptions {
        &self.options
    }

    pub fn active_target(&self) -> Option<StreamTarget> {
        self.active.as_ref().map(|active| active.target)
    }

    /// Text delivered so far for the active turn.
    pub fn content(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.state.accumulated())
    }

    /// Starts a turn for `content`.
    ///
    /// Creates and navigates to a discussion first when none is in scope,
    /// because its id is part of the request.
    pub async fn send_message(&mut self, content: impl Into<String>) -> ControllerResult<TurnHandle> {
        let content = content.into();
        ensure!(
            !content.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "send-message",
            }
        );
        if let Some(active) = &self.active {
            return TurnActiveSnafu {
                stage: "send-message",
                active: active.target,
            }
            .fail();
        }

        let discussion = self.ensure_discussion().await?;
        let user_message = ChatMessage::user(content.clone());
        self.discussions
            .persist_message(discussion.id, &user_message)
            .context(PersistMessageSnafu {
                stage: "persist-user-message",
            })?;
        self.history.push(user_message.clone());

        self.next_session_id = self.next_session_id.saturating_add(1);
        let target = StreamTarget::new(discussion.id, StreamSessionId::new(self.next_session_id));
        self.transition(StreamTransition::Start(target), "start-turn")?;

        let opened = self.transport.open(self.options.request(discussion.id, content));
        let handle = match opened {
            Ok(handle) => handle,
            Err(source) => {
                self.reset_to_idle();
                return Err(ControllerError::OpenTransport {
                    stage: "open-transport",
                    source,
                });
            }
        };

        let (flushed_tx, flushed) = mpsc::unbounded_channel();
        self.active = Some(ActiveTurn {
            target,
            stream: handle.stream,
            worker: tokio::spawn(handle.worker),
            buffer: ChunkBuffer::new(self.scheduler.clone(), flushed_tx),
            flushed,
            state: StreamState::new(),
            started_at: Instant::now(),
        });

        tracing::info!(turn = %target, provider = %self.options.provider, "turn started");
        self.emit(ChatUpdate::TurnStarted {
            target,
            user_message,
        });

        Ok(TurnHandle {
            target,
            stop: CancellationToken::new(),
        })
    }

    /// Consumes the turn's events until it terminates.
    ///
    /// Flushed batches are applied between events; a stop request through the
    /// handle wins over anything still queued.
    pub async fn run_turn(&mut self, handle: &TurnHandle) -> ControllerResult<TurnOutcome> {
        self.ensure_current(handle, "run-turn")?;

        loop {
            let Some(active) = self.active.as_mut() else {
                return StaleTurnSnafu {
                    stage: "run-turn",
                    target: handle.target,
                }
                .fail();
            };

            let step = tokio::select! {
                biased;
                _ = handle.stop.cancelled() => Step::Stop,
                Some(batch) = active.flushed.recv() => Step::Batch(batch),
                event = active.stream.recv() => Step::Event(event),
            };

            match step {
                Step::Stop => return Ok(self.finish(TurnOutcome::Cancelled)),
                Step::Batch(batch) => self.append_batches(std::iter::once(batch)),
                Step::Event(Some(event)) => {
                    if let Some(outcome) = self.apply_event(event) {
                        return Ok(outcome);
                    }
                }
                Step::Event(None) => {
                    tracing::warn!(
                        turn = %handle.target,
                        "stream ended without a terminal event, finalizing"
                    );
                    return Ok(self.finish(TurnOutcome::Finalized));
                }
            }
        }
    }

    /// Applies one event to the turn. Returns the outcome when it ended the turn.
    pub fn handle_event(
        &mut self,
        handle: &TurnHandle,
        event: StreamEvent,
    ) -> ControllerResult<Option<TurnOutcome>> {
        self.ensure_current(handle, "handle-event")?;
        self.drain_flushed();
        Ok(self.apply_event(event))
    }

    /// Applies batches the scheduler has already flushed, without forcing one.
    ///
    /// Hosts that feed [`StreamController::handle_event`] from their own loop
    /// call this once per frame so listeners see text while the stream pauses.
    pub fn poll_flushed(&mut self, handle: &TurnHandle) -> ControllerResult<()> {
        self.ensure_current(handle, "poll-flushed")?;
        self.drain_flushed();
        Ok(())
    }

    /// Delivers buffered text now instead of at the next frame.
    pub fn flush(&mut self, handle: &TurnHandle) -> ControllerResult<()> {
        self.ensure_current(handle, "flush")?;
        if let Some(active) = &self.active {
            active.buffer.flush();
        }
        self.drain_flushed();
        Ok(())
    }

    /// Stops the turn and keeps what arrived so far as a stopped message.
    pub fn stop_stream(&mut self, handle: &TurnHandle) -> ControllerResult<TurnOutcome> {
        self.ensure_current(handle, "stop-stream")?;
        handle.request_stop();
        Ok(self.finish(TurnOutcome::Cancelled))
    }

    async fn ensure_discussion(&mut self) -> ControllerResult<Discussion> {
        if let Some(discussion) = &self.discussion {
            return Ok(discussion.clone());
        }

        let created = self
            .discussions
            .create_discussion(DEFAULT_DISCUSSION_TITLE)
            .await
            .context(CreateDiscussionSnafu {
                stage: "create-discussion",
            })?;
        if let Err(error) = self.discussions.navigate_to(created.id).await {
            tracing::warn!(discussion = %created.id, error = %error, "failed to navigate to new discussion");
        }

        tracing::info!(discussion = %created.id, "adopted new discussion");
        self.discussion = Some(created.clone());
        self.emit(ChatUpdate::TitleChanged {
            discussion_id: created.id,
            title: created.title.clone(),
        });
        Ok(created)
    }

    fn ensure_current(&self, handle: &TurnHandle, stage: &'static str) -> ControllerResult<()> {
        match &self.active {
            Some(active)
                if active.target == handle.target
                    && self.phase.accepts_stream_event(handle.target) =>
            {
                Ok(())
            }
            _ => StaleTurnSnafu {
                stage,
                target: handle.target,
            }
            .fail(),
        }
    }

    fn apply_event(&mut self, event: StreamEvent) -> Option<TurnOutcome> {
        let active = self.active.as_mut()?;
        let target = active.target;
        tracing::debug!(turn = %target, kind = event.kind(), "stream event");

        match event {
            StreamEvent::Chunk { content } => {
                active.buffer.push(&content);
                None
            }
            StreamEvent::Sources { sources } => {
                active.state.set_sources(sources.clone());
                self.emit(ChatUpdate::SourcesUpdated { target, sources });
                None
            }
            StreamEvent::Intent { intent, label } => {
                let intent = Intent::new(intent, label);
                active.state.set_intent(intent.clone());
                self.emit(ChatUpdate::IntentUpdated { target, intent });
                None
            }
            StreamEvent::SuggestedQuestions { questions } => {
                active.state.set_suggested_questions(questions.clone());
                self.emit(ChatUpdate::SuggestedQuestionsUpdated { target, questions });
                None
            }
            StreamEvent::DiscussionTitle {
                discussion_id,
                title,
            } => {
                self.apply_title(&discussion_id, title);
                None
            }
            StreamEvent::Error { error } => {
                Some(self.finish(TurnOutcome::Errored { message: error }))
            }
            StreamEvent::Done {} => Some(self.finish(TurnOutcome::Finalized)),
        }
    }

    fn apply_title(&mut self, discussion_id: &str, title: String) {
        let Some(discussion) = self.discussion.as_mut() else {
            return;
        };
        if DiscussionId::parse(discussion_id).ok() != Some(discussion.id) {
            tracing::debug!(discussion = discussion_id, "ignoring title for another discussion");
            return;
        }

        discussion.title = title.clone();
        let discussion_id = discussion.id;
        self.emit(ChatUpdate::TitleChanged {
            discussion_id,
            title,
        });
    }

    fn drain_flushed(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let mut batches = Vec::new();
        while let Ok(batch) = active.flushed.try_recv() {
            batches.push(batch);
        }
        self.append_batches(batches);
    }

    fn append_batches(&mut self, batches: impl IntoIterator<Item = String>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let mut appended = false;
        for batch in batches {
            appended |= active.state.append(&batch);
        }
        if !appended {
            return;
        }

        let content = active.state.accumulated().to_string();
        let html = incremental::render(&content);
        let target = active.target;
        self.emit(ChatUpdate::ContentUpdated {
            target,
            content,
            html,
        });
    }

    /// Materializes the turn's one assistant message and returns to idle.
    fn finish(&mut self, outcome: TurnOutcome) -> TurnOutcome {
        if let Some(active) = &self.active {
            active.buffer.flush();
        }
        self.drain_flushed();

        let Some(mut active) = self.active.take() else {
            return outcome;
        };
        let target = active.target;
        active.state.terminate();
        if active.stream.cancel() {
            tracing::debug!(turn = %target, "asked transport worker to stop");
        }
        active.worker.abort();

        let transition = match &outcome {
            TurnOutcome::Finalized => StreamTransition::Complete(target),
            TurnOutcome::Errored { message } => StreamTransition::Fail {
                target,
                message: message.clone(),
            },
            TurnOutcome::Cancelled => StreamTransition::Cancel(target),
        };
        if let Err(error) = self.transition(transition, "finish-turn") {
            tracing::warn!(turn = %target, error = %error, "unexpected phase while finishing turn");
        }

        let message = self.materialize(&active, &outcome);
        if let Err(error) = self.discussions.persist_message(target.discussion_id, &message) {
            tracing::warn!(turn = %target, error = %error, "failed to persist assistant message");
        }

        let sources = message.sources.as_deref().unwrap_or_default();
        let html = render_final(&message.content, &SourceCitations::new(sources));
        self.history.push(message.clone());

        match &outcome {
            TurnOutcome::Errored { message } => {
                tracing::error!(turn = %target, error = %message, "turn failed");
            }
            TurnOutcome::Finalized | TurnOutcome::Cancelled => {
                tracing::info!(turn = %target, outcome = ?outcome, "turn finished");
            }
        }
        self.emit(ChatUpdate::MessageFinalized {
            target,
            message,
            outcome: outcome.clone(),
            html,
        });

        self.reset_to_idle();
        outcome
    }

    fn reset_to_idle(&mut self) {
        if let Err(error) = self.transition(StreamTransition::ResetToIdle, "reset-to-idle") {
            tracing::warn!(error = %error, "forcing phase back to idle");
            self.phase = StreamPhase::Idle;
        }
    }

    fn materialize(&self, active: &ActiveTurn, outcome: &TurnOutcome) -> ChatMessage {
        let accumulated = active.state.accumulated();
        let content = match outcome {
            TurnOutcome::Errored { message } if accumulated.is_empty() => {
                format!("Error: {message}")
            }
            TurnOutcome::Errored { message } => format!("{accumulated}\n\nError: {message}"),
            TurnOutcome::Finalized | TurnOutcome::Cancelled => accumulated.to_string(),
        };

        let mut message = ChatMessage::assistant(content);
        message.stopped = matches!(outcome, TurnOutcome::Cancelled);
        message.sources = non_empty(active.state.sources().to_vec());
        message.suggested_questions = non_empty(active.state.suggested_questions().to_vec());
        message.intent = active.state.intent().cloned();
        message.provider = Some(self.options.provider.clone());
        message.response_time_ms =
            Some(u64::try_from(active.started_at.elapsed().as_millis()).unwrap_or(u64::MAX));
        message
    }

    fn transition(
        &mut self,
        transition: StreamTransition,
        stage: &'static str,
    ) -> ControllerResult<()> {
        let next = self
            .phase
            .apply(transition)
            .map_err(|rejection| ControllerError::Transition { stage, rejection })?;
        self.phase = next;
        Ok(())
    }

    fn emit(&self, update: ChatUpdate) {
        if self.updates.send(update).is_err() {
            tracing::trace!("no listener for chat updates");
        }
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lectern_llm::{
        EventSender, HttpTransport, STREAM_PATH, Source, StreamHandle, TransportConfig,
        TransportResult, make_event_stream,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use regex::Regex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::chat::buffer::{ManualScheduler, TokioFrameScheduler};
    use crate::chat::message::Role;
    use crate::discussion::InMemoryDiscussions;

    /// Hands each opened stream's sender to the test.
    #[derive(Default)]
    struct ChannelTransport {
        senders: Mutex<Vec<EventSender>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ChannelTransport {
        fn sender(&self) -> EventSender {
            self.senders.lock().last().cloned().unwrap()
        }

        fn close(&self) {
            self.senders.lock().clear();
        }
    }

    impl StreamTransport for ChannelTransport {
        fn open(&self, request: ChatRequest) -> TransportResult<StreamHandle> {
            let (event_tx, stream, cancel_rx) = make_event_stream();
            self.requests.lock().push(request);
            self.senders.lock().push(event_tx);
            Ok(StreamHandle {
                stream,
                worker: Box::pin(async move {
                    let _ = cancel_rx.await;
                }),
            })
        }
    }

    struct Fixture {
        controller: StreamController,
        updates: mpsc::UnboundedReceiver<ChatUpdate>,
        transport: Arc<ChannelTransport>,
        discussions: Arc<InMemoryDiscussions>,
    }

    fn fixture(scheduler: Arc<dyn FlushScheduler>) -> Fixture {
        let transport = Arc::new(ChannelTransport::default());
        let discussions = Arc::new(InMemoryDiscussions::new());
        let (controller, updates) = StreamController::new(
            transport.clone(),
            discussions.clone(),
            scheduler,
            TurnOptions::new("claude"),
        );
        Fixture {
            controller,
            updates,
            transport,
            discussions,
        }
    }

    fn drain_updates(updates: &mut mpsc::UnboundedReceiver<ChatUpdate>) -> Vec<ChatUpdate> {
        let mut drained = Vec::new();
        while let Ok(update) = updates.try_recv() {
            drained.push(update);
        }
        drained
    }

    fn assistant_messages(controller: &StreamController) -> Vec<&ChatMessage> {
        controller
            .history()
            .iter()
            .filter(|message| message.role == Role::Assistant)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn error_after_two_chunks_keeps_partial_answer() {
        let mut fx = fixture(Arc::new(TokioFrameScheduler::default()));
        let handle = fx.controller.send_message("What is the answer?").await.unwrap();

        let sender = fx.transport.sender();
        sender.send(StreamEvent::chunk("Partial answer: ")).unwrap();
        sender.send(StreamEvent::chunk("42")).unwrap();
        sender.send(StreamEvent::error("model overloaded")).unwrap();

        let outcome = fx.controller.run_turn(&handle).await.unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Errored {
                message: "model overloaded".to_string()
            }
        );
        assert!(fx.controller.phase().is_idle());
        let assistant = assistant_messages(&fx.controller);
        assert_eq!(assistant.len(), 1);
        assert_eq!(
            assistant[0].content,
            "Partial answer: 42\n\nError: model overloaded"
        );
        assert_eq!(assistant[0].provider.as_deref(), Some("claude"));

        let discussion = fx.controller.discussion().unwrap().id;
        assert_eq!(fx.discussions.messages(discussion).len(), 2);
    }

    #[tokio::test]
    async fn error_without_text_is_the_whole_message() {
        let mut fx = fixture(Arc::new(ManualScheduler::new()));
        let handle = fx.controller.send_message("hi").await.unwrap();

        fx.controller
            .handle_event(&handle, StreamEvent::error("backend returned status 500: boom"))
            .unwrap();

        assert_eq!(
            assistant_messages(&fx.controller)[0].content,
            "Error: backend returned status 500: boom"
        );
    }

    #[tokio::test]
    async fn fragments_converge_on_one_shot_render() {
        let scheduler = Arc::new(ManualScheduler::new());
        let mut fx = fixture(scheduler.clone());
        let handle = fx.controller.send_message("greet").await.unwrap();

        for fragment in ["Hel", "lo **wor", "ld**"] {
            fx.controller
                .handle_event(&handle, StreamEvent::chunk(fragment))
                .unwrap();
            scheduler.run_frame();
            fx.controller.flush(&handle).unwrap();
        }
        assert_eq!(fx.controller.content(), Some("Hello **world**"));

        let outcome = fx
            .controller
            .handle_event(&handle, StreamEvent::done())
            .unwrap();
        assert_eq!(outcome, Some(TurnOutcome::Finalized));

        let updates = drain_updates(&mut fx.updates);
        let contents = updates
            .iter()
            .filter_map(|update| match update {
                ChatUpdate::ContentUpdated { content, html, .. } => Some((content, html)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(contents.len(), 3);
        let (content, html) = contents[2];
        assert_eq!(content, "Hello **world**");
        assert_eq!(html, "<p>Hello <strong>world</strong></p>");

        let finalized_html = updates.iter().find_map(|update| match update {
            ChatUpdate::MessageFinalized { html, .. } => Some(html.clone()),
            _ => None,
        });
        assert_eq!(
            finalized_html.as_deref(),
            Some("<p>Hello <strong>world</strong></p>\n")
        );
    }

    #[tokio::test]
    async fn scheduled_flush_reaches_listeners_without_forcing() {
        let scheduler = Arc::new(ManualScheduler::new());
        let mut fx = fixture(scheduler.clone());
        let handle = fx.controller.send_message("hi").await.unwrap();
        drain_updates(&mut fx.updates);

        fx.controller
            .handle_event(&handle, StreamEvent::chunk("hello"))
            .unwrap();
        fx.controller.poll_flushed(&handle).unwrap();
        assert_eq!(fx.controller.content(), Some(""));
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(scheduler.run_frame(), 1);
        fx.controller.poll_flushed(&handle).unwrap();

        assert_eq!(fx.controller.content(), Some("hello"));
        let updates = drain_updates(&mut fx.updates);
        assert!(matches!(
            updates.as_slice(),
            [ChatUpdate::ContentUpdated { content, .. }] if content == "hello"
        ));
    }

    #[tokio::test]
    async fn random_batching_converges_and_stays_escaped() {
        let text = "# Plan <v2>\n\nUse **bold & brave** and *soft* text.\n- one\n- `a<b>`\n\n---\n\
                    1. done & dusted\n```html\n<b>x</b>\n```\ntail";
        let tags = Regex::new(
            r#"</?(?:p|br|hr|h[1-4]|strong|em|code|pre|div|span)(?: class="[\w -]+")?>"#,
        )
        .unwrap();
        let entities = Regex::new(r"&(?:amp|lt|gt);").unwrap();

        for seed in [7_u64, 42, 1234, 99_991] {
            let scheduler = Arc::new(ManualScheduler::new());
            let mut fx = fixture(scheduler.clone());
            let handle = fx.controller.send_message("render").await.unwrap();

            let mut state = seed;
            let mut rest = text;
            while !rest.is_empty() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let split = (1 + (state % 9) as usize).min(rest.len());
                let (fragment, tail) = rest.split_at(split);
                fx.controller
                    .handle_event(&handle, StreamEvent::chunk(fragment))
                    .unwrap();
                if state % 3 == 0 {
                    scheduler.run_frame();
                    fx.controller.poll_flushed(&handle).unwrap();
                }
                rest = tail;
            }
            scheduler.run_frame();
            fx.controller.poll_flushed(&handle).unwrap();

            let rendered = drain_updates(&mut fx.updates)
                .into_iter()
                .filter_map(|update| match update {
                    ChatUpdate::ContentUpdated { html, .. } => Some(html),
                    _ => None,
                })
                .collect::<Vec<_>>();
            assert!(rendered.len() > 1, "seed {seed}");
            assert_eq!(rendered.last(), Some(&incremental::render(text)), "seed {seed}");
            for html in &rendered {
                let without_tags = tags.replace_all(html, "");
                let plain = entities.replace_all(&without_tags, "");
                assert!(
                    !plain.contains(['<', '>', '&']),
                    "seed {seed} leaked markup: {html}"
                );
            }
        }
    }

    #[tokio::test]
    async fn continues_an_existing_discussion() {
        let transport = Arc::new(ChannelTransport::default());
        let discussions = Arc::new(InMemoryDiscussions::new());
        let existing = discussions.create_discussion("Budget").await.unwrap();
        let (controller, _updates) = StreamController::new(
            transport.clone(),
            discussions.clone(),
            Arc::new(ManualScheduler::new()),
            TurnOptions::default(),
        );
        let mut controller =
            controller.with_discussion(existing.clone(), vec![ChatMessage::user("earlier")]);

        let handle = controller.send_message("follow up").await.unwrap();

        assert_eq!(handle.target().discussion_id, existing.id);
        assert_eq!(discussions.discussions(), vec![existing.clone()]);
        assert_eq!(discussions.messages(existing.id).len(), 1);
        assert_eq!(controller.history().len(), 2);
        let requests = transport.requests.lock().clone();
        assert_eq!(requests[0].discussion_id, existing.id.to_string());
        assert_eq!(requests[0].provider, DEFAULT_PROVIDER);
    }

    #[tokio::test]
    async fn terminal_handlers_materialize_exactly_once() {
        let mut fx = fixture(Arc::new(ManualScheduler::new()));
        let first = fx.controller.send_message("one").await.unwrap();

        fx.controller
            .handle_event(&first, StreamEvent::chunk("answer"))
            .unwrap();
        fx.controller
            .handle_event(&first, StreamEvent::done())
            .unwrap();

        assert!(matches!(
            fx.controller.handle_event(&first, StreamEvent::done()),
            Err(ControllerError::StaleTurn { .. })
        ));
        assert!(matches!(
            fx.controller.stop_stream(&first),
            Err(ControllerError::StaleTurn { .. })
        ));
        assert!(fx.controller.flush(&first).is_err());
        assert_eq!(assistant_messages(&fx.controller).len(), 1);

        // A handle from the previous turn cannot reach the next one.
        let second = fx.controller.send_message("two").await.unwrap();
        assert_ne!(first.target(), second.target());
        assert!(
            fx.controller
                .handle_event(&first, StreamEvent::chunk("stray"))
                .is_err()
        );
        assert_eq!(fx.controller.active_target(), Some(second.target()));
    }

    #[tokio::test]
    async fn stop_keeps_unflushed_text_and_flags_message() {
        let scheduler = Arc::new(ManualScheduler::new());
        let mut fx = fixture(scheduler.clone());
        let handle = fx.controller.send_message("long one").await.unwrap();

        fx.controller
            .handle_event(&handle, StreamEvent::chunk("first "))
            .unwrap();
        scheduler.run_frame();
        fx.controller
            .handle_event(&handle, StreamEvent::chunk("second"))
            .unwrap();

        let outcome = fx.controller.stop_stream(&handle).unwrap();

        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert!(handle.is_stop_requested());
        let assistant = assistant_messages(&fx.controller);
        assert_eq!(assistant[0].content, "first second");
        assert!(assistant[0].stopped);
        assert_eq!(scheduler.pending(), 0);
        assert!(fx.controller.phase().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_interrupts_running_turn() {
        let mut fx = fixture(Arc::new(TokioFrameScheduler::new(Duration::from_millis(50))));
        let handle = fx.controller.send_message("keep going").await.unwrap();
        fx.transport.sender().send(StreamEvent::chunk("kept")).unwrap();

        let stopper = handle.clone();
        let (outcome, ()) = tokio::join!(fx.controller.run_turn(&handle), async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            stopper.request_stop();
        });

        assert_eq!(outcome.unwrap(), TurnOutcome::Cancelled);
        let assistant = assistant_messages(&fx.controller);
        assert_eq!(assistant[0].content, "kept");
        assert!(assistant[0].stopped);
    }

    #[tokio::test]
    async fn creates_discussion_before_opening_transport() {
        let mut fx = fixture(Arc::new(ManualScheduler::new()));
        let handle = fx.controller.send_message("first question").await.unwrap();

        let discussions = fx.discussions.discussions();
        assert_eq!(discussions.len(), 1);
        let discussion = &discussions[0];
        assert_eq!(handle.target().discussion_id, discussion.id);
        assert_eq!(fx.discussions.active(), Some(discussion.id));

        let requests = fx.transport.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].discussion_id, discussion.id.to_string());
        assert_eq!(requests[0].message, "first question");
        assert_eq!(requests[0].provider, "claude");

        let updates = drain_updates(&mut fx.updates);
        assert!(matches!(
            &updates[0],
            ChatUpdate::TitleChanged { title, .. } if title == DEFAULT_DISCUSSION_TITLE
        ));
        assert!(matches!(&updates[1], ChatUpdate::TurnStarted { .. }));
    }

    #[tokio::test]
    async fn rejects_second_send_while_streaming() {
        let mut fx = fixture(Arc::new(ManualScheduler::new()));
        let handle = fx.controller.send_message("one").await.unwrap();

        let error = fx.controller.send_message("two").await.unwrap_err();
        assert!(matches!(error, ControllerError::TurnActive { active, .. } if active == handle.target()));
        assert!(matches!(
            fx.controller.send_message("   ").await,
            Err(ControllerError::EmptyMessage { .. })
        ));
        assert_eq!(fx.transport.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn auxiliary_events_update_state_and_listeners() {
        let mut fx = fixture(Arc::new(ManualScheduler::new()));
        let handle = fx.controller.send_message("budget?").await.unwrap();
        let discussion_id = handle.target().discussion_id;
        drain_updates(&mut fx.updates);

        let events = [
            StreamEvent::Intent {
                intent: "summarize".to_string(),
                label: "Summary".to_string(),
            },
            StreamEvent::Sources {
                sources: vec![Source::new("d1", "report.pdf").with_citation_number(1)],
            },
            StreamEvent::DiscussionTitle {
                discussion_id: DiscussionId::new_v7().to_string(),
                title: "Someone else".to_string(),
            },
            StreamEvent::DiscussionTitle {
                discussion_id: discussion_id.to_string(),
                title: "Budget review".to_string(),
            },
            StreamEvent::chunk("See [1]."),
            StreamEvent::SuggestedQuestions {
                questions: vec!["And 2025?".to_string()],
            },
            StreamEvent::done(),
        ];
        for event in events {
            fx.controller.handle_event(&handle, event).unwrap();
        }

        assert_eq!(fx.controller.discussion().unwrap().title, "Budget review");
        let message = assistant_messages(&fx.controller)[0].clone();
        assert_eq!(message.content, "See [1].");
        assert_eq!(message.intent, Some(Intent::new("summarize", "Summary")));
        assert_eq!(message.sources.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            message.suggested_questions,
            Some(vec!["And 2025?".to_string()])
        );

        let updates = drain_updates(&mut fx.updates);
        let titles = updates
            .iter()
            .filter(|update| matches!(update, ChatUpdate::TitleChanged { .. }))
            .count();
        assert_eq!(titles, 1);
        let html = updates
            .iter()
            .find_map(|update| match update {
                ChatUpdate::MessageFinalized { html, .. } => Some(html.clone()),
                _ => None,
            })
            .unwrap();
        assert!(html.contains(
            "<sup class=\"citation\" data-citation=\"1\"><a href=\"#source-1\" title=\"report.pdf\">[1]</a></sup>"
        ));
    }

    /// Worker that ignores cancellation and holds `guard` until dropped.
    struct StubbornTransport {
        guard: Arc<()>,
    }

    impl StreamTransport for StubbornTransport {
        fn open(&self, _request: ChatRequest) -> TransportResult<StreamHandle> {
            let (_event_tx, stream, _cancel_rx) = make_event_stream();
            let guard = Arc::clone(&self.guard);
            Ok(StreamHandle {
                stream,
                worker: Box::pin(async move {
                    let _held = guard;
                    std::future::pending::<()>().await;
                }),
            })
        }
    }

    #[tokio::test]
    async fn finishing_a_turn_aborts_its_worker() {
        let guard = Arc::new(());
        let (mut controller, _updates) = StreamController::new(
            Arc::new(StubbornTransport {
                guard: Arc::clone(&guard),
            }),
            Arc::new(InMemoryDiscussions::new()),
            Arc::new(ManualScheduler::new()),
            TurnOptions::default(),
        );
        let handle = controller.send_message("hang").await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(Arc::strong_count(&guard), 2);

        controller.handle_event(&handle, StreamEvent::done()).unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(controller.phase(), &StreamPhase::Idle);
        assert_eq!(Arc::strong_count(&guard), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_finalizes_with_captured_text() {
        let mut fx = fixture(Arc::new(TokioFrameScheduler::default()));
        let handle = fx.controller.send_message("short").await.unwrap();
        fx.transport.sender().send(StreamEvent::chunk("only this")).unwrap();
        fx.transport.close();

        let outcome = fx.controller.run_turn(&handle).await.unwrap();

        assert_eq!(outcome, TurnOutcome::Finalized);
        assert_eq!(assistant_messages(&fx.controller)[0].content, "only this");
        assert!(!assistant_messages(&fx.controller)[0].stopped);
    }

    #[tokio::test]
    async fn streams_a_turn_from_the_http_backend() {
        let server = MockServer::start().await;
        let body = [
            r#"{"type":"sources","sources":[{"id":"d1","filename":"a.pdf","score":0.9,"citation_number":1}],"provider":"claude"}"#,
            r#"{"type":"chunk","content":"Revenue grew [1]","provider":"claude"}"#,
            r#"{"type":"chunk","content":" by **12%**.","provider":"claude"}"#,
            r#"{"type":"done","provider":"claude"}"#,
        ]
        .iter()
        .map(|payload| format!("data: {payload}\n\n"))
        .collect::<String>();
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(TransportConfig::new(server.uri())).unwrap();
        let (mut controller, _updates) = StreamController::new(
            Arc::new(transport),
            Arc::new(InMemoryDiscussions::new()),
            Arc::new(TokioFrameScheduler::default()),
            TurnOptions::new("claude"),
        );
        let handle = controller.send_message("How did revenue do?").await.unwrap();

        let outcome = controller.run_turn(&handle).await.unwrap();

        assert_eq!(outcome, TurnOutcome::Finalized);
        let message = assistant_messages(&controller)[0];
        assert_eq!(message.content, "Revenue grew [1] by **12%**.");
        assert_eq!(message.sources.as_ref().map(Vec::len), Some(1));
    }
}
