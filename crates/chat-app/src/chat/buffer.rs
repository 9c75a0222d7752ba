//! Frame-aligned batching of streamed text fragments.
//!
//! [`ChunkBuffer::push`] appends to a pending buffer and makes sure exactly
//! one deferred flush is scheduled. The deferred flush (or an explicit
//! [`ChunkBuffer::flush`]) hands everything pending to a [`FlushSink`] as one
//! batch. Batching only moves *when* text is delivered: deliveries happen under
//! the buffer lock, so the sink always sees the in-order concatenation of every
//! pushed fragment.
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Roughly one display frame.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(16);

pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

/// Receives flushed batches, in order.
pub trait FlushSink: Send + Sync + 'static {
    fn deliver(&self, batch: String);
}

impl FlushSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, batch: String) {
        if self.send(batch).is_err() {
            tracing::debug!("flush receiver dropped, discarding batch");
        }
    }
}

/// Host hook that runs a callback at its next rendering opportunity.
///
/// Implementations must not run the callback before `schedule` returns.
pub trait FlushScheduler: Send + Sync {
    fn schedule(&self, callback: FlushCallback) -> ScheduledFlush;
}

/// Teardown hook for one scheduled callback.
pub struct ScheduledFlush {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ScheduledFlush {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for ScheduledFlush {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ScheduledFlush")
            .field("pending", &self.cancel.is_some())
            .finish()
    }
}

/// Runs the callback after a fixed interval on the tokio runtime.
#[derive(Debug, Clone, Copy)]
pub struct TokioFrameScheduler {
    interval: Duration,
}

impl TokioFrameScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for TokioFrameScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }
}

impl FlushScheduler for TokioFrameScheduler {
    fn schedule(&self, callback: FlushCallback) -> ScheduledFlush {
        let interval = self.interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            callback();
        });
        ScheduledFlush::new(move || task.abort())
    }
}

/// Queues callbacks until the host drives a frame with [`ManualScheduler::run_frame`].
#[derive(Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<ManualQueue>>,
}

#[derive(Default)]
struct ManualQueue {
    next_id: u64,
    callbacks: Vec<(u64, FlushCallback)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().callbacks.len()
    }

    /// Runs every callback queued so far. Returns how many ran.
    pub fn run_frame(&self) -> usize {
        let callbacks = std::mem::take(&mut self.queue.lock().callbacks);
        let count = callbacks.len();
        for (_, callback) in callbacks {
            callback();
        }
        count
    }
}

impl FlushScheduler for ManualScheduler {
    fn schedule(&self, callback: FlushCallback) -> ScheduledFlush {
        let id = {
            let mut queue = self.queue.lock();
            queue.next_id += 1;
            let id = queue.next_id;
            queue.callbacks.push((id, callback));
            id
        };

        let queue = Arc::downgrade(&self.queue);
        ScheduledFlush::new(move || {
            if let Some(queue) = queue.upgrade() {
                queue.lock().callbacks.retain(|(queued, _)| *queued != id);
            }
        })
    }
}

struct Shared {
    state: Mutex<BufferState>,
    sink: Box<dyn FlushSink>,
}

#[derive(Default)]
struct BufferState {
    pending: String,
    scheduled: Option<(u64, ScheduledFlush)>,
    generation: u64,
}

impl Shared {
    /// Body of the deferred flush. A callback whose schedule was already
    /// cancelled or superseded finds a different generation and does nothing.
    fn fire(&self, generation: u64) {
        let mut state = self.state.lock();
        if !matches!(state.scheduled, Some((current, _)) if current == generation) {
            return;
        }
        state.scheduled = None;
        self.deliver_pending(&mut state);
    }

    fn deliver_pending(&self, state: &mut BufferState) {
        if state.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.pending);
        self.sink.deliver(batch);
    }
}

pub struct ChunkBuffer {
    shared: Arc<Shared>,
    scheduler: Arc<dyn FlushScheduler>,
}

impl ChunkBuffer {
    pub fn new(scheduler: Arc<dyn FlushScheduler>, sink: impl FlushSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState::default()),
                sink: Box::new(sink),
            }),
            scheduler,
        }
    }

    /// Appends `text` and makes sure one flush is pending.
    pub fn push(&self, text: &str) {
        if text.is_empty() {
            return;
        }

        let mut state = self.shared.state.lock();
        state.pending.push_str(text);
        if state.scheduled.is_some() {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let scheduled = self.scheduler.schedule(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.fire(generation);
            }
        }));
        state.scheduled = Some((generation, scheduled));
    }

    /// Delivers whatever is pending right now and cancels the scheduled flush.
    ///
    /// Safe to call repeatedly and from teardown paths.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        if let Some((_, scheduled)) = state.scheduled.take() {
            scheduled.cancel();
        }
        self.shared.deliver_pending(&mut state);
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn has_scheduled_flush(&self) -> bool {
        self.shared.state.lock().scheduled.is_some()
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        // Teardown must flush explicitly; dropping only stops the timer.
        if let Some((_, scheduled)) = self.shared.state.lock().scheduled.take() {
            scheduled.cancel();
        }
    }
}
