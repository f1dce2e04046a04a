//! The call dispatcher: a single-consumer work queue drained on a periodic
//! tick from inside the broker session's task (spec.md §4.3).
//!
//! Grounded on the original's `check_method_call` (core.py lines 60-70),
//! which dequeues one `method_calls` item per `add_timeout(0.01, ...)` tick
//! and re-arms itself — that is reproduced here as a `tokio::time::interval`
//! loop that drains one [`WorkItem`] per tick via `try_recv`.

use crate::error::ChannelLayerError;
use lapin::Channel;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Duration;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Where a work item's result (or error) is delivered.
///
/// Replaces the original's thread-local `result_queue` lookup
/// (`RabbitmqChannelLayer.result_queue`, core.py lines 482-485) with an
/// explicit handoff slot carried in the work item itself, per the
/// systems-language redesign spec.md §9 recommends.
pub enum ReplySink {
    Waiting(oneshot::Sender<Result<(), ChannelLayerError>>),
    /// Used for work items whose result nobody waits on — the dead-letter
    /// consumer's `group_discard` calls (spec.md §4.5) and `send_group`
    /// (spec.md §4.4, "fire-and-forget from the caller's perspective").
    Discard,
}

impl ReplySink {
    pub fn deliver(self, result: Result<(), ChannelLayerError>) {
        match self {
            ReplySink::Waiting(tx) => {
                // The caller may have given up (timed out, dropped the
                // future); a dropped receiver is not our problem to report.
                let _ = tx.send(result);
            }
            ReplySink::Discard => {}
        }
    }
}

/// A single item of dispatcher work: an asynchronous operation that runs
/// against the current operational channel.
///
/// The op is responsible for its own completion, including delivering to
/// whatever reply sink it closed over. Most ops (built via [`WorkItem::new`])
/// run to completion and deliver inline, so `run_dispatch_loop` sees them
/// finish within the tick that picked them up. `receive`'s blocking wait is
/// the one exception: it hands its reply sink to a task it spawns and
/// returns as soon as its consumers are registered (see
/// [`WorkItem::detached`]), so a delivery that hasn't arrived yet never
/// stalls the dispatch loop.
pub struct WorkItem {
    op: Box<dyn FnOnce(Channel) -> BoxFuture<()> + Send>,
}

impl WorkItem {
    /// For ops that complete and deliver their result within this call —
    /// the common case (`send`, `declare_channel`, `group_add`,
    /// `group_discard`, the dead-letter consumer's discards).
    pub fn new<F, Fut>(reply: ReplySink, op: F) -> Self
    where
        F: FnOnce(Channel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ChannelLayerError>> + Send + 'static,
    {
        Self {
            op: Box::new(move |channel| {
                Box::pin(async move {
                    let result = op(channel).await;
                    reply.deliver(result);
                })
            }),
        }
    }

    /// For ops whose completion must not be awaited by the dispatch loop
    /// itself — the closure is handed the channel, does whatever setup it
    /// needs synchronously, and takes full responsibility for finishing the
    /// operation (typically by spawning a task) on its own schedule.
    pub fn detached<F, Fut>(op: F) -> Self
    where
        F: FnOnce(Channel) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            op: Box::new(move |channel| Box::pin(op(channel))),
        }
    }
}

/// Handle callers use to enqueue work. Cloning shares the same bounded
/// submission queue (spec.md §5, "single synchronization point between
/// caller threads and the I/O thread").
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<WorkItem>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueues a work item. Backpressures the caller when the submission
    /// queue is full rather than failing fast (SPEC_FULL.md §9,
    /// "Submission-queue saturation").
    pub async fn submit(&self, item: WorkItem) -> Result<(), ChannelLayerError> {
        self.tx.send(item).await.map_err(|_| ChannelLayerError::Closed)
    }

    /// Raw sender clone, used by the broker session to resubmit items the
    /// dispatch loop finds the channel closed for (see [`run_dispatch_loop`]).
    pub fn raw_sender(&self) -> mpsc::Sender<WorkItem> {
        self.tx.clone()
    }
}

/// Runs the drain loop until the submission queue is closed.
///
/// `channel_slot` is the broker session's current operational channel,
/// refreshed on reopen; reading it fresh every tick is how `retry-if-closed`
/// is applied here instead of as a per-operation decorator (core.py's
/// `retry_if_closed`, lines 72-83): if the channel is not usable the item
/// goes back on the end of the queue, unchanged, exactly as the original
/// re-submits via `self.method_calls.put`.
pub async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<WorkItem>,
    resubmit: mpsc::Sender<WorkItem>,
    channel_slot: Arc<Mutex<Channel>>,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        ticker.tick().await;

        let item = match rx.try_recv() {
            Ok(item) => item,
            Err(mpsc::error::TryRecvError::Empty) => continue,
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        };

        let channel = { channel_slot.lock().await.clone() };
        if !channel.status().is_connected() {
            // retry-if-closed: absorb the transient close, try again next tick.
            if resubmit.send(item).await.is_err() {
                break;
            }
            continue;
        }

        // propagate-error: any synchronous error from the operation is
        // captured and delivered through the item's own reply sink instead
        // of panicking the dispatcher loop. For a `detached` item this await
        // only covers setup — the item's own spawned task carries the rest.
        (item.op)(channel).await;
    }
}
