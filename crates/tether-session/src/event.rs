//! Per-worker session event queue.
//!
//! Any thread may post; only the owning worker drains. Posting never blocks:
//! a full queue is an error the caller sees and a counter the operator sees.
//! RPC events carry a closure run on the owning worker, which is the only
//! way another thread changes that worker's sessions.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use tokio::sync::oneshot;

use tether_core::{SessionHandle, ThreadIndex};

use crate::stats::WorkerStats;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    NewSession,
    Disconnect,
    Rpc,
    Io,
    Migrate,
    AppDetach,
}

impl EventKind {
    pub const COUNT: usize = 6;
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::NewSession,
        EventKind::Disconnect,
        EventKind::Rpc,
        EventKind::Io,
        EventKind::Migrate,
        EventKind::AppDetach,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NewSession => "new-session",
            EventKind::Disconnect => "disconnect",
            EventKind::Rpc => "rpc",
            EventKind::Io => "io",
            EventKind::Migrate => "migrate",
            EventKind::AppDetach => "app-detach",
        }
    }
}

/// Direction of an io event, named from the fifo that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IoKind {
    /// Transport filled the rx fifo; wake the application.
    Rx,
    /// Application filled the tx fifo; wake the transport.
    Tx,
}

pub type RpcFn = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

/// A closure bound for another worker, holding a control-pool slot until it
/// has run on that worker.
pub struct RpcEvent {
    f: RpcFn,
    _slot: CtrlSlot,
}

impl RpcEvent {
    pub fn run(self, wrk: &mut Worker) {
        (self.f)(wrk)
    }
}

pub enum SessionEvent {
    /// Fifos are attached; hand them to the application.
    NewSession { handle: SessionHandle },
    /// Peer closed (or reset) the session.
    Disconnect { handle: SessionHandle, reset: bool },
    Rpc(RpcEvent),
    Io { handle: SessionHandle, kind: IoKind },
    /// Move the session to `to`.
    Migrate { handle: SessionHandle, to: ThreadIndex },
    /// Close everything the application worker owns on this thread.
    AppDetach { app_wrk_index: u32 },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::NewSession { .. } => EventKind::NewSession,
            SessionEvent::Disconnect { .. } => EventKind::Disconnect,
            SessionEvent::Rpc(_) => EventKind::Rpc,
            SessionEvent::Io { .. } => EventKind::Io,
            SessionEvent::Migrate { .. } => EventKind::Migrate,
            SessionEvent::AppDetach { .. } => EventKind::AppDetach,
        }
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        match self {
            SessionEvent::NewSession { handle }
            | SessionEvent::Disconnect { handle, .. }
            | SessionEvent::Io { handle, .. }
            | SessionEvent::Migrate { handle, .. } => Some(*handle),
            SessionEvent::Rpc(_) | SessionEvent::AppDetach { .. } => None,
        }
    }
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::NewSession { handle } => write!(f, "NewSession({handle})"),
            SessionEvent::Disconnect { handle, reset } => {
                write!(f, "Disconnect({handle}, reset={reset})")
            }
            SessionEvent::Rpc(_) => f.write_str("Rpc(..)"),
            SessionEvent::Io { handle, kind } => write!(f, "Io({handle}, {kind:?})"),
            SessionEvent::Migrate { handle, to } => write!(f, "Migrate({handle} -> {to})"),
            SessionEvent::AppDetach { app_wrk_index } => write!(f, "AppDetach({app_wrk_index})"),
        }
    }
}

// ── Control pool ─────────────────────────────────────────────────────────────

/// Bounds the RPC payloads in flight towards one worker.
#[derive(Debug)]
pub struct CtrlPool {
    in_use: AtomicUsize,
    capacity: usize,
}

impl CtrlPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            in_use: AtomicUsize::new(0),
            capacity,
        })
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_acquire(self: &Arc<Self>) -> Option<CtrlSlot> {
        let cap = self.capacity;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
            .ok()
            .map(|_| CtrlSlot { pool: self.clone() })
    }
}

/// Returned to the pool when dropped, which happens on the draining worker
/// after the closure runs.
struct CtrlSlot {
    pool: Arc<CtrlPool>,
}

impl Drop for CtrlSlot {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Queue ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("event queue of thread {thread} full, dropped {kind:?} event")]
    QueueFull { thread: ThreadIndex, kind: EventKind },
    #[error("control pool of thread {thread} exhausted ({capacity} rpcs in flight)")]
    CtrlExhausted { thread: ThreadIndex, capacity: usize },
    #[error("thread {thread} has no worker")]
    NoWorker { thread: ThreadIndex },
    #[error("worker {thread} has stopped")]
    Disconnected { thread: ThreadIndex },
}

/// Posting side of one worker's queue. Cheap to clone; every thread holds one
/// per worker.
#[derive(Clone)]
pub struct EventSender {
    thread: ThreadIndex,
    tx: Sender<SessionEvent>,
    ctrl: Arc<CtrlPool>,
    stats: Arc<WorkerStats>,
}

/// Create the queue for worker `thread`. The receiver goes to the worker.
pub fn event_queue(
    thread: ThreadIndex,
    capacity: usize,
    ctrl_capacity: usize,
    stats: Arc<WorkerStats>,
) -> (EventSender, Receiver<SessionEvent>) {
    let (tx, rx) = bounded(capacity);
    let sender = EventSender {
        thread,
        tx,
        ctrl: CtrlPool::new(ctrl_capacity),
        stats,
    };
    (sender, rx)
}

impl EventSender {
    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    pub fn post(&self, event: SessionEvent) -> Result<(), PostError> {
        let kind = event.kind();
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.posted(kind);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.stats.overflowed(kind);
                tracing::warn!(thread = self.thread, kind = kind.as_str(), "event queue full");
                Err(PostError::QueueFull {
                    thread: self.thread,
                    kind,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(PostError::Disconnected { thread: self.thread })
            }
        }
    }

    /// Run `f` on this worker.
    pub fn rpc(&self, f: impl FnOnce(&mut Worker) + Send + 'static) -> Result<(), PostError> {
        let Some(slot) = self.ctrl.try_acquire() else {
            WorkerStats::bump(&self.stats.ctrl_rejected);
            return Err(PostError::CtrlExhausted {
                thread: self.thread,
                capacity: self.ctrl.capacity(),
            });
        };
        self.post(SessionEvent::Rpc(RpcEvent {
            f: Box::new(f),
            _slot: slot,
        }))
    }

    /// Run `f` on this worker and get its result back.
    pub fn rpc_with_reply<T, F>(&self, f: F) -> Result<oneshot::Receiver<T>, PostError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.rpc(move |wrk| {
            let _ = reply_tx.send(f(wrk));
        })?;
        Ok(reply_rx)
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn ctrl(&self) -> &CtrlPool {
        &self.ctrl
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("thread", &self.thread)
            .field("queued", &self.len())
            .field("ctrl_in_use", &self.ctrl.in_use())
            .finish()
    }
}

/// Queue occupancy for the `events` view.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub thread: ThreadIndex,
    pub queued: usize,
    pub capacity: usize,
    pub ctrl_in_use: usize,
    pub ctrl_capacity: usize,
    pub posted: Vec<(&'static str, u64)>,
    pub overflowed: Vec<(&'static str, u64)>,
}

impl QueueStatus {
    pub fn of(sender: &EventSender) -> Self {
        Self {
            thread: sender.thread,
            queued: sender.len(),
            capacity: sender.capacity(),
            ctrl_in_use: sender.ctrl.in_use(),
            ctrl_capacity: sender.ctrl.capacity(),
            posted: EventKind::ALL
                .iter()
                .map(|k| (k.as_str(), sender.stats.posted_count(*k)))
                .collect(),
            overflowed: EventKind::ALL
                .iter()
                .map(|k| (k.as_str(), sender.stats.overflow_count(*k)))
                .collect(),
        }
    }
}
