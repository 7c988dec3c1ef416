//! Application worker contract.
//!
//! Applications are told about their sessions only from event dispatch on
//! the worker that owns the session, so every callback gets that worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use tether_core::{FifoConsumer, FifoProducer, SessionHandle};

use crate::event::{EventSender, IoKind, PostError, SessionEvent};
use crate::worker::Worker;

/// How a session came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Active open; carries the tag passed to connect.
    Connected { opaque: u64 },
    /// Passive open on `listener`.
    Accepted { listener: SessionHandle },
}

/// The application's ends of a session's fifos.
pub struct AppFifos {
    handle: SessionHandle,
    rx: FifoConsumer,
    tx: FifoProducer,
    notify: EventSender,
}

impl AppFifos {
    pub(crate) fn new(
        handle: SessionHandle,
        rx: FifoConsumer,
        tx: FifoProducer,
        notify: EventSender,
    ) -> Self {
        Self {
            handle,
            rx,
            tx,
            notify,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Read up to `max` bytes. Clears the rx event first so data landing
    /// during the read raises a new one.
    pub fn recv(&mut self, max: usize) -> Bytes {
        self.rx.clear_event();
        self.rx.dequeue(max)
    }

    /// Write as much of `data` as fits and wake the transport if it was not
    /// already woken.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, PostError> {
        let n = self.tx.enqueue(data);
        if n > 0 && self.tx.set_event() {
            self.notify.post(SessionEvent::Io {
                handle: self.handle,
                kind: IoKind::Tx,
            })?;
        }
        Ok(n)
    }

    pub fn rx(&self) -> &FifoConsumer {
        &self.rx
    }

    pub fn tx(&self) -> &FifoProducer {
        &self.tx
    }

    /// Follow the session to its new worker after a migration.
    pub fn rebind(&mut self, handle: SessionHandle, notify: EventSender) {
        self.handle = handle;
        self.notify = notify;
    }
}

impl std::fmt::Debug for AppFifos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppFifos")
            .field("handle", &self.handle)
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .finish()
    }
}

pub trait AppWorker: Send + Sync {
    fn name(&self) -> &str;

    /// The session is READY and these are its fifos.
    fn session_opened(&self, wrk: &mut Worker, fifos: AppFifos, origin: SessionOrigin);

    /// An active open did not complete.
    fn connect_failed(&self, wrk: &mut Worker, handle: SessionHandle, opaque: u64);

    /// New data in the rx fifo.
    fn rx_ready(&self, wrk: &mut Worker, handle: SessionHandle);

    /// Peer closed (`reset == false`) or the connection was reset.
    fn session_disconnected(&self, wrk: &mut Worker, handle: SessionHandle, reset: bool);

    /// The session is gone; drop its fifos.
    fn session_cleanup(&self, _wrk: &mut Worker, _handle: SessionHandle) {}

    /// The session now lives on another worker under `new`.
    fn session_migrated(&self, _wrk: &mut Worker, _old: SessionHandle, _new: SessionHandle) {}
}

/// Attached application workers by `app_wrk_index`.
#[derive(Default)]
pub struct AppRegistry {
    apps: DashMap<u32, Arc<dyn AppWorker>>,
    next: AtomicU32,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, app: Arc<dyn AppWorker>) -> u32 {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        tracing::info!(app_wrk_index = index, name = app.name(), "app worker attached");
        self.apps.insert(index, app);
        index
    }

    pub fn get(&self, index: u32) -> Option<Arc<dyn AppWorker>> {
        self.apps.get(&index).map(|a| a.clone())
    }

    pub(crate) fn remove(&self, index: u32) -> Option<Arc<dyn AppWorker>> {
        self.apps.remove(&index).map(|(_, a)| a)
    }

    pub fn list(&self) -> Vec<(u32, String)> {
        let mut out: Vec<_> = self
            .apps
            .iter()
            .map(|e| (*e.key(), e.value().name().to_string()))
            .collect();
        out.sort_by_key(|(i, _)| *i);
        out
    }
}
