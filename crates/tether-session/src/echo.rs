//! Built-in echo application: writes back whatever it reads and closes
//! when the peer does.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use tether_core::SessionHandle;

use crate::app::{AppFifos, AppWorker, SessionOrigin};
use crate::worker::Worker;

#[derive(Debug, Default)]
pub struct EchoApp {
    sessions: DashMap<SessionHandle, AppFifos>,
    echoed: AtomicU64,
}

impl EchoApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions currently held open.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total bytes written back.
    pub fn echoed_bytes(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

impl AppWorker for EchoApp {
    fn name(&self) -> &str {
        "echo"
    }

    fn session_opened(&self, _wrk: &mut Worker, fifos: AppFifos, origin: SessionOrigin) {
        tracing::debug!(session = %fifos.handle(), ?origin, "echo session opened");
        self.sessions.insert(fifos.handle(), fifos);
    }

    fn connect_failed(&self, _wrk: &mut Worker, handle: SessionHandle, opaque: u64) {
        tracing::debug!(%handle, opaque, "echo connect failed");
    }

    fn rx_ready(&self, _wrk: &mut Worker, handle: SessionHandle) {
        let Some(mut fifos) = self.sessions.get_mut(&handle) else {
            return;
        };
        // Never read more than can be written back.
        let room = fifos.tx().max_enqueue().min(fifos.rx().max_dequeue()) as usize;
        if room == 0 {
            return;
        }
        let data = fifos.recv(room);
        match fifos.send(&data) {
            Ok(n) => {
                self.echoed.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(%handle, error = %e, "echo tx wakeup lost"),
        }
    }

    fn session_disconnected(&self, wrk: &mut Worker, handle: SessionHandle, reset: bool) {
        tracing::debug!(%handle, reset, "echo peer closed");
        wrk.app_close(handle);
    }

    fn session_cleanup(&self, _wrk: &mut Worker, handle: SessionHandle) {
        self.sessions.remove(&handle);
    }

    fn session_migrated(&self, wrk: &mut Worker, old: SessionHandle, new: SessionHandle) {
        if let Some((_, mut fifos)) = self.sessions.remove(&old) {
            fifos.rebind(new, wrk.sender().clone());
            self.sessions.insert(new, fifos);
        }
    }
}
