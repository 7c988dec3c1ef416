//! Transport plugin contract.
//!
//! A transport owns its connections; sessions only hold indices into them.
//! Transports call back into the session layer through the worker's
//! `*_notify` entry points, always on the worker that owns the session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use tether_core::{
    ConnectionRef, Endpoint, FifoConsumer, LocalKey, SessionHandle, SessionTuple, ThreadIndex,
    TransportProto,
};

use crate::worker::Worker;

/// What a transport knows about one of its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Back-index to the owning session.
    pub session: SessionHandle,
    pub tuple: SessionTuple,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no {0} transport registered")]
    NoTransport(TransportProto),
    #[error("connection refused: nothing listening on {0}")]
    Refused(Endpoint),
    #[error("address {0} already in use")]
    AddrInUse(Endpoint),
    #[error("no free local ports")]
    PortsExhausted,
    #[error("{proto} transport does not support {op}")]
    Unsupported {
        proto: TransportProto,
        op: &'static str,
    },
    #[error("unknown {proto} connection {index}")]
    NoConnection { proto: TransportProto, index: u32 },
    #[error("thread {thread} cannot take the connection")]
    Busy { thread: ThreadIndex },
}

pub trait Transport: Send + Sync {
    fn proto(&self) -> TransportProto;

    /// Start an active open. Fills in an unset local endpoint and returns the
    /// half-open connection index. Completion arrives later through
    /// `connected_notify` (or `reset_notify` on failure).
    fn connect(
        &self,
        wrk: &Worker,
        session: SessionHandle,
        tuple: &mut SessionTuple,
    ) -> Result<u32, TransportError>;

    /// Bind a listener. Returns the listener index.
    fn listen(
        &self,
        wrk: &Worker,
        session: SessionHandle,
        app_wrk_index: u32,
        key: &LocalKey,
    ) -> Result<u32, TransportError>;

    fn unlisten(&self, wrk: &Worker, listener_index: u32);

    /// Bind an accepted (or migrated) connection to its session.
    fn accept(
        &self,
        wrk: &Worker,
        conn: ConnectionRef,
        session: SessionHandle,
    ) -> Result<(), TransportError>;

    /// Graceful close. The transport later calls `cleanup_notify`.
    fn close(&self, wrk: &Worker, conn: ConnectionRef);

    /// Abort the connection towards the peer. No callbacks for this session.
    fn reset(&self, wrk: &Worker, conn: ConnectionRef);

    /// Drop all state for the connection. No callbacks for this session.
    fn cleanup(&self, wrk: &Worker, conn: ConnectionRef);

    fn get_connection(&self, index: u32, thread: ThreadIndex) -> Option<ConnectionInfo>;

    fn get_listener(&self, index: u32) -> Option<ConnectionInfo>;

    fn get_half_open(&self, index: u32) -> Option<ConnectionInfo>;

    /// Drain what the transport can take from the session's tx fifo.
    /// Returns the number of bytes consumed.
    fn send(&self, wrk: &Worker, conn: ConnectionRef, tx: &mut FifoConsumer) -> usize;

    /// Called once per worker quantum.
    fn poll(&self, _wrk: &mut Worker) {}

    /// How long a graceful close may take before it is forced.
    fn close_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Hand a connection to thread `to`. Returns its new reference, unbound
    /// until `accept` is called there.
    fn migrate(&self, _conn: ConnectionRef, _to: ThreadIndex) -> Option<ConnectionRef> {
        None
    }
}

/// Registered transports, one per protocol.
#[derive(Default)]
pub struct TransportRegistry {
    by_proto: DashMap<TransportProto, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<dyn Transport>) {
        let proto = transport.proto();
        if self.by_proto.insert(proto, transport).is_some() {
            tracing::warn!(%proto, "transport replaced");
        }
    }

    pub fn get(&self, proto: TransportProto) -> Option<Arc<dyn Transport>> {
        self.by_proto.get(&proto).map(|t| t.clone())
    }

    pub fn require(&self, proto: TransportProto) -> Result<Arc<dyn Transport>, TransportError> {
        self.get(proto).ok_or(TransportError::NoTransport(proto))
    }

    pub fn protos(&self) -> Vec<TransportProto> {
        let mut protos: Vec<_> = self.by_proto.iter().map(|e| *e.key()).collect();
        protos.sort_by_key(|p| p.as_str());
        protos
    }

    /// Snapshot, so callers can poll without holding map guards.
    pub fn all(&self) -> Vec<Arc<dyn Transport>> {
        self.by_proto.iter().map(|e| e.value().clone()).collect()
    }
}
