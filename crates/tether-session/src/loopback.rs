//! In-process loopback transport.
//!
//! A connect to a loopback listener creates two connections, one per side,
//! each holding the bytes its peer sent until the owning worker moves them
//! into the session's rx fifo. There is no wire format. The client side
//! lives on the connecting worker; the server side goes to whichever worker
//! the assigner picks.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;

use tether_core::{
    ConnectionRef, Endpoint, FifoConsumer, LocalKey, SessionHandle, SessionTuple, ThreadIndex,
    TransportProto,
};

use crate::session::SessionState;
use crate::transport::{ConnectionInfo, Transport, TransportError};
use crate::worker::Worker;

const EPHEMERAL_FIRST: u16 = 49152;
/// Bytes a connection buffers for its session before the sender stalls.
pub const BACKLOG_LIMIT: usize = 256 * 1024;

#[derive(Debug)]
struct LoopListener {
    session: SessionHandle,
    app_wrk_index: u32,
    key: LocalKey,
}

#[derive(Debug)]
struct LoopConn {
    /// Unset until the owning worker binds a session.
    session: Option<SessionHandle>,
    tuple: SessionTuple,
    thread: ThreadIndex,
    peer: u32,
    /// Sent by the peer, not yet in our rx fifo.
    backlog: BytesMut,
    closed: bool,
    fin_rcvd: bool,
    fin_delivered: bool,
    reset_rcvd: bool,
}

impl LoopConn {
    fn new(tuple: SessionTuple, thread: ThreadIndex, peer: u32, session: Option<SessionHandle>) -> Self {
        Self {
            session,
            tuple,
            thread,
            peer,
            backlog: BytesMut::new(),
            closed: false,
            fin_rcvd: false,
            fin_delivered: false,
            reset_rcvd: false,
        }
    }
}

#[derive(Debug, Default)]
struct LoopState {
    listeners: DashMap<u32, LoopListener>,
    conns: DashMap<u32, LoopConn>,
    next_listener: AtomicU32,
    next_conn: AtomicU32,
    next_port: AtomicU16,
}

impl LoopState {
    fn ephemeral_port(&self) -> u16 {
        let n = self.next_port.fetch_add(1, Ordering::Relaxed);
        EPHEMERAL_FIRST + n % (u16::MAX - EPHEMERAL_FIRST)
    }

    fn peer_of(&self, index: u32) -> Option<u32> {
        self.conns.get(&index).map(|c| c.peer)
    }

    fn with_peer(&self, index: u32, f: impl FnOnce(&mut LoopConn)) {
        if let Some(peer) = self.peer_of(index) {
            if let Some(mut p) = self.conns.get_mut(&peer) {
                f(&mut p);
            }
        }
    }
}

/// What a poll pass found to do for one connection.
enum Work {
    Skip,
    Reset(SessionHandle),
    Deliver {
        session: SessionHandle,
        data: BytesMut,
        fin: bool,
        /// The application has closed; incoming bytes are dropped.
        discard: bool,
    },
}

#[derive(Debug)]
pub struct LoopbackTransport {
    state: Arc<LoopState>,
    close_timeout: Duration,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_close_timeout(Duration::from_secs(5))
    }

    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self {
            state: Arc::new(LoopState::default()),
            close_timeout,
        }
    }

    /// Live connections, both sides counted.
    pub fn connection_count(&self) -> usize {
        self.state.conns.len()
    }

    fn poll_conn(&self, wrk: &Worker, index: u32) -> Work {
        let Some(mut conn) = self.state.conns.get_mut(&index) else {
            return Work::Skip;
        };
        let Some(session) = conn.session else {
            return Work::Skip;
        };
        if conn.thread != wrk.thread_index() {
            return Work::Skip;
        }
        if conn.reset_rcvd {
            return Work::Reset(session);
        }
        // Nothing reaches a session that is not open yet.
        let Some(state) = wrk.session(session).map(|s| s.state) else {
            return Work::Skip;
        };
        if state < SessionState::Ready {
            return Work::Skip;
        }
        let fin = conn.fin_rcvd && !conn.fin_delivered;
        if conn.backlog.is_empty() && !fin && !(conn.closed && conn.fin_delivered) {
            return Work::Skip;
        }
        Work::Deliver {
            session,
            data: std::mem::take(&mut conn.backlog),
            fin,
            discard: state >= SessionState::AppClosing,
        }
    }

    /// Put back what the rx fifo did not take, ahead of anything newer.
    fn requeue(&self, index: u32, rest: BytesMut) {
        if rest.is_empty() {
            return;
        }
        if let Some(mut conn) = self.state.conns.get_mut(&index) {
            let newer = std::mem::replace(&mut conn.backlog, rest);
            conn.backlog.extend_from_slice(&newer);
        }
    }
}

impl Transport for LoopbackTransport {
    fn proto(&self) -> TransportProto {
        TransportProto::Loopback
    }

    fn connect(
        &self,
        wrk: &Worker,
        session: SessionHandle,
        tuple: &mut SessionTuple,
    ) -> Result<u32, TransportError> {
        let main = wrk.main().clone();
        let target = LocalKey {
            proto: TransportProto::Loopback,
            fib_index: tuple.fib_index,
            lcl: tuple.rmt,
        };
        let (listener, app_wrk_index) = main
            .lookup()
            .find_listener(&target)
            .and_then(|c| self.state.listeners.get(&c.connection_index))
            .map(|l| (l.session, l.app_wrk_index))
            .ok_or(TransportError::Refused(tuple.rmt))?;

        if tuple.lcl.ip.is_unspecified() {
            tuple.lcl.ip = tuple.rmt.ip;
        }
        if tuple.lcl.port == 0 {
            tuple.lcl.port = self.state.ephemeral_port();
        }

        let client_thread = wrk.thread_index();
        let server_thread = main.assigner().assign(listener.thread_index);
        let client_idx = self.state.next_conn.fetch_add(1, Ordering::Relaxed);
        let server_idx = self.state.next_conn.fetch_add(1, Ordering::Relaxed);
        let server_tuple = tuple.reversed();
        self.state.conns.insert(
            client_idx,
            LoopConn::new(*tuple, client_thread, server_idx, Some(session)),
        );
        self.state
            .conns
            .insert(server_idx, LoopConn::new(server_tuple, server_thread, client_idx, None));

        let state = self.state.clone();
        let posted = main.rpc(server_thread, move |srv| {
            let accepted = srv
                .stream_accept(listener, app_wrk_index, server_idx, server_tuple)
                .and_then(|h| srv.accepted_notify(h));
            if let Err(e) = &accepted {
                tracing::debug!(thread = srv.thread_index(), error = %e, "loopback accept failed");
                state.conns.remove(&server_idx);
            }
            let ok = accepted.is_ok();
            let st = state.clone();
            let replied = srv.main().rpc(client_thread, move |cli| {
                if ok {
                    // On failure the worker resets the connection itself.
                    let _ = cli.connected_notify(session, client_idx);
                } else {
                    st.conns.remove(&client_idx);
                    cli.reset_notify(session);
                    cli.cleanup_notify(session);
                }
            });
            if let Err(e) = replied {
                tracing::warn!(%session, error = %e, "loopback connect reply lost");
                if let Some(mut c) = state.conns.get_mut(&server_idx) {
                    c.reset_rcvd = true;
                }
            }
        });
        if let Err(e) = posted {
            tracing::warn!(server_thread, error = %e, "loopback accept not delivered");
            self.state.conns.remove(&client_idx);
            self.state.conns.remove(&server_idx);
            return Err(TransportError::Busy {
                thread: server_thread,
            });
        }
        Ok(client_idx)
    }

    fn listen(
        &self,
        _wrk: &Worker,
        session: SessionHandle,
        app_wrk_index: u32,
        key: &LocalKey,
    ) -> Result<u32, TransportError> {
        let index = self.state.next_listener.fetch_add(1, Ordering::Relaxed);
        self.state.listeners.insert(
            index,
            LoopListener {
                session,
                app_wrk_index,
                key: *key,
            },
        );
        Ok(index)
    }

    fn unlisten(&self, _wrk: &Worker, listener_index: u32) {
        self.state.listeners.remove(&listener_index);
    }

    fn accept(
        &self,
        _wrk: &Worker,
        conn: ConnectionRef,
        session: SessionHandle,
    ) -> Result<(), TransportError> {
        match self.state.conns.get_mut(&conn.connection_index) {
            Some(mut c) if c.thread == conn.thread_index => {
                c.session = Some(session);
                Ok(())
            }
            _ => Err(TransportError::NoConnection {
                proto: TransportProto::Loopback,
                index: conn.connection_index,
            }),
        }
    }

    fn close(&self, _wrk: &Worker, conn: ConnectionRef) {
        let index = conn.connection_index;
        if let Some(mut c) = self.state.conns.get_mut(&index) {
            c.closed = true;
        }
        self.state.with_peer(index, |p| p.fin_rcvd = true);
    }

    fn reset(&self, _wrk: &Worker, conn: ConnectionRef) {
        let index = conn.connection_index;
        self.state.with_peer(index, |p| p.reset_rcvd = true);
        self.state.conns.remove(&index);
    }

    fn cleanup(&self, _wrk: &Worker, conn: ConnectionRef) {
        let index = conn.connection_index;
        self.state.with_peer(index, |p| p.fin_rcvd = true);
        self.state.conns.remove(&index);
    }

    fn get_connection(&self, index: u32, thread: ThreadIndex) -> Option<ConnectionInfo> {
        let c = self.state.conns.get(&index)?;
        if c.thread != thread {
            return None;
        }
        Some(ConnectionInfo {
            session: c.session?,
            tuple: c.tuple,
        })
    }

    fn get_listener(&self, index: u32) -> Option<ConnectionInfo> {
        let l = self.state.listeners.get(&index)?;
        Some(ConnectionInfo {
            session: l.session,
            tuple: SessionTuple {
                proto: TransportProto::Loopback,
                fib_index: l.key.fib_index,
                lcl: l.key.lcl,
                rmt: Endpoint::unspecified(),
            },
        })
    }

    fn get_half_open(&self, index: u32) -> Option<ConnectionInfo> {
        let c = self.state.conns.get(&index)?;
        Some(ConnectionInfo {
            session: c.session?,
            tuple: c.tuple,
        })
    }

    fn send(&self, _wrk: &Worker, conn: ConnectionRef, tx: &mut FifoConsumer) -> usize {
        let Some(peer) = self.state.peer_of(conn.connection_index) else {
            // Peer gone: the bytes have nowhere to go.
            return tx.dequeue_drop(tx.max_dequeue()) as usize;
        };
        let Some(mut p) = self.state.conns.get_mut(&peer) else {
            return tx.dequeue_drop(tx.max_dequeue()) as usize;
        };
        let room = BACKLOG_LIMIT.saturating_sub(p.backlog.len());
        let chunk = tx.dequeue(room);
        p.backlog.extend_from_slice(&chunk);
        chunk.len()
    }

    fn poll(&self, wrk: &mut Worker) {
        let thread = wrk.thread_index();
        let mine: Vec<u32> = self
            .state
            .conns
            .iter()
            .filter(|c| c.thread == thread && c.session.is_some())
            .map(|c| *c.key())
            .collect();

        for index in mine {
            match self.poll_conn(wrk, index) {
                Work::Skip => {}
                Work::Reset(session) => {
                    self.state.conns.remove(&index);
                    wrk.reset_notify(session);
                    wrk.cleanup_notify(session);
                }
                Work::Deliver {
                    session,
                    mut data,
                    fin,
                    discard,
                } => {
                    let taken = if discard || data.is_empty() {
                        data.len()
                    } else {
                        wrk.enqueue_rx(session, &data)
                    };
                    let rest = data.split_off(taken);
                    let drained = rest.is_empty();
                    self.requeue(index, rest);
                    if fin && drained {
                        if let Some(mut c) = self.state.conns.get_mut(&index) {
                            c.fin_delivered = true;
                        }
                        wrk.disconnect_notify(session);
                    }
                    let done = self
                        .state
                        .conns
                        .get(&index)
                        .is_some_and(|c| c.closed && c.fin_delivered && c.backlog.is_empty());
                    if done {
                        self.state.conns.remove(&index);
                        wrk.cleanup_notify(session);
                    }
                }
            }
        }
    }

    fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    fn migrate(&self, conn: ConnectionRef, to: ThreadIndex) -> Option<ConnectionRef> {
        let mut c = self.state.conns.get_mut(&conn.connection_index)?;
        c.thread = to;
        c.session = None;
        Some(ConnectionRef {
            proto: TransportProto::Loopback,
            thread_index: to,
            connection_index: conn.connection_index,
        })
    }
}
