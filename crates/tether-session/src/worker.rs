//! Session worker: one thread, one pool, one event queue.
//!
//! Everything here runs on the worker's own thread. Other threads reach a
//! worker only through its [`EventSender`]; transports and applications get
//! `&Worker`/`&mut Worker` when called from this thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use tether_core::{
    ConnectionRef, Endpoint, FifoConsumer, FifoError, FifoProducer, FifoSegment, LocalKey,
    SessionHandle, SessionTuple, SessionType, ThreadIndex, TransportProto,
};

use crate::app::{AppFifos, SessionOrigin};
use crate::error::SessionError;
use crate::event::{EventSender, IoKind, SessionEvent};
use crate::filter::{filter_pool, summarize_pool, FilterResult, SessionFilter, SessionSummary, ThreadSummary};
use crate::layer::SessionMain;
use crate::pool::SessionPool;
use crate::session::{Session, SessionFlag, SessionState};
use crate::state::{transition, Action, Input, Step};
use crate::stats::WorkerStats;
use crate::transport::{Transport, TransportError};

/// A session on its way to another worker.
struct MovedSession {
    from: SessionHandle,
    conn: ConnectionRef,
    tuple: SessionTuple,
    app_wrk_index: u32,
    opaque: u64,
    listener: Option<SessionHandle>,
    rx: Option<FifoProducer>,
    tx: Option<FifoConsumer>,
}

pub struct Worker {
    thread_index: ThreadIndex,
    main: Arc<SessionMain>,
    pool: SessionPool,
    events: Receiver<SessionEvent>,
    sender: EventSender,
    segment: FifoSegment,
    rx_fifo_size: u32,
    tx_fifo_size: u32,
    idle_wait: Duration,
    /// Application halves of attached fifos, handed over on new-session.
    pending_app: HashMap<u32, AppFifos>,
    /// Close escalation deadlines.
    timers: BinaryHeap<Reverse<(Instant, u32)>>,
    /// TRANSPORT_CLOSING sessions waiting for rx to drain.
    draining: Vec<u32>,
    /// Sessions with tx data the transport could not take yet.
    tx_blocked: Vec<u32>,
}

impl Worker {
    pub(crate) fn new(
        thread_index: ThreadIndex,
        main: Arc<SessionMain>,
        events: Receiver<SessionEvent>,
        sender: EventSender,
        segment: FifoSegment,
    ) -> Self {
        let cfg = main.config();
        let pool = SessionPool::new(cfg.max_sessions_per_worker, cfg.preallocated_sessions);
        let (rx_fifo_size, tx_fifo_size) = (cfg.rx_fifo_size, cfg.tx_fifo_size);
        let idle_wait = Duration::from_millis(cfg.idle_wait_ms);
        Self {
            thread_index,
            main,
            pool,
            events,
            sender,
            segment,
            rx_fifo_size,
            tx_fifo_size,
            idle_wait,
            pending_app: HashMap::new(),
            timers: BinaryHeap::new(),
            draining: Vec::new(),
            tx_blocked: Vec::new(),
        }
    }

    pub fn thread_index(&self) -> ThreadIndex {
        self.thread_index
    }

    pub fn main(&self) -> &Arc<SessionMain> {
        &self.main
    }

    /// This worker's own queue.
    pub fn sender(&self) -> &EventSender {
        &self.sender
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        self.sender.stats()
    }

    pub fn segment(&self) -> &FifoSegment {
        &self.segment
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        if handle.thread_index != self.thread_index {
            return None;
        }
        self.pool.get(handle.session_index)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn filter(&self, filter: &SessionFilter) -> FilterResult {
        filter_pool(self.thread_index, &self.pool, filter)
    }

    pub fn summary(&self, verbose: u32) -> ThreadSummary {
        summarize_pool(self.thread_index, &self.pool, verbose)
    }

    /// Allocated sessions that have not been deleted.
    pub fn live_handles(&self) -> Vec<SessionHandle> {
        self.pool
            .indices_where(|s| s.state != SessionState::TransportDeleted)
            .into_iter()
            .map(|i| self.handle_of(i))
            .collect()
    }

    pub fn session_summary(&self, handle: SessionHandle) -> Option<SessionSummary> {
        self.session(handle).map(SessionSummary::of)
    }

    /// Take the events queued right now. Events posted while iterating are
    /// left for the next call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        let queued = self.events.len();
        self.events.try_iter().take(queued)
    }

    // ── Application entry points ─────────────────────────────────────────────

    /// Bind a listener owned by `app_wrk_index`.
    pub fn listen(&mut self, app_wrk_index: u32, key: LocalKey) -> Result<SessionHandle, SessionError> {
        let main = self.main.clone();
        if main.apps().get(app_wrk_index).is_none() {
            return Err(SessionError::NoApp(app_wrk_index));
        }
        let transport = main.transports().require(key.proto)?;
        if main.lookup().has_listener(&key) {
            return Err(TransportError::AddrInUse(key.lcl).into());
        }
        let tuple = SessionTuple {
            proto: key.proto,
            fib_index: key.fib_index,
            lcl: key.lcl,
            rmt: Endpoint::unspecified(),
        };
        let index = self.alloc_session(tuple, app_wrk_index)?;
        let handle = self.handle_of(index);
        if let Some(s) = self.pool.get_mut(index) {
            s.flags.insert(SessionFlag::Listener);
        }
        let listener_index = match transport.listen(self, handle, app_wrk_index, &key) {
            Ok(i) => i,
            Err(e) => {
                self.step(index, Input::Cleanup);
                return Err(e.into());
            }
        };
        if let Some(s) = self.pool.get_mut(index) {
            s.connection_index = listener_index;
        }
        self.step(index, Input::Listen);
        main.lookup().add_listener(key, self.conn_ref(key.proto, listener_index));
        tracing::info!(
            thread = self.thread_index,
            session = index,
            proto = %key.proto,
            lcl = %key.lcl,
            "listening"
        );
        Ok(handle)
    }

    /// Start an active open. The session stays CONNECTING until the
    /// transport reports the outcome.
    pub fn connect(
        &mut self,
        app_wrk_index: u32,
        tuple: SessionTuple,
        opaque: u64,
    ) -> Result<SessionHandle, SessionError> {
        let main = self.main.clone();
        if main.apps().get(app_wrk_index).is_none() {
            return Err(SessionError::NoApp(app_wrk_index));
        }
        let transport = main.transports().require(tuple.proto)?;
        let index = self.alloc_session(tuple, app_wrk_index)?;
        let handle = self.handle_of(index);
        if let Some(s) = self.pool.get_mut(index) {
            s.opaque = opaque;
            s.flags.insert(SessionFlag::HalfOpen);
        }
        let mut tuple = tuple;
        let half_open = match transport.connect(self, handle, &mut tuple) {
            Ok(i) => i,
            Err(e) => {
                self.step(index, Input::Cleanup);
                return Err(e.into());
            }
        };
        if let Some(s) = self.pool.get_mut(index) {
            s.connection_index = half_open;
            s.tuple = tuple;
            s.session_type = SessionType::for_endpoint(tuple.proto, &tuple.lcl);
        }
        self.step(index, Input::Connect);
        main.lookup()
            .add_half_open(tuple.local_key(), self.conn_ref(tuple.proto, half_open));
        tracing::debug!(thread = self.thread_index, session = index, %tuple, "connecting");
        Ok(handle)
    }

    /// Graceful close requested by the application. Returns false when the
    /// session was already closing.
    pub fn app_close(&mut self, handle: SessionHandle) -> bool {
        let Some(index) = self.local_or_warn(handle) else {
            return false;
        };
        if let Some(s) = self.pool.get_mut(index) {
            if s.state == SessionState::Ready {
                s.flags.insert(SessionFlag::AppClosed);
            }
        }
        self.step(index, Input::AppClose)
    }

    /// Operator clear: skip the graceful close, tell the app it was reset.
    pub fn clear(&mut self, handle: SessionHandle) -> bool {
        let Some(index) = self.local_or_warn(handle) else {
            return false;
        };
        tracing::info!(thread = self.thread_index, session = index, "clearing session");
        self.step(index, Input::ForceClear)
    }

    /// Move a READY session to worker `to`.
    pub fn migrate(&mut self, handle: SessionHandle, to: ThreadIndex) -> Result<(), SessionError> {
        let index = self.local(handle)?;
        if to == self.thread_index {
            return Ok(());
        }
        let main = self.main.clone();
        let target = main.worker(to)?.clone();
        let s = self.pool.get(index).ok_or(SessionError::NoSession(handle))?;
        if s.state != SessionState::Ready || self.pending_app.contains_key(&index) {
            return Err(SessionError::BadState {
                handle,
                state: s.state,
                op: "migrate",
            });
        }
        let proto = s.tuple.proto;
        let transport = main.transports().require(proto)?;
        let conn = transport
            .migrate(s.connection(), to)
            .ok_or(TransportError::Unsupported { proto, op: "migrate" })?;

        let Some(s) = self.pool.get_mut(index) else {
            return Err(SessionError::NoSession(handle));
        };
        s.flags.insert(SessionFlag::Migrating);
        let moved_app = s.app_wrk_index;
        let moved = MovedSession {
            from: handle,
            conn,
            tuple: s.tuple,
            app_wrk_index: s.app_wrk_index,
            opaque: s.opaque,
            listener: s.listener,
            rx: s.rx_fifo.take(),
            tx: s.tx_fifo.take(),
        };
        self.draining.retain(|i| *i != index);
        self.tx_blocked.retain(|i| *i != index);
        self.step(index, Input::Migrated);
        WorkerStats::bump(&self.stats().migrations);

        if let Err(e) = target.rpc(move |wrk| wrk.migrate_in(moved)) {
            // The fifos went down with the closure.
            tracing::warn!(thread = self.thread_index, session = index, to, error = %e, "migration lost");
            transport.cleanup(self, conn);
            self.notify_app(SessionEvent::Disconnect { handle, reset: true });
            if let Err(err) = self.sender.rpc(move |wrk| wrk.notify_cleanup(moved_app, handle)) {
                tracing::warn!(%handle, error = %err, "cleanup notification dropped");
            }
            return Err(e.into());
        }
        tracing::debug!(thread = self.thread_index, session = index, to, "migrating");
        Ok(())
    }

    // ── Transport entry points ───────────────────────────────────────────────

    /// A connection arrived on `listener`. The session waits in ACCEPTING
    /// until `accepted_notify`.
    pub fn stream_accept(
        &mut self,
        listener: SessionHandle,
        app_wrk_index: u32,
        connection_index: u32,
        tuple: SessionTuple,
    ) -> Result<SessionHandle, SessionError> {
        let transport = self.main.transports().require(tuple.proto)?;
        let index = self.alloc_session(tuple, app_wrk_index)?;
        let handle = self.handle_of(index);
        if let Some(s) = self.pool.get_mut(index) {
            s.listener = Some(listener);
            s.connection_index = connection_index;
        }
        let conn = self.conn_ref(tuple.proto, connection_index);
        if let Err(e) = transport.accept(self, conn, handle) {
            self.step(index, Input::Cleanup);
            return Err(e.into());
        }
        self.step(index, Input::Accept);
        self.main.lookup().add_established(tuple, conn);
        Ok(handle)
    }

    /// Active open finished; `connection_index` is the established connection.
    pub fn connected_notify(
        &mut self,
        handle: SessionHandle,
        connection_index: u32,
    ) -> Result<(), SessionError> {
        let index = self.local(handle)?;
        let Some(s) = self.pool.get_mut(index) else {
            return Err(SessionError::NoSession(handle));
        };
        if s.state != SessionState::Connecting {
            tracing::debug!(thread = self.thread_index, session = index, state = %s.state, "late connect notification");
            return Ok(());
        }
        let half_open = s.connection();
        let key = s.tuple.local_key();
        s.flags.remove(SessionFlag::HalfOpen);
        s.connection_index = connection_index;
        self.main.lookup().del_half_open(&key, half_open);

        match self.apply(index, Input::Connected) {
            Ok(_) => {
                tracing::info!(thread = self.thread_index, session = index, "connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(thread = self.thread_index, session = index, error = %e, "connect failed");
                if let Some(s) = self.pool.get_mut(index) {
                    s.flags.insert(SessionFlag::HalfOpen);
                }
                self.notify_app(SessionEvent::Disconnect { handle, reset: true });
                self.abort(index);
                Err(e)
            }
        }
    }

    /// Passive open finished.
    pub fn accepted_notify(&mut self, handle: SessionHandle) -> Result<(), SessionError> {
        let index = self.local(handle)?;
        match self.apply(index, Input::Accepted) {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(thread = self.thread_index, session = index, error = %e, "accept failed");
                self.abort(index);
                Err(e)
            }
        }
    }

    /// Peer closed.
    pub fn disconnect_notify(&mut self, handle: SessionHandle) -> bool {
        self.notify_input(handle, Input::PeerClose)
    }

    /// Connection reset by peer, or an active open was refused.
    pub fn reset_notify(&mut self, handle: SessionHandle) -> bool {
        self.notify_input(handle, Input::Reset)
    }

    /// The transport has freed the connection.
    pub fn cleanup_notify(&mut self, handle: SessionHandle) -> bool {
        self.notify_input(handle, Input::Cleanup)
    }

    /// Deliver in-order bytes to the application. Returns bytes accepted.
    pub fn enqueue_rx(&mut self, handle: SessionHandle, data: &[u8]) -> usize {
        let Some(rx) = self.rx_fifo_for(handle) else {
            return 0;
        };
        let n = rx.enqueue(data);
        if n > 0 && rx.set_event() {
            self.notify_app(SessionEvent::Io {
                handle,
                kind: IoKind::Rx,
            });
        }
        n
    }

    /// Deliver bytes that start `offset` bytes past the in-order tail. The
    /// application is woken only once the gap before them closes.
    pub fn enqueue_rx_at(
        &mut self,
        handle: SessionHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<usize, FifoError> {
        let Some(rx) = self.rx_fifo_for(handle) else {
            return Ok(0);
        };
        let before = rx.max_dequeue();
        let n = rx.enqueue_at(offset, data)?;
        if rx.max_dequeue() > before && rx.set_event() {
            self.notify_app(SessionEvent::Io {
                handle,
                kind: IoKind::Rx,
            });
        }
        Ok(n)
    }

    // ── Processing loop ──────────────────────────────────────────────────────

    /// Dispatch the events queued at call time. Returns how many ran.
    pub fn process_events(&mut self) -> usize {
        let events = self.events.clone();
        let queued = events.len();
        let mut ran = 0;
        for event in events.try_iter().take(queued) {
            self.dispatch(event);
            ran += 1;
        }
        ran
    }

    /// Timers, drained disconnects, blocked tx and transport polling.
    pub fn housekeeping(&mut self, now: Instant) {
        while let Some(Reverse((deadline, index))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            let due = self
                .pool
                .get(index)
                .is_some_and(|s| s.close_deadline == Some(deadline));
            if due {
                WorkerStats::bump(&self.stats().close_timeouts);
                tracing::info!(thread = self.thread_index, session = index, "close timed out, forcing cleanup");
                self.step(index, Input::CloseTimeout);
            }
        }

        for index in std::mem::take(&mut self.draining) {
            let Some(s) = self.pool.get(index) else {
                continue;
            };
            if s.state != SessionState::TransportClosing {
                continue;
            }
            if s.rx_fifo.as_ref().map_or(0, |f| f.max_dequeue()) == 0 {
                self.step(index, Input::Drained);
            } else {
                self.draining.push(index);
            }
        }

        for index in std::mem::take(&mut self.tx_blocked) {
            self.flush_tx(index);
        }

        for transport in self.main.transports().all() {
            transport.poll(self);
        }
    }

    /// Close the quantum: reclaim sessions deleted the quantum before.
    pub fn end_quantum(&mut self) -> usize {
        WorkerStats::bump(&self.stats().quanta);
        self.pool.end_quantum()
    }

    /// One full quantum. Returns the number of events dispatched.
    pub fn run_once(&mut self) -> usize {
        let ran = self.process_events();
        self.housekeeping(Instant::now());
        self.end_quantum();
        ran
    }

    /// Worker thread body. Returns when the session layer shuts down.
    pub fn run(mut self) {
        tracing::info!(thread = self.thread_index, "session worker started");
        while !self.main.is_shutdown() {
            if self.run_once() > 0 {
                continue;
            }
            match self.events.recv_timeout(self.idle_wait) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::info!(thread = self.thread_index, "session worker stopped");
    }

    fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::NewSession { handle } => self.deliver_new_session(handle),
            SessionEvent::Disconnect { handle, reset } => self.deliver_disconnect(handle, reset),
            SessionEvent::Rpc(rpc) => rpc.run(self),
            SessionEvent::Io {
                handle,
                kind: IoKind::Rx,
            } => self.deliver_rx(handle),
            SessionEvent::Io {
                handle,
                kind: IoKind::Tx,
            } => {
                if let Some(index) = self.local_or_warn(handle) {
                    self.flush_tx(index);
                }
            }
            SessionEvent::Migrate { handle, to } => {
                if let Err(e) = self.migrate(handle, to) {
                    tracing::warn!(%handle, to, error = %e, "migration refused");
                }
            }
            SessionEvent::AppDetach { app_wrk_index } => self.detach_app(app_wrk_index),
        }
    }

    // ── Event delivery ───────────────────────────────────────────────────────

    fn deliver_new_session(&mut self, handle: SessionHandle) {
        let index = handle.session_index;
        let Some(fifos) = self.pending_app.remove(&index) else {
            return;
        };
        let Some(s) = self.pool.get_if_valid(index) else {
            return;
        };
        let origin = match s.listener {
            Some(listener) => SessionOrigin::Accepted { listener },
            None => SessionOrigin::Connected { opaque: s.opaque },
        };
        let Some(app) = self.main.apps().get(s.app_wrk_index) else {
            tracing::debug!(%handle, app = s.app_wrk_index, "new session for detached app");
            return;
        };
        WorkerStats::bump(&self.stats().sessions_opened);
        app.session_opened(self, fifos, origin);
    }

    fn deliver_disconnect(&mut self, handle: SessionHandle, reset: bool) {
        let Some(s) = self.pool.get_mut(handle.session_index) else {
            return;
        };
        if s.flags.contains(SessionFlag::DisconnectNotified) {
            return;
        }
        s.flags.insert(SessionFlag::DisconnectNotified);
        let (app_wrk_index, opaque) = (s.app_wrk_index, s.opaque);
        let half_open = s.flags.contains(SessionFlag::HalfOpen);
        let Some(app) = self.main.apps().get(app_wrk_index) else {
            return;
        };
        if half_open {
            app.connect_failed(self, handle, opaque);
        } else {
            app.session_disconnected(self, handle, reset);
        }
    }

    fn deliver_rx(&mut self, handle: SessionHandle) {
        let Some(s) = self.pool.get_if_valid(handle.session_index) else {
            return;
        };
        if !matches!(s.state, SessionState::Ready | SessionState::TransportClosing) {
            return;
        }
        if let Some(app) = self.main.apps().get(s.app_wrk_index) {
            app.rx_ready(self, handle);
        }
    }

    fn notify_cleanup(&mut self, app_wrk_index: u32, handle: SessionHandle) {
        if let Some(app) = self.main.apps().get(app_wrk_index) {
            app.session_cleanup(self, handle);
        }
    }

    fn detach_app(&mut self, app_wrk_index: u32) {
        let owned = self.pool.indices_where(|s| {
            s.app_wrk_index == app_wrk_index && s.state != SessionState::TransportDeleted
        });
        tracing::info!(thread = self.thread_index, app_wrk_index, sessions = owned.len(), "detaching app");
        for index in owned {
            self.step(index, Input::AppClose);
        }
    }

    fn migrate_in(&mut self, moved: MovedSession) {
        let main = self.main.clone();
        let Some(transport) = main.transports().get(moved.tuple.proto) else {
            self.report_migration_lost(&moved);
            return;
        };
        let index = match self.alloc_session(moved.tuple, moved.app_wrk_index) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(thread = self.thread_index, from = %moved.from, error = %e, "cannot adopt session");
                transport.cleanup(self, moved.conn);
                self.report_migration_lost(&moved);
                return;
            }
        };
        let handle = self.handle_of(index);
        if let Some(s) = self.pool.get_mut(index) {
            s.connection_index = moved.conn.connection_index;
            s.opaque = moved.opaque;
            s.listener = moved.listener;
        }
        if let Err(e) = transport.accept(self, moved.conn, handle) {
            tracing::warn!(thread = self.thread_index, from = %moved.from, error = %e, "migrated connection vanished");
            // No fifos yet, so the app hears nothing about the new handle.
            self.step(index, Input::Cleanup);
            self.report_migration_lost(&moved);
            return;
        }
        if let Some(s) = self.pool.get_mut(index) {
            s.rx_fifo = moved.rx;
            s.tx_fifo = moved.tx;
        }
        self.step(index, Input::Adopt);
        main.lookup().add_established(moved.tuple, moved.conn);

        // Events raised on the old worker died with the old handle.
        let rx_pending = self
            .pool
            .get_mut(index)
            .and_then(|s| s.rx_fifo.as_ref())
            .is_some_and(|rx| rx.max_dequeue() > 0 && rx.set_event());
        if let Some(app) = main.apps().get(moved.app_wrk_index) {
            app.session_migrated(self, moved.from, handle);
        }
        if rx_pending {
            self.notify_app(SessionEvent::Io {
                handle,
                kind: IoKind::Rx,
            });
        }
        self.flush_tx(index);
        tracing::info!(thread = self.thread_index, session = index, from = %moved.from, "session migrated in");
    }

    /// Tell the origin worker its session did not survive the move.
    fn report_migration_lost(&self, moved: &MovedSession) {
        let (app_wrk_index, handle) = (moved.app_wrk_index, moved.from);
        let posted = self
            .main
            .rpc(handle.thread_index, move |wrk| wrk.migration_lost(app_wrk_index, handle));
        if let Err(e) = posted {
            tracing::warn!(%handle, error = %e, "migration loss not reported");
        }
    }

    /// The old handle is already deleted here, so the app is called directly
    /// rather than through a disconnect event.
    fn migration_lost(&mut self, app_wrk_index: u32, handle: SessionHandle) {
        let Some(app) = self.main.apps().get(app_wrk_index) else {
            return;
        };
        app.session_disconnected(self, handle, true);
        app.session_cleanup(self, handle);
    }

    // ── State machine plumbing ───────────────────────────────────────────────

    fn apply(&mut self, index: u32, input: Input) -> Result<bool, SessionError> {
        let Some(state) = self.pool.get(index).map(|s| s.state) else {
            tracing::debug!(thread = self.thread_index, session = index, ?input, "no such session");
            return Ok(false);
        };
        let (next, action) = match transition(state, input) {
            Step::Go { next, action } => (next, action),
            Step::Ignore => {
                tracing::debug!(thread = self.thread_index, session = index, %state, ?input, "ignored");
                return Ok(false);
            }
        };
        self.perform(index, action)?;
        if let Some(s) = self.pool.get_mut(index) {
            s.state = next;
        }
        if next == SessionState::TransportDeleted {
            self.pool.defer_free(index);
            WorkerStats::bump(&self.stats().sessions_deleted);
        }
        tracing::trace!(thread = self.thread_index, session = index, from = %state, to = %next, ?input, "transition");
        Ok(true)
    }

    /// `apply` for inputs whose actions cannot fail.
    fn step(&mut self, index: u32, input: Input) -> bool {
        self.apply(index, input).unwrap_or_else(|e| {
            tracing::warn!(thread = self.thread_index, session = index, ?input, error = %e, "transition failed");
            false
        })
    }

    fn perform(&mut self, index: u32, action: Action) -> Result<(), SessionError> {
        let handle = self.handle_of(index);
        match action {
            Action::None => {}
            Action::AttachFifos => self.attach_fifos(index)?,
            Action::NotifyDisconnect => {
                self.notify_app(SessionEvent::Disconnect { handle, reset: false });
                self.draining.push(index);
            }
            Action::CloseTransport => {
                self.flush_tx(index);
                if let Some((transport, conn)) = self.transport_of(index) {
                    transport.close(self, conn);
                }
                self.arm_close_timer(index);
            }
            Action::NotifyReset | Action::NotifyConnectFailed => {
                self.mark(index, SessionFlag::Reset);
                self.notify_app(SessionEvent::Disconnect { handle, reset: true });
                self.arm_close_timer(index);
            }
            Action::Unlisten => {
                if let Some((transport, conn)) = self.transport_of(index) {
                    transport.unlisten(self, conn.connection_index);
                }
                self.teardown(index);
            }
            Action::ForceClear => {
                self.mark(index, SessionFlag::Reset);
                self.notify_app(SessionEvent::Disconnect { handle, reset: true });
                if let Some((transport, conn)) = self.transport_of(index) {
                    transport.reset(self, conn);
                }
                self.teardown(index);
            }
            Action::ForceCleanup => {
                if let Some((transport, conn)) = self.transport_of(index) {
                    transport.cleanup(self, conn);
                }
                self.teardown(index);
            }
            Action::Teardown => self.teardown(index),
            Action::Detach => self.detach_lookups(index),
        }
        Ok(())
    }

    fn attach_fifos(&mut self, index: u32) -> Result<(), SessionError> {
        let (rx, tx) = self
            .segment
            .alloc_pair(self.rx_fifo_size, self.tx_fifo_size)
            .map_err(|e| {
                WorkerStats::bump(&self.sender.stats().fifo_alloc_failures);
                e
            })?;
        let handle = self.handle_of(index);
        self.sender.post(SessionEvent::NewSession { handle })?;

        let ((rx_producer, rx_consumer), (tx_producer, tx_consumer)) = (rx, tx);
        let Some(s) = self.pool.get_mut(index) else {
            return Err(SessionError::NoSession(handle));
        };
        s.rx_fifo = Some(rx_producer);
        s.tx_fifo = Some(tx_consumer);
        self.main.lookup().add_established(s.tuple, s.connection());
        self.pending_app.insert(
            index,
            AppFifos::new(handle, rx_consumer, tx_producer, self.sender.clone()),
        );
        Ok(())
    }

    /// Release everything the session holds. Runs before the state becomes
    /// TRANSPORT_DELETED.
    fn teardown(&mut self, index: u32) {
        self.detach_lookups(index);
        let Some(s) = self.pool.get_mut(index) else {
            return;
        };
        let had_fifos = s.has_fifos();
        s.rx_fifo = None;
        s.tx_fifo = None;
        s.close_deadline = None;
        let (handle, app_wrk_index) = (s.handle(), s.app_wrk_index);
        let app_knew = self.pending_app.remove(&index).is_none();
        self.draining.retain(|i| *i != index);
        self.tx_blocked.retain(|i| *i != index);
        if had_fifos && app_knew {
            // Queued behind any disconnect already posted for this session.
            let posted = self
                .sender
                .rpc(move |wrk| wrk.notify_cleanup(app_wrk_index, handle));
            if let Err(e) = posted {
                tracing::warn!(%handle, error = %e, "cleanup notification dropped");
            }
        }
        tracing::debug!(%handle, "session torn down");
    }

    fn detach_lookups(&self, index: u32) {
        let Some(s) = self.pool.get(index) else {
            return;
        };
        let conn = s.connection();
        let key = s.tuple.local_key();
        let lookup = self.main.lookup();
        if s.flags.contains(SessionFlag::Listener) {
            lookup.del_listener(&key, conn);
        } else if s.flags.contains(SessionFlag::HalfOpen) {
            lookup.del_half_open(&key, conn);
        } else {
            lookup.del_established(&s.tuple, conn);
        }
    }

    /// Hand tx bytes to the transport. Leftovers are retried next quantum.
    fn flush_tx(&mut self, index: u32) {
        let Some(s) = self.pool.get(index) else {
            return;
        };
        if s.state < SessionState::Ready || s.state >= SessionState::Closed {
            return;
        }
        let Some((transport, conn)) = self.transport_of(index) else {
            return;
        };
        let Some(mut tx) = self.pool.get_mut(index).and_then(|s| s.tx_fifo.take()) else {
            return;
        };
        tx.clear_event();
        let sent = transport.send(self, conn, &mut tx);
        let blocked = tx.max_dequeue() > 0;
        if let Some(s) = self.pool.get_mut(index) {
            s.tx_fifo = Some(tx);
        }
        if blocked && !self.tx_blocked.contains(&index) {
            self.tx_blocked.push(index);
        }
        tracing::trace!(thread = self.thread_index, session = index, sent, blocked, "tx flushed");
    }

    /// Abandon a session whose open failed after the transport committed.
    fn abort(&mut self, index: u32) {
        if let Some((transport, conn)) = self.transport_of(index) {
            transport.reset(self, conn);
        }
        self.step(index, Input::Cleanup);
    }

    fn arm_close_timer(&mut self, index: u32) {
        let timeout = self
            .transport_of(index)
            .map_or(Duration::from_secs(5), |(t, _)| t.close_timeout());
        let deadline = Instant::now() + timeout;
        if let Some(s) = self.pool.get_mut(index) {
            s.close_deadline = Some(deadline);
            self.timers.push(Reverse((deadline, index)));
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn alloc_session(&mut self, tuple: SessionTuple, app_wrk_index: u32) -> Result<u32, SessionError> {
        let thread = self.thread_index;
        self.pool
            .alloc(|i| Session::new(thread, i, tuple, app_wrk_index))
            .map_err(|e| {
                WorkerStats::bump(&self.sender.stats().pool_full);
                tracing::warn!(thread, error = %e, "session allocation failed");
                e.into()
            })
    }

    fn transport_of(&self, index: u32) -> Option<(Arc<dyn Transport>, ConnectionRef)> {
        let s = self.pool.get(index)?;
        if s.connection_index == u32::MAX {
            return None;
        }
        let transport = self.main.transports().get(s.tuple.proto)?;
        Some((transport, s.connection()))
    }

    fn rx_fifo_for(&mut self, handle: SessionHandle) -> Option<&mut FifoProducer> {
        let index = self.local_or_warn(handle)?;
        let s = self.pool.get_mut(index)?;
        if !matches!(s.state, SessionState::Ready | SessionState::TransportClosing) {
            return None;
        }
        s.rx_fifo.as_mut()
    }

    fn notify_input(&mut self, handle: SessionHandle, input: Input) -> bool {
        match self.local_or_warn(handle) {
            Some(index) => self.step(index, input),
            None => false,
        }
    }

    /// Post to this worker's own queue. Failure is counted by the queue.
    fn notify_app(&self, event: SessionEvent) {
        if let Err(e) = self.sender.post(event) {
            tracing::warn!(thread = self.thread_index, error = %e, "notification dropped");
        }
    }

    fn mark(&mut self, index: u32, flag: SessionFlag) {
        if let Some(s) = self.pool.get_mut(index) {
            s.flags.insert(flag);
        }
    }

    fn local(&self, handle: SessionHandle) -> Result<u32, SessionError> {
        if handle.thread_index != self.thread_index {
            return Err(SessionError::WrongThread {
                handle,
                thread: self.thread_index,
            });
        }
        Ok(handle.session_index)
    }

    fn local_or_warn(&self, handle: SessionHandle) -> Option<u32> {
        self.local(handle)
            .map_err(|e| tracing::warn!(error = %e, "misrouted session call"))
            .ok()
    }

    fn handle_of(&self, index: u32) -> SessionHandle {
        SessionHandle::new(self.thread_index, index)
    }

    fn conn_ref(&self, proto: TransportProto, connection_index: u32) -> ConnectionRef {
        ConnectionRef {
            proto,
            thread_index: self.thread_index,
            connection_index,
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("thread_index", &self.thread_index)
            .field("sessions", &self.pool.len())
            .field("queued", &self.events.len())
            .finish()
    }
}
