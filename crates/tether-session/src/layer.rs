//! The session layer: shared tables plus one queue and one segment per
//! worker thread.
//!
//! Thread 0 is the main thread. It owns listeners and runs a worker like any
//! other; threads `1..=workers` take established sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tether_core::config::SessionConfig;
use tether_core::{
    FifoSegment, LocalKey, SegmentUsage, SessionHandle, SessionTuple, ThreadIndex,
};

use crate::app::AppRegistry;
use crate::assign::WorkerAssigner;
use crate::error::SessionError;
use crate::event::{event_queue, EventSender, IoKind, PostError, QueueStatus, SessionEvent};
use crate::filter::{FilterResult, SessionFilter, ThreadSummary};
use crate::loopback::LoopbackTransport;
use crate::lookup::LookupTable;
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::transport::TransportRegistry;
use crate::worker::Worker;

pub struct SessionMain {
    config: SessionConfig,
    workers: Vec<EventSender>,
    segments: Vec<FifoSegment>,
    transports: TransportRegistry,
    apps: AppRegistry,
    lookup: LookupTable,
    assigner: WorkerAssigner,
    shutdown: AtomicBool,
}

impl SessionMain {
    /// Build the layer and its workers. Workers are returned unstarted:
    /// hand them to [`SessionMain::spawn_workers`] or drive them by hand.
    pub fn enable(config: &SessionConfig) -> (Arc<Self>, Vec<Worker>) {
        let threads = config.workers as usize + 1;
        let mut senders = Vec::with_capacity(threads);
        let mut receivers = Vec::with_capacity(threads);
        let mut segments = Vec::with_capacity(threads);
        for thread in 0..threads as ThreadIndex {
            let stats = Arc::new(WorkerStats::default());
            let (tx, rx) = event_queue(
                thread,
                config.event_queue_size,
                config.ctrl_pool_size,
                stats,
            );
            senders.push(tx);
            receivers.push(rx);
            segments.push(FifoSegment::new(
                format!("wrk-{thread}"),
                config.segment_size,
            ));
        }

        let main = Arc::new(Self {
            config: config.clone(),
            workers: senders,
            segments,
            transports: TransportRegistry::new(),
            apps: AppRegistry::new(),
            lookup: LookupTable::new(),
            assigner: WorkerAssigner::new(config.workers),
            shutdown: AtomicBool::new(false),
        });
        main.transports.register(Arc::new(LoopbackTransport::new()));

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(i, rx)| {
                let thread = i as ThreadIndex;
                Worker::new(
                    thread,
                    main.clone(),
                    rx,
                    main.workers[i].clone(),
                    main.segments[i].clone(),
                )
            })
            .collect();

        tracing::info!(
            workers = config.workers,
            event_queue_size = config.event_queue_size,
            "session layer enabled"
        );
        (main, workers)
    }

    pub fn spawn_workers(workers: Vec<Worker>) -> std::io::Result<Vec<JoinHandle<()>>> {
        workers
            .into_iter()
            .map(|wrk| {
                std::thread::Builder::new()
                    .name(format!("tether-wk-{}", wrk.thread_index()))
                    .spawn(move || wrk.run())
            })
            .collect()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of threads, main thread included.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, thread: ThreadIndex) -> Result<&EventSender, SessionError> {
        self.workers
            .get(thread as usize)
            .ok_or(SessionError::InvalidThread(thread))
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    pub fn lookup(&self) -> &LookupTable {
        &self.lookup
    }

    pub fn assigner(&self) -> &WorkerAssigner {
        &self.assigner
    }

    pub fn shutdown(&self) {
        tracing::info!("session layer shutting down");
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ── Cross-thread operations ──────────────────────────────────────────────

    /// Run `f` on the worker owning `thread`.
    pub fn rpc(
        &self,
        thread: ThreadIndex,
        f: impl FnOnce(&mut Worker) + Send + 'static,
    ) -> Result<(), SessionError> {
        Ok(self.worker(thread)?.rpc(f)?)
    }

    /// Run `f` on `thread` and wait for its result.
    pub async fn rpc_call<T, F>(&self, thread: ThreadIndex, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> T + Send + 'static,
    {
        let reply = self.worker(thread)?.rpc_with_reply(f)?;
        reply.await.map_err(|_| SessionError::NoReply(thread))
    }

    /// Graceful close, from any thread.
    pub fn close_session(&self, handle: SessionHandle) -> Result<(), SessionError> {
        self.rpc(handle.thread_index, move |wrk| {
            wrk.app_close(handle);
        })
    }

    /// Operator clear, from any thread.
    pub fn clear_session(&self, handle: SessionHandle) -> Result<(), SessionError> {
        self.rpc(handle.thread_index, move |wrk| {
            wrk.clear(handle);
        })
    }

    /// Clear every live session on every thread. Returns how many were
    /// scheduled.
    pub async fn clear_all(&self) -> Result<usize, SessionError> {
        let mut total = 0;
        for thread in 0..self.thread_count() as ThreadIndex {
            total += self
                .rpc_call(thread, |wrk| {
                    let live = wrk.live_handles();
                    for handle in &live {
                        wrk.clear(*handle);
                    }
                    live.len()
                })
                .await?;
        }
        Ok(total)
    }

    /// Wake the owner of `handle` about fifo activity.
    pub fn post_io(&self, handle: SessionHandle, kind: IoKind) -> Result<(), PostError> {
        let sender = self
            .workers
            .get(handle.thread_index as usize)
            .ok_or(PostError::NoWorker {
                thread: handle.thread_index,
            })?;
        sender.post(SessionEvent::Io { handle, kind })
    }

    pub fn migrate_session(&self, handle: SessionHandle, to: ThreadIndex) -> Result<(), SessionError> {
        self.worker(to)?;
        self.worker(handle.thread_index)?
            .post(SessionEvent::Migrate { handle, to })?;
        Ok(())
    }

    /// Detach an application and close whatever it still owns.
    pub fn detach_app(&self, app_wrk_index: u32) -> Result<(), SessionError> {
        if self.apps.remove(app_wrk_index).is_none() {
            return Err(SessionError::NoApp(app_wrk_index));
        }
        for sender in &self.workers {
            if let Err(e) = sender.post(SessionEvent::AppDetach { app_wrk_index }) {
                tracing::warn!(thread = sender.thread(), error = %e, "app detach not delivered");
            }
        }
        Ok(())
    }

    /// Bind a listener on the main thread.
    pub async fn listen(&self, app_wrk_index: u32, key: LocalKey) -> Result<SessionHandle, SessionError> {
        self.rpc_call(0, move |wrk| wrk.listen(app_wrk_index, key))
            .await?
    }

    /// Open a connection from an assigned worker. The result arrives at the
    /// application through `session_opened` or `connect_failed`.
    pub async fn connect(
        &self,
        app_wrk_index: u32,
        tuple: SessionTuple,
        opaque: u64,
    ) -> Result<SessionHandle, SessionError> {
        let thread = self.assigner.assign(0);
        self.rpc_call(thread, move |wrk| wrk.connect(app_wrk_index, tuple, opaque))
            .await?
    }

    /// Run a filter on the thread it names.
    pub async fn filter(&self, filter: SessionFilter) -> Result<FilterResult, SessionError> {
        let thread = filter.thread;
        self.rpc_call(thread, move |wrk| wrk.filter(&filter)).await
    }

    pub async fn thread_summaries(&self, verbose: u32) -> Result<Vec<ThreadSummary>, SessionError> {
        let mut out = Vec::with_capacity(self.thread_count());
        for thread in 0..self.thread_count() as ThreadIndex {
            out.push(self.rpc_call(thread, move |wrk| wrk.summary(verbose)).await?);
        }
        Ok(out)
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub fn queue_status(&self) -> Vec<QueueStatus> {
        self.workers.iter().map(QueueStatus::of).collect()
    }

    pub fn segment_usage(&self) -> Vec<(String, SegmentUsage)> {
        self.segments
            .iter()
            .map(|s| (s.name().to_string(), s.usage()))
            .collect()
    }

    pub fn stats(&self) -> Vec<(ThreadIndex, StatsSnapshot)> {
        self.workers
            .iter()
            .map(|w| (w.thread(), w.stats().snapshot()))
            .collect()
    }

    pub fn clear_stats(&self) {
        for w in &self.workers {
            w.stats().clear();
        }
    }
}

impl std::fmt::Debug for SessionMain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMain")
            .field("threads", &self.workers.len())
            .field("transports", &self.transports.protos())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
