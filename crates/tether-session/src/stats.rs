//! Per-worker counters. Written by the owning worker and by threads posting
//! into its queue, read by the operator surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::event::EventKind;

#[derive(Debug, Default)]
pub struct WorkerStats {
    posted: [AtomicU64; EventKind::COUNT],
    overflow: [AtomicU64; EventKind::COUNT],
    pub(crate) ctrl_rejected: AtomicU64,
    pub(crate) sessions_opened: AtomicU64,
    pub(crate) sessions_deleted: AtomicU64,
    pub(crate) pool_full: AtomicU64,
    pub(crate) fifo_alloc_failures: AtomicU64,
    pub(crate) close_timeouts: AtomicU64,
    pub(crate) migrations: AtomicU64,
    pub(crate) quanta: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn posted(&self, kind: EventKind) {
        self.posted[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn overflowed(&self, kind: EventKind) {
        self.overflow[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflow_count(&self, kind: EventKind) -> u64 {
        self.overflow[kind as usize].load(Ordering::Relaxed)
    }

    pub fn posted_count(&self, kind: EventKind) -> u64 {
        self.posted[kind as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            events_posted: EventKind::ALL
                .iter()
                .map(|k| (k.as_str(), self.posted_count(*k)))
                .collect(),
            events_overflowed: EventKind::ALL
                .iter()
                .map(|k| (k.as_str(), self.overflow_count(*k)))
                .collect(),
            ctrl_rejected: load(&self.ctrl_rejected),
            sessions_opened: load(&self.sessions_opened),
            sessions_deleted: load(&self.sessions_deleted),
            pool_full: load(&self.pool_full),
            fifo_alloc_failures: load(&self.fifo_alloc_failures),
            close_timeouts: load(&self.close_timeouts),
            migrations: load(&self.migrations),
            quanta: load(&self.quanta),
        }
    }

    /// Zero every counter.
    pub fn clear(&self) {
        for c in self.posted.iter().chain(self.overflow.iter()) {
            c.store(0, Ordering::Relaxed);
        }
        for c in [
            &self.ctrl_rejected,
            &self.sessions_opened,
            &self.sessions_deleted,
            &self.pool_full,
            &self.fifo_alloc_failures,
            &self.close_timeouts,
            &self.migrations,
            &self.quanta,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events_posted: Vec<(&'static str, u64)>,
    pub events_overflowed: Vec<(&'static str, u64)>,
    pub ctrl_rejected: u64,
    pub sessions_opened: u64,
    pub sessions_deleted: u64,
    pub pool_full: u64,
    pub fifo_alloc_failures: u64,
    pub close_timeouts: u64,
    pub migrations: u64,
    pub quanta: u64,
}

impl StatsSnapshot {
    /// True when nothing has gone wrong on this worker.
    pub fn is_clean(&self) -> bool {
        self.ctrl_rejected == 0
            && self.pool_full == 0
            && self.fifo_alloc_failures == 0
            && self.events_overflowed.iter().all(|(_, n)| *n == 0)
    }
}
