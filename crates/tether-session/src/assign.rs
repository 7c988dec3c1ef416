//! Worker thread assignment for new sessions.

use std::sync::atomic::{AtomicU16, Ordering};

use tether_core::ThreadIndex;

/// Round-robin over the worker range `[first, last]`.
#[derive(Debug)]
pub struct WorkerAssigner {
    range: Option<(ThreadIndex, ThreadIndex)>,
    next: AtomicU16,
}

impl WorkerAssigner {
    /// `workers` threads numbered `1..=workers`; 0 means the main thread
    /// does everything.
    pub fn new(workers: u16) -> Self {
        let range = (workers > 0).then_some((1, workers));
        Self::with_range(range)
    }

    pub fn with_range(range: Option<(ThreadIndex, ThreadIndex)>) -> Self {
        let first = range.map_or(0, |(first, _)| first);
        Self {
            range,
            next: AtomicU16::new(first),
        }
    }

    pub fn range(&self) -> Option<(ThreadIndex, ThreadIndex)> {
        self.range
    }

    /// Pick the owning thread for a new session.
    pub fn assign(&self, hint: ThreadIndex) -> ThreadIndex {
        let Some((first, last)) = self.range else {
            return 0;
        };
        if (first..=last).contains(&hint) {
            return hint;
        }
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(if n >= last { first } else { n + 1 })
            })
            .unwrap_or(first);
        // A concurrent reader may have seen a stale value outside the range.
        prev.clamp(first, last)
    }
}
