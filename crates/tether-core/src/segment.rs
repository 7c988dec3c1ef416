//! Fifo segments: the byte budget fifos are allocated from.
//!
//! Every fifo is backed by its own anonymous shared mapping; the segment
//! only accounts for how much of its fixed budget is mapped. A fifo's bytes
//! return to the segment when the last of its two ends is dropped, so a
//! session tearing down while the application still maps the fifo never
//! frees memory out from under the application.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::fifo::{Fifo, FifoConsumer, FifoError, FifoProducer};

#[derive(Debug)]
pub(crate) struct SegmentShared {
    name: String,
    size: u64,
    used: AtomicU64,
    fifos: AtomicU32,
    alloc_failures: AtomicU64,
}

/// Accounting lease held by a live fifo. Returns its bytes on drop.
#[derive(Debug)]
pub(crate) struct SegmentLease {
    segment: Arc<SegmentShared>,
    bytes: u64,
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        self.segment.used.fetch_sub(self.bytes, Ordering::AcqRel);
        self.segment.fifos.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A named, fixed-size fifo budget. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FifoSegment {
    shared: Arc<SegmentShared>,
}

/// Point-in-time view of a segment, for stats output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SegmentUsage {
    pub size: u64,
    pub used: u64,
    pub fifos: u32,
    pub alloc_failures: u64,
}

impl FifoSegment {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            shared: Arc::new(SegmentShared {
                name: name.into(),
                size,
                used: AtomicU64::new(0),
                fifos: AtomicU32::new(0),
                alloc_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn free_bytes(&self) -> u64 {
        self.shared.size - self.shared.used.load(Ordering::Acquire)
    }

    pub fn usage(&self) -> SegmentUsage {
        SegmentUsage {
            size: self.shared.size,
            used: self.shared.used.load(Ordering::Acquire),
            fifos: self.shared.fifos.load(Ordering::Acquire),
            alloc_failures: self.shared.alloc_failures.load(Ordering::Relaxed),
        }
    }

    /// Allocate one fifo of `capacity` bytes from this segment.
    pub fn alloc_fifo(&self, capacity: u32) -> Result<(FifoProducer, FifoConsumer), FifoError> {
        let lease = self.reserve(u64::from(capacity))?;
        Fifo::with_lease(capacity, Some(lease))
    }

    /// Allocate an rx/tx pair. Either both succeed or neither is kept.
    pub fn alloc_pair(
        &self,
        rx_size: u32,
        tx_size: u32,
    ) -> Result<((FifoProducer, FifoConsumer), (FifoProducer, FifoConsumer)), FifoError> {
        let rx = self.alloc_fifo(rx_size)?;
        // On failure `rx` drops here and its lease returns the bytes.
        let tx = self.alloc_fifo(tx_size)?;
        Ok((rx, tx))
    }

    fn reserve(&self, bytes: u64) -> Result<SegmentLease, FifoError> {
        let size = self.shared.size;
        let reserved = self
            .shared
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + bytes <= size).then_some(used + bytes)
            });
        match reserved {
            Ok(_) => {
                self.shared.fifos.fetch_add(1, Ordering::AcqRel);
                Ok(SegmentLease {
                    segment: self.shared.clone(),
                    bytes,
                })
            }
            Err(used) => {
                self.shared.alloc_failures.fetch_add(1, Ordering::Relaxed);
                Err(FifoError::SegmentFull {
                    segment: self.shared.name.clone(),
                    requested: bytes,
                    free: size - used,
                })
            }
        }
    }
}
