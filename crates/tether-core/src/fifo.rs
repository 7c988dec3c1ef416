//! Single-producer/single-consumer byte fifo in shared memory.
//!
//! A fifo is created as a `(FifoProducer, FifoConsumer)` pair. Each end is
//! `Send` but not `Clone`, so the one-writer/one-reader discipline is held by
//! ownership rather than by convention:
//!
//!   rx fifo: transport holds the producer, application holds the consumer
//!   tx fifo: application holds the producer, transport holds the consumer
//!
//! Cursors are monotonically increasing `u64` byte positions; the buffer
//! offset is `pos % capacity`. Only the producer stores `tail`, only the
//! consumer stores `head`. `accounting()` reads both from one snapshot, so
//! its two halves always sum to the capacity. Separate `max_dequeue()` and
//! `max_enqueue()` calls each take their own snapshot and only agree while
//! the peer end is idle.
//!
//! Out-of-order writes land past the tail and are tracked in a producer-local
//! range list. The tail only moves over contiguous bytes, so the consumer can
//! never see into a gap.

use std::fmt;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::MmapMut;
use thiserror::Error;

use crate::segment::SegmentLease;

/// Largest fifo the layer will map.
pub const MAX_FIFO_SIZE: u32 = 1 << 30;

#[derive(Debug, Error)]
pub enum FifoError {
    #[error("invalid fifo size {0} (must be 1..={MAX_FIFO_SIZE})")]
    InvalidSize(u32),
    #[error("segment {segment} full: requested {requested} bytes, {free} free")]
    SegmentFull {
        segment: String,
        requested: u64,
        free: u64,
    },
    #[error("failed to map fifo memory: {0}")]
    Map(#[from] std::io::Error),
    #[error("out-of-order write [{offset}, +{len}) exceeds free space {free}")]
    OutOfRange { offset: u32, len: usize, free: u32 },
}

struct FifoShared {
    /// Start of the mapped ring. Valid for `capacity` bytes while `_map` lives.
    buf: NonNull<u8>,
    _map: MmapMut,
    capacity: u32,
    /// Consumer cursor.
    head: AtomicU64,
    /// Producer cursor.
    tail: AtomicU64,
    has_event: AtomicBool,
    _lease: Option<SegmentLease>,
}

// Safety: the ring bytes are only written by the single producer in the
// region [tail, head + capacity) and only read by the single consumer in
// [head, tail). Ownership of those regions is handed over through the
// Release/Acquire pairs on `tail` and `head`.
unsafe impl Send for FifoShared {}
unsafe impl Sync for FifoShared {}

impl FifoShared {
    #[inline]
    fn cursors(&self) -> (u64, u64) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head, tail)
    }

    #[inline]
    fn used(&self, head: u64, tail: u64) -> u32 {
        let used = tail.wrapping_sub(head);
        if used > u64::from(self.capacity) {
            // Continuing would hand out bytes belonging to another session.
            panic!(
                "fifo accounting corrupted: head {head} tail {tail} capacity {}",
                self.capacity
            );
        }
        used as u32
    }

    fn max_dequeue(&self) -> u32 {
        let (head, tail) = self.cursors();
        self.used(head, tail)
    }

    fn max_enqueue(&self) -> u32 {
        self.capacity - self.max_dequeue()
    }

    fn accounting(&self) -> (u32, u32) {
        let used = self.max_dequeue();
        (used, self.capacity - used)
    }

    #[inline]
    fn offset(&self, pos: u64) -> usize {
        (pos % u64::from(self.capacity)) as usize
    }

    /// Copy `data` into the ring starting at absolute position `pos`.
    ///
    /// Safety: caller is the producer and `[pos, pos + len)` lies inside
    /// the free region.
    unsafe fn write_at(&self, pos: u64, data: &[u8]) {
        let cap = self.capacity as usize;
        let off = self.offset(pos);
        let first = data.len().min(cap - off);
        ptr::copy_nonoverlapping(data.as_ptr(), self.buf.as_ptr().add(off), first);
        if first < data.len() {
            ptr::copy_nonoverlapping(data.as_ptr().add(first), self.buf.as_ptr(), data.len() - first);
        }
    }

    /// Copy out of the ring starting at absolute position `pos`.
    ///
    /// Safety: caller is the consumer and `[pos, pos + out.len())` lies
    /// inside the published region.
    unsafe fn read_at(&self, pos: u64, out: &mut [u8]) {
        let cap = self.capacity as usize;
        let off = self.offset(pos);
        let first = out.len().min(cap - off);
        ptr::copy_nonoverlapping(self.buf.as_ptr().add(off), out.as_mut_ptr(), first);
        if first < out.len() {
            ptr::copy_nonoverlapping(self.buf.as_ptr(), out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}

/// Constructor namespace for fifo pairs.
pub struct Fifo;

impl Fifo {
    /// A fifo outside any segment. Used by tests and tools.
    pub fn new(capacity: u32) -> Result<(FifoProducer, FifoConsumer), FifoError> {
        Self::with_lease(capacity, None)
    }

    pub(crate) fn with_lease(
        capacity: u32,
        lease: Option<SegmentLease>,
    ) -> Result<(FifoProducer, FifoConsumer), FifoError> {
        if capacity == 0 || capacity > MAX_FIFO_SIZE {
            return Err(FifoError::InvalidSize(capacity));
        }
        let mut map = MmapMut::map_anon(capacity as usize)?;
        let buf = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "anonymous mapping returned null")
        })?;
        let shared = Arc::new(FifoShared {
            buf,
            _map: map,
            capacity,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            has_event: AtomicBool::new(false),
            _lease: lease,
        });
        Ok((
            FifoProducer {
                shared: shared.clone(),
                ooo: Vec::new(),
            },
            FifoConsumer { shared },
        ))
    }
}

// ── Producer ─────────────────────────────────────────────────────────────────

/// Writing end of a fifo.
pub struct FifoProducer {
    shared: Arc<FifoShared>,
    /// Absolute byte ranges written past the tail, sorted, never touching.
    ooo: Vec<Range<u64>>,
}

impl FifoProducer {
    pub fn capacity(&self) -> u32 {
        self.shared.capacity
    }

    pub fn max_dequeue(&self) -> u32 {
        self.shared.max_dequeue()
    }

    pub fn max_enqueue(&self) -> u32 {
        self.shared.max_enqueue()
    }

    /// `(max_dequeue, max_enqueue)` from a single cursor snapshot.
    pub fn accounting(&self) -> (u32, u32) {
        self.shared.accounting()
    }

    /// Append in-order bytes. Writes at most `max_enqueue()` bytes and
    /// returns how many were taken; never overwrites unread data.
    pub fn enqueue(&mut self, data: &[u8]) -> usize {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        let free = (self.shared.capacity - self.shared.used(head, tail)) as usize;
        let n = data.len().min(free);
        if n == 0 {
            return 0;
        }
        // Safety: [tail, tail + n) is inside the free region.
        unsafe { self.shared.write_at(tail, &data[..n]) };
        let new_tail = self.absorb_ooo(tail + n as u64);
        self.shared.tail.store(new_tail, Ordering::Release);
        n
    }

    /// Write `data` at `offset` bytes past the tail without publishing it.
    /// The bytes become readable once the gap before them is filled.
    pub fn enqueue_at(&mut self, offset: u32, data: &[u8]) -> Result<usize, FifoError> {
        if offset == 0 {
            return Ok(self.enqueue(data));
        }
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        let free = self.shared.capacity - self.shared.used(head, tail);
        if u64::from(offset) + data.len() as u64 > u64::from(free) {
            return Err(FifoError::OutOfRange {
                offset,
                len: data.len(),
                free,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }
        let start = tail + u64::from(offset);
        // Safety: the whole range was checked against the free region.
        unsafe { self.shared.write_at(start, data) };
        self.insert_ooo(start..start + data.len() as u64);
        Ok(data.len())
    }

    /// Bytes written out of order and not yet readable.
    pub fn ooo_bytes(&self) -> u64 {
        self.ooo.iter().map(|r| r.end - r.start).sum()
    }

    /// Number of disjoint out-of-order ranges.
    pub fn ooo_segments(&self) -> usize {
        self.ooo.len()
    }

    /// Mark the fifo as having a pending event. Returns true when the flag
    /// was previously clear, i.e. the caller must notify the consumer.
    pub fn set_event(&self) -> bool {
        !self.shared.has_event.swap(true, Ordering::AcqRel)
    }

    pub fn has_event(&self) -> bool {
        self.shared.has_event.load(Ordering::Acquire)
    }

    fn insert_ooo(&mut self, range: Range<u64>) {
        let (mut start, mut end) = (range.start, range.end);
        self.ooo.retain(|r| {
            if r.end < start || r.start > end {
                true
            } else {
                start = start.min(r.start);
                end = end.max(r.end);
                false
            }
        });
        let at = self.ooo.partition_point(|r| r.start < start);
        self.ooo.insert(at, start..end);
    }

    /// Extend a freshly advanced tail over any out-of-order ranges it reached.
    fn absorb_ooo(&mut self, mut tail: u64) -> u64 {
        let mut absorbed = 0;
        for r in &self.ooo {
            if r.start > tail {
                break;
            }
            tail = tail.max(r.end);
            absorbed += 1;
        }
        self.ooo.drain(..absorbed);
        tail
    }
}

impl fmt::Debug for FifoProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoProducer")
            .field("capacity", &self.capacity())
            .field("max_dequeue", &self.max_dequeue())
            .field("ooo_segments", &self.ooo.len())
            .field("has_event", &self.has_event())
            .finish()
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

/// Reading end of a fifo.
pub struct FifoConsumer {
    shared: Arc<FifoShared>,
}

impl FifoConsumer {
    pub fn capacity(&self) -> u32 {
        self.shared.capacity
    }

    pub fn max_dequeue(&self) -> u32 {
        self.shared.max_dequeue()
    }

    pub fn max_enqueue(&self) -> u32 {
        self.shared.max_enqueue()
    }

    /// `(max_dequeue, max_enqueue)` from a single cursor snapshot.
    pub fn accounting(&self) -> (u32, u32) {
        self.shared.accounting()
    }

    /// Copy up to `buf.len()` bytes starting `offset` bytes past the head,
    /// without consuming them.
    pub fn peek(&self, offset: u32, buf: &mut [u8]) -> usize {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        let avail = self.shared.used(head, tail);
        if offset >= avail {
            return 0;
        }
        let n = buf.len().min((avail - offset) as usize);
        // Safety: [head + offset, head + offset + n) is published.
        unsafe { self.shared.read_at(head + u64::from(offset), &mut buf[..n]) };
        n
    }

    /// Consume into `buf`. Returns the number of bytes read.
    pub fn dequeue_into(&mut self, buf: &mut [u8]) -> usize {
        let n = self.peek(0, buf);
        self.advance(n);
        n
    }

    /// Consume up to `max` bytes.
    pub fn dequeue(&mut self, max: usize) -> Bytes {
        let n = max.min(self.max_dequeue() as usize);
        if n == 0 {
            return Bytes::new();
        }
        let mut out = vec![0u8; n];
        let read = self.dequeue_into(&mut out);
        out.truncate(read);
        Bytes::from(out)
    }

    /// Consume up to `n` bytes without copying them anywhere.
    pub fn dequeue_drop(&mut self, n: u32) -> u32 {
        let n = n.min(self.max_dequeue());
        self.advance(n as usize);
        n
    }

    /// Clear the pending-event flag. Called before reading so a refill that
    /// races with this read raises a fresh notification.
    pub fn clear_event(&self) {
        self.shared.has_event.store(false, Ordering::Release);
    }

    pub fn has_event(&self) -> bool {
        self.shared.has_event.load(Ordering::Acquire)
    }

    fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let head = self.shared.head.load(Ordering::Relaxed);
        self.shared.head.store(head + n as u64, Ordering::Release);
    }
}

impl fmt::Debug for FifoConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoConsumer")
            .field("capacity", &self.capacity())
            .field("max_dequeue", &self.max_dequeue())
            .field("has_event", &self.has_event())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(cap: u32) -> (FifoProducer, FifoConsumer) {
        Fifo::new(cap).unwrap()
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(Fifo::new(0), Err(FifoError::InvalidSize(0))));
    }

    #[test]
    fn accounting_holds_across_interleaved_ops() {
        let (mut p, mut c) = pair(64);
        let ops: &[(bool, usize)] = &[
            (true, 10),
            (true, 30),
            (false, 5),
            (true, 40),
            (false, 64),
            (true, 64),
            (false, 17),
            (true, 3),
            (false, 1),
        ];
        let mut expected = 0usize;
        for &(is_enq, n) in ops {
            if is_enq {
                let data = vec![0xab; n];
                expected += p.enqueue(&data);
            } else {
                expected -= c.dequeue(n).len();
            }
            assert_eq!(p.max_dequeue() + p.max_enqueue(), 64);
            assert_eq!(c.max_dequeue() + c.max_enqueue(), 64);
            assert_eq!(c.max_dequeue() as usize, expected);
        }
    }

    #[test]
    fn full_fifo_short_writes_and_never_overwrites() {
        let (mut p, mut c) = pair(8);
        assert_eq!(p.enqueue(b"abcdef"), 6);
        assert_eq!(p.enqueue(b"ghijkl"), 2);
        assert_eq!(p.enqueue(b"x"), 0);
        assert_eq!(&c.dequeue(100)[..], b"abcdefgh");
    }

    #[test]
    fn data_survives_wraparound() {
        let (mut p, mut c) = pair(8);
        p.enqueue(b"123456");
        assert_eq!(&c.dequeue(4)[..], b"1234");
        assert_eq!(p.enqueue(b"789abc"), 6);
        assert_eq!(&c.dequeue(8)[..], b"56789abc");
    }

    #[test]
    fn peek_and_drop() {
        let (mut p, mut c) = pair(16);
        p.enqueue(b"hello world");
        let mut buf = [0u8; 5];
        assert_eq!(c.peek(6, &mut buf), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(c.dequeue_drop(6), 6);
        assert_eq!(&c.dequeue(16)[..], b"world");
        assert_eq!(c.peek(0, &mut buf), 0);
    }

    #[test]
    fn gap_hides_out_of_order_bytes() {
        let (mut p, mut c) = pair(32);
        assert_eq!(p.enqueue_at(4, b"EFGH").unwrap(), 4);
        assert_eq!(c.max_dequeue(), 0);
        assert_eq!(c.dequeue(32).len(), 0);
        assert_eq!(p.ooo_bytes(), 4);

        // Filling the gap publishes both pieces at once.
        assert_eq!(p.enqueue(b"ABCD"), 4);
        assert_eq!(c.max_dequeue(), 8);
        assert_eq!(p.ooo_bytes(), 0);
        assert_eq!(&c.dequeue(32)[..], b"ABCDEFGH");
    }

    #[test]
    fn out_of_order_ranges_coalesce() {
        let (mut p, mut c) = pair(32);
        p.enqueue_at(10, b"KL").unwrap();
        p.enqueue_at(2, b"CD").unwrap();
        p.enqueue_at(4, b"EFGHIJ").unwrap();
        assert_eq!(p.ooo_segments(), 1);
        assert_eq!(c.max_dequeue(), 0);
        p.enqueue(b"AB");
        assert_eq!(&c.dequeue(32)[..], b"ABCDEFGHIJKL");
    }

    #[test]
    fn partial_fill_exposes_only_contiguous_prefix() {
        let (mut p, c) = pair(32);
        p.enqueue_at(8, b"later").unwrap();
        p.enqueue(b"abc");
        assert_eq!(c.max_dequeue(), 3);
        assert_eq!(p.ooo_segments(), 1);
    }

    #[test]
    fn out_of_order_beyond_free_space_rejected() {
        let (mut p, _c) = pair(16);
        p.enqueue(&[0; 10]);
        let err = p.enqueue_at(4, b"abc").unwrap_err();
        assert!(matches!(err, FifoError::OutOfRange { free: 6, .. }));
    }

    #[test]
    fn producer_and_consumer_on_separate_threads() {
        const TOTAL: usize = 2 << 20;
        let (mut p, mut c) = pair(61);
        let pattern = |i: usize| (i % 251) as u8;

        let producer = std::thread::spawn(move || {
            let mut sent = 0;
            while sent < TOTAL {
                let chunk: Vec<u8> = (sent..(sent + 17).min(TOTAL)).map(pattern).collect();
                let n = p.enqueue(&chunk);
                if n == 0 {
                    std::thread::yield_now();
                }
                let (used, free) = p.accounting();
                assert_eq!(used + free, 61);
                sent += n;
            }
        });

        let mut received = 0;
        let mut buf = [0u8; 23];
        while received < TOTAL {
            let n = c.dequeue_into(&mut buf);
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            for (i, b) in buf[..n].iter().enumerate() {
                assert_eq!(*b, pattern(received + i), "byte {}", received + i);
            }
            let (used, free) = c.accounting();
            assert_eq!(used + free, 61);
            received += n;
        }
        producer.join().unwrap();
        assert_eq!(c.max_dequeue(), 0);
    }

    #[test]
    fn event_flag_notifies_once_per_wake() {
        let (mut p, c) = pair(16);
        p.enqueue(b"a");
        assert!(p.set_event());
        p.enqueue(b"b");
        assert!(!p.set_event());
        c.clear_event();
        p.enqueue(b"c");
        assert!(p.set_event());
    }
}
