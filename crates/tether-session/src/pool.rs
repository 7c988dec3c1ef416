//! Per-worker session pool.
//!
//! Indices are stable for the life of a session. A deleted session keeps
//! its slot (so stale handles resolve to "closed") until the end of the
//! quantum after the one it was deleted in.

use slab::Slab;

use crate::session::{Session, SessionState};

#[derive(Debug, thiserror::Error)]
#[error("session pool full ({max} sessions)")]
pub struct PoolFull {
    pub max: usize,
}

#[derive(Debug)]
pub struct SessionPool {
    slab: Slab<Session>,
    max: usize,
    /// Deleted this quantum.
    reclaim_pending: Vec<u32>,
    /// Deleted last quantum; freed at the end of this one.
    reclaim_ready: Vec<u32>,
}

impl SessionPool {
    pub fn new(max: usize, preallocated: usize) -> Self {
        Self {
            slab: Slab::with_capacity(preallocated),
            max,
            reclaim_pending: Vec::new(),
            reclaim_ready: Vec::new(),
        }
    }

    /// Allocate a slot; `build` receives the new index.
    pub fn alloc(&mut self, build: impl FnOnce(u32) -> Session) -> Result<u32, PoolFull> {
        if self.slab.len() >= self.max {
            return Err(PoolFull { max: self.max });
        }
        let entry = self.slab.vacant_entry();
        let index = entry.key() as u32;
        entry.insert(build(index));
        Ok(index)
    }

    /// Any allocated slot, including deleted sessions awaiting reclamation.
    pub fn get(&self, index: u32) -> Option<&Session> {
        self.slab.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Session> {
        self.slab.get_mut(index as usize)
    }

    /// Only sessions that have not reached `TRANSPORT_DELETED`.
    pub fn get_if_valid(&self, index: u32) -> Option<&Session> {
        self.get(index)
            .filter(|s| s.state != SessionState::TransportDeleted)
    }

    /// Queue a deleted session for reclamation.
    pub fn defer_free(&mut self, index: u32) {
        match self.slab.get(index as usize) {
            Some(s) if s.state == SessionState::TransportDeleted => {}
            Some(s) => panic!(
                "session pool corrupted: freeing [{}:{}] in state {}",
                s.thread_index, index, s.state
            ),
            None => panic!("session pool corrupted: freeing unallocated index {index}"),
        }
        if self.reclaim_pending.contains(&index) || self.reclaim_ready.contains(&index) {
            panic!("session pool corrupted: index {index} freed twice");
        }
        self.reclaim_pending.push(index);
    }

    /// Close out a processing quantum. Returns the number of slots freed.
    pub fn end_quantum(&mut self) -> usize {
        let freed = self.reclaim_ready.len();
        for index in self.reclaim_ready.drain(..) {
            self.slab.remove(index as usize);
        }
        std::mem::swap(&mut self.reclaim_ready, &mut self.reclaim_pending);
        freed
    }

    /// Allocated slots, deleted-but-unreclaimed included.
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slab.iter().map(|(_, s)| s)
    }

    /// Indices of sessions matching `pred`. Collected so the caller can
    /// mutate the pool while walking the result.
    pub fn indices_where(&self, pred: impl Fn(&Session) -> bool) -> Vec<u32> {
        self.slab
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(i, _)| i as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Endpoint, SessionTuple, TransportProto};

    fn tuple() -> SessionTuple {
        SessionTuple {
            proto: TransportProto::Loopback,
            fib_index: 0,
            lcl: Endpoint::unspecified(),
            rmt: Endpoint::unspecified(),
        }
    }

    fn alloc(pool: &mut SessionPool) -> u32 {
        pool.alloc(|i| Session::new(1, i, tuple(), 0)).unwrap()
    }

    fn delete(pool: &mut SessionPool, index: u32) {
        pool.get_mut(index).unwrap().state = SessionState::TransportDeleted;
        pool.defer_free(index);
    }

    #[test]
    fn alloc_respects_max() {
        let mut pool = SessionPool::new(2, 0);
        alloc(&mut pool);
        alloc(&mut pool);
        assert!(pool.alloc(|i| Session::new(1, i, tuple(), 0)).is_err());
    }

    #[test]
    fn deleted_slot_survives_one_full_quantum() {
        let mut pool = SessionPool::new(8, 0);
        let a = alloc(&mut pool);
        delete(&mut pool, a);

        // Quantum of deletion ends: still resolvable, reported closed.
        assert_eq!(pool.end_quantum(), 0);
        assert!(pool.get(a).is_some());
        assert!(pool.get_if_valid(a).is_none());
        // A new allocation must not reuse the slot yet.
        let b = alloc(&mut pool);
        assert_ne!(a, b);

        // Next quantum ends: slot reclaimed.
        assert_eq!(pool.end_quantum(), 1);
        assert!(pool.get(a).is_none());
    }

    #[test]
    #[should_panic(expected = "session pool corrupted")]
    fn freeing_a_live_session_is_fatal() {
        let mut pool = SessionPool::new(8, 0);
        let a = alloc(&mut pool);
        pool.defer_free(a);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let mut pool = SessionPool::new(8, 0);
        let a = alloc(&mut pool);
        delete(&mut pool, a);
        pool.defer_free(a);
    }
}
