//! The thread registry: one context per tid, a status machine driving the
//! create/start/finish/join/detach protocol, and a bounded list of dead
//! threads whose traces are kept around so races against them can still be
//! given a stack.
//!
//! Everything here is called with the registry mutex held (see
//! [crate::rt::Global]); the registry itself is plain data.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::{ClockCache, Epoch, VectorClock};
use crate::shadow::TID_BITS;
use crate::trace::Trace;

/// Dense small thread id, assigned by the registry. Distinct from the
/// user-visible (pthread-style) id, which the registry only stores opaquely.
pub type Tid = u32;

pub(crate) const MAX_TID: usize = 1 << TID_BITS;

/// How many joined threads keep their trace before the oldest is dropped.
pub(crate) const DEAD_THREAD_RETENTION: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ThreadStatus {
    /// Slot unused; data is meaningless.
    Invalid,
    /// Created but not yet running.
    Created,
    Running,
    /// Joinable thread that exited but has not been joined.
    Finished,
    /// Joined; only the retained trace is still live.
    Dead,
}

pub(crate) struct ThreadContext {
    pub(crate) tid: Tid,
    pub(crate) status: ThreadStatus,
    /// Opaque user thread id (e.g. a pthread_t).
    pub(crate) uid: u64,
    pub(crate) detached: bool,
    /// How many lifetimes this slot has hosted.
    pub(crate) reuse_count: u32,
    /// Clock released into by the creator and by the finishing thread,
    /// acquired at start and join.
    pub(crate) sync: VectorClock,
    /// First epoch of the current lifetime. Events stamped earlier belong to
    /// a previous occupant of the tid and are discarded on reconstruction.
    pub(crate) epoch0: Epoch,
    /// Final epoch of the previous lifetime; the next occupant starts one
    /// past it so epochs never repeat within a tid.
    pub(crate) last_epoch: Epoch,
    /// The live thread's trace, shared with its `ThreadState`.
    pub(crate) trace: Option<Arc<Trace>>,
    /// Trace retained after finish for post-mortem stack reconstruction.
    pub(crate) dead_info: Option<Arc<Trace>>,
}

impl ThreadContext {
    fn new(tid: Tid) -> Self {
        Self {
            tid,
            status: ThreadStatus::Invalid,
            uid: 0,
            detached: false,
            reuse_count: 0,
            sync: VectorClock::new(),
            epoch0: 0,
            last_epoch: 0,
            trace: None,
            dead_info: None,
        }
    }
}

pub(crate) struct ThreadRegistry {
    /// Index is the tid. Grows on demand, never shrinks.
    contexts: Vec<ThreadContext>,
    /// FIFO of `Dead` tids, oldest first.
    dead: VecDeque<Tid>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            contexts: Vec::new(),
            dead: VecDeque::new(),
        }
    }

    /// Claim the smallest free tid, or `None` if the tid space is exhausted.
    /// The slot comes back as `Created` with creator-visible fields reset.
    pub(crate) fn alloc_tid(&mut self, uid: u64, detached: bool) -> Option<Tid> {
        let tid = match self
            .contexts
            .iter()
            .position(|c| c.status == ThreadStatus::Invalid)
        {
            Some(i) => i as Tid,
            None => {
                if self.contexts.len() >= MAX_TID {
                    return None;
                }
                self.contexts.push(ThreadContext::new(self.contexts.len() as Tid));
                (self.contexts.len() - 1) as Tid
            }
        };
        let ctx = &mut self.contexts[tid as usize];
        ctx.status = ThreadStatus::Created;
        ctx.uid = uid;
        ctx.detached = detached;
        ctx.reuse_count += 1;
        ctx.dead_info = None;
        Some(tid)
    }

    pub(crate) fn get(&self, tid: Tid) -> Option<&ThreadContext> {
        self.contexts.get(tid as usize)
    }

    pub(crate) fn get_mut(&mut self, tid: Tid) -> Option<&mut ThreadContext> {
        self.contexts.get_mut(tid as usize)
    }

    /// Map a user thread id to its tid. Linear, bounded by the highest tid
    /// ever allocated; only used off the hot path.
    pub(crate) fn find_by_uid(&self, uid: u64) -> Option<Tid> {
        self.contexts
            .iter()
            .find(|c| c.uid == uid && c.status != ThreadStatus::Invalid)
            .map(|c| c.tid)
    }

    /// Append a joined thread to the dead list. Returns the evicted oldest
    /// tid if the list was full; the caller must free that context.
    pub(crate) fn push_dead(&mut self, tid: Tid) -> Option<Tid> {
        self.dead.push_back(tid);
        if self.dead.len() > DEAD_THREAD_RETENTION {
            self.dead.pop_front()
        } else {
            None
        }
    }

    /// Return the slot to `Invalid`, releasing everything but the epoch
    /// continuation. Clock chunks go back to the calling thread's cache.
    pub(crate) fn free_context(&mut self, tid: Tid, cache: &mut ClockCache) {
        let ctx = &mut self.contexts[tid as usize];
        ctx.status = ThreadStatus::Invalid;
        ctx.uid = 0;
        ctx.detached = false;
        ctx.trace = None;
        ctx.dead_info = None;
        ctx.sync.free(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::{ThreadRegistry, ThreadStatus, DEAD_THREAD_RETENTION};
    use crate::clock::{ClockAlloc, ClockCache};
    use std::sync::Arc;

    fn cache() -> ClockCache {
        ClockCache::new(Arc::new(ClockAlloc::new()))
    }

    #[test]
    fn tids_are_dense_from_zero() {
        let mut reg = ThreadRegistry::new();
        assert_eq!(reg.alloc_tid(100, false), Some(0));
        assert_eq!(reg.alloc_tid(101, false), Some(1));
        assert_eq!(reg.alloc_tid(102, true), Some(2));
        assert!(reg.get(1).unwrap().uid == 101);
        assert!(reg.get(2).unwrap().detached);
    }

    #[test]
    fn smallest_invalid_slot_is_recycled() {
        let mut reg = ThreadRegistry::new();
        let mut cache = cache();
        reg.alloc_tid(100, false);
        reg.alloc_tid(101, false);
        reg.alloc_tid(102, false);
        reg.free_context(1, &mut cache);
        assert_eq!(reg.alloc_tid(103, false), Some(1));
        assert_eq!(reg.get(1).unwrap().reuse_count, 2);
    }

    #[test]
    fn uid_lookup_skips_invalid_slots() {
        let mut reg = ThreadRegistry::new();
        let mut cache = cache();
        reg.alloc_tid(100, false);
        reg.alloc_tid(101, false);
        assert_eq!(reg.find_by_uid(101), Some(1));
        reg.free_context(1, &mut cache);
        assert_eq!(reg.find_by_uid(101), None);
    }

    #[test]
    fn dead_list_evicts_oldest() {
        let mut reg = ThreadRegistry::new();
        for i in 0..=DEAD_THREAD_RETENTION as u64 {
            let tid = reg.alloc_tid(100 + i, false).unwrap();
            reg.get_mut(tid).unwrap().status = ThreadStatus::Dead;
        }
        for tid in 0..DEAD_THREAD_RETENTION as u32 {
            assert_eq!(reg.push_dead(tid), None);
        }
        // One past capacity evicts the first pushed.
        assert_eq!(reg.push_dead(DEAD_THREAD_RETENTION as u32), Some(0));
    }

    #[test]
    fn epoch_continuation_survives_free() {
        let mut reg = ThreadRegistry::new();
        let mut cache = cache();
        let tid = reg.alloc_tid(100, false).unwrap();
        reg.get_mut(tid).unwrap().last_epoch = 500;
        reg.free_context(tid, &mut cache);
        reg.alloc_tid(200, false);
        assert_eq!(reg.get(tid).unwrap().last_epoch, 500);
    }
}
