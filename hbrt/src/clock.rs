//! Vector clocks: the tid -> epoch mappings that carry the happens-before
//! relation.
//!
//! A clock is stored as a vector of fixed-size chunks so that its footprint
//! is proportional to the highest tid it has ever observed, not to the tid
//! space. Chunks come from the owning thread's [SlabCache]; a clock is
//! explicitly drained back into a cache rather than dropped, so chunk memory
//! keeps circulating instead of hitting the global allocator.

use crate::slab::{SlabAlloc, SlabCache};
use crate::threads::Tid;

/// A thread-local timestamp. Monotonic per thread; 40 bits survive packing
/// into a shadow slot.
pub(crate) type Epoch = u64;

/// Epochs per clock chunk.
pub(crate) const CHUNK_EPOCHS: usize = 128;

pub(crate) struct ClockChunk(pub(crate) [Epoch; CHUNK_EPOCHS]);

impl Default for ClockChunk {
    fn default() -> Self {
        ClockChunk([0; CHUNK_EPOCHS])
    }
}

pub(crate) type ClockAlloc = SlabAlloc<ClockChunk>;
pub(crate) type ClockCache = SlabCache<ClockChunk>;

/// A growable tid -> epoch mapping. Components never decrease.
pub(crate) struct VectorClock {
    chunks: Vec<Box<ClockChunk>>,
}

impl VectorClock {
    pub(crate) const fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// The epoch of `tid` as observed by this clock; 0 if never observed.
    #[inline]
    pub(crate) fn get(&self, tid: Tid) -> Epoch {
        let tid = tid as usize;
        match self.chunks.get(tid / CHUNK_EPOCHS) {
            Some(c) => c.0[tid % CHUNK_EPOCHS],
            None => 0,
        }
    }

    /// Overwrite one component. `epoch` must not regress the component.
    pub(crate) fn set(&mut self, tid: Tid, epoch: Epoch, cache: &mut ClockCache) {
        debug_assert!(epoch >= self.get(tid));
        let tid = tid as usize;
        self.grow(tid / CHUNK_EPOCHS + 1, cache);
        self.chunks[tid / CHUNK_EPOCHS].0[tid % CHUNK_EPOCHS] = epoch;
    }

    /// Pointwise max with `other`: after this call, self has observed
    /// everything `other` has.
    pub(crate) fn acquire(&mut self, other: &VectorClock, cache: &mut ClockCache) {
        self.grow(other.chunks.len(), cache);
        for (mine, theirs) in self.chunks.iter_mut().zip(other.chunks.iter()) {
            for (m, t) in mine.0.iter_mut().zip(theirs.0.iter()) {
                if *t > *m {
                    *m = *t;
                }
            }
        }
    }

    /// Ensure `target >= self` componentwise, growing `target` from `cache`
    /// as needed.
    pub(crate) fn release_into(&self, target: &mut VectorClock, cache: &mut ClockCache) {
        target.grow(self.chunks.len(), cache);
        for (theirs, mine) in target.chunks.iter_mut().zip(self.chunks.iter()) {
            for (t, m) in theirs.0.iter_mut().zip(mine.0.iter()) {
                if *m > *t {
                    *t = *m;
                }
            }
        }
    }

    /// Drain the clock's chunks back into `cache`, leaving it empty.
    pub(crate) fn free(&mut self, cache: &mut ClockCache) {
        for chunk in self.chunks.drain(..) {
            cache.free(chunk);
        }
    }

    fn grow(&mut self, nchunks: usize, cache: &mut ClockCache) {
        while self.chunks.len() < nchunks {
            let mut chunk = cache.alloc();
            // Recycled chunks carry a previous clock's payload.
            chunk.0 = [0; CHUNK_EPOCHS];
            self.chunks.push(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClockAlloc, ClockCache, VectorClock, CHUNK_EPOCHS};
    use std::sync::Arc;

    fn cache() -> ClockCache {
        ClockCache::new(Arc::new(ClockAlloc::new()))
    }

    #[test]
    fn unobserved_tids_read_zero() {
        let clk = VectorClock::new();
        assert_eq!(clk.get(0), 0);
        assert_eq!(clk.get(12345), 0);
    }

    #[test]
    fn set_then_get() {
        let mut cache = cache();
        let mut clk = VectorClock::new();
        clk.set(3, 17, &mut cache);
        assert_eq!(clk.get(3), 17);
        assert_eq!(clk.get(2), 0);
        // A tid in a later chunk grows the clock without disturbing others.
        let far = (2 * CHUNK_EPOCHS + 1) as u32;
        clk.set(far, 9, &mut cache);
        assert_eq!(clk.get(far), 9);
        assert_eq!(clk.get(3), 17);
    }

    #[test]
    fn acquire_is_pointwise_max() {
        let mut cache = cache();
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.set(0, 10, &mut cache);
        a.set(1, 5, &mut cache);
        b.set(1, 7, &mut cache);
        b.set(2, 3, &mut cache);
        a.acquire(&b, &mut cache);
        assert_eq!(a.get(0), 10);
        assert_eq!(a.get(1), 7);
        assert_eq!(a.get(2), 3);
        // b is untouched.
        assert_eq!(b.get(0), 0);
    }

    #[test]
    fn release_grows_target() {
        let mut cache = cache();
        let mut src = VectorClock::new();
        let mut dst = VectorClock::new();
        src.set(200, 42, &mut cache);
        dst.set(0, 99, &mut cache);
        src.release_into(&mut dst, &mut cache);
        assert_eq!(dst.get(200), 42);
        assert_eq!(dst.get(0), 99);
    }

    #[test]
    fn freed_chunks_come_back_clean() {
        let mut cache = cache();
        let mut clk = VectorClock::new();
        clk.set(5, 1000, &mut cache);
        clk.free(&mut cache);
        assert_eq!(clk.get(5), 0);
        let mut clk2 = VectorClock::new();
        clk2.set(9, 1, &mut cache);
        // The recycled chunk must not leak the old component for tid 5.
        assert_eq!(clk2.get(5), 0);
        assert_eq!(clk2.get(9), 1);
    }

    #[test]
    fn release_acquire_transfers_observation() {
        let mut cache = cache();
        let mut producer = VectorClock::new();
        producer.set(1, 50, &mut cache);
        let mut sync = VectorClock::new();
        producer.release_into(&mut sync, &mut cache);
        let mut consumer = VectorClock::new();
        consumer.acquire(&sync, &mut cache);
        assert!(consumer.get(1) >= 50);
    }
}
