//! Recycling allocator for fixed-shape blocks (vector-clock chunks).
//!
//! Clocks churn on every release operation, so their chunks go through a
//! per-thread [SlabCache] that refills from, and spills back to, a single
//! process-wide [SlabAlloc] in batches. The global free list is the only
//! point of contention and is touched once per batch, not once per chunk.
//!
//! Recycled blocks are handed back as-is; callers reset whatever state they
//! care about.

use parking_lot::Mutex;
use std::sync::Arc;

/// How many blocks move between a cache and the global list at a time.
const BATCH: usize = 16;
/// A cache holding this many free blocks spills half of them.
const SPILL_WATERMARK: usize = 4 * BATCH;

/// The process-wide free list.
pub(crate) struct SlabAlloc<T> {
    free: Mutex<Vec<Box<T>>>,
}

impl<T: Default> SlabAlloc<T> {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Move up to [BATCH] recycled blocks into `into`, minting fresh ones for
    /// any shortfall. Allocation is infallible: running out of memory here is
    /// handled by the global allocator aborting, not by us.
    fn refill(&self, into: &mut Vec<Box<T>>) {
        {
            let mut free = self.free.lock();
            let take = BATCH.min(free.len());
            let at = free.len() - take;
            into.extend(free.drain(at..));
        }
        while into.len() < BATCH {
            into.push(Box::default());
        }
    }

    fn spill(&self, from: &mut Vec<Box<T>>, keep: usize) {
        let mut free = self.free.lock();
        free.extend(from.drain(keep..));
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}

/// A per-thread cache over a [SlabAlloc]. Exclusively owned by its thread;
/// never shared.
pub(crate) struct SlabCache<T: Default> {
    shared: Arc<SlabAlloc<T>>,
    free: Vec<Box<T>>,
}

impl<T: Default> SlabCache<T> {
    pub(crate) fn new(shared: Arc<SlabAlloc<T>>) -> Self {
        Self {
            shared,
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self) -> Box<T> {
        if self.free.is_empty() {
            self.shared.refill(&mut self.free);
        }
        // refill guarantees at least one block.
        self.free.pop().unwrap()
    }

    pub(crate) fn free(&mut self, block: Box<T>) {
        self.free.push(block);
        if self.free.len() >= SPILL_WATERMARK {
            self.shared.spill(&mut self.free, SPILL_WATERMARK / 2);
        }
    }
}

impl<T: Default> Drop for SlabCache<T> {
    fn drop(&mut self) {
        self.shared.spill(&mut self.free, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::{SlabAlloc, SlabCache, BATCH, SPILL_WATERMARK};
    use std::sync::Arc;

    #[test]
    fn alloc_free_recycles() {
        let shared = Arc::new(SlabAlloc::<[u64; 4]>::new());
        let mut cache = SlabCache::new(Arc::clone(&shared));
        let mut b = cache.alloc();
        b[0] = 0xdead;
        cache.free(b);
        // The same block comes straight back, payload intact.
        let b = cache.alloc();
        assert_eq!(b[0], 0xdead);
    }

    #[test]
    fn spill_bounds_the_cache() {
        let shared = Arc::new(SlabAlloc::<u64>::new());
        let mut cache = SlabCache::new(Arc::clone(&shared));
        let blocks: Vec<_> = (0..SPILL_WATERMARK).map(|_| cache.alloc()).collect();
        for b in blocks {
            cache.free(b);
        }
        assert_eq!(cache.free.len(), SPILL_WATERMARK / 2);
        assert!(shared.free_len() >= SPILL_WATERMARK / 2);
    }

    #[test]
    fn drop_flushes_to_shared() {
        let shared = Arc::new(SlabAlloc::<u64>::new());
        {
            let mut cache = SlabCache::new(Arc::clone(&shared));
            let b = cache.alloc();
            cache.free(b);
        }
        assert_eq!(shared.free_len(), BATCH);
    }

    #[test]
    fn refill_prefers_recycled_blocks() {
        let shared = Arc::new(SlabAlloc::<u64>::new());
        {
            let mut donor = SlabCache::new(Arc::clone(&shared));
            let mut b = donor.alloc();
            *b = 7;
            donor.free(b);
        }
        let before = shared.free_len();
        let mut cache = SlabCache::new(Arc::clone(&shared));
        cache.alloc();
        assert!(shared.free_len() < before);
    }
}
