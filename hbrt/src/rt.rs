//! The detector runtime: process-wide state, per-thread state, and the
//! operations instrumented programs call into.
//!
//! A [Detector] is a cheap-clone handle onto the process-wide [Global];
//! arbitrarily many handles may exist, all naming the same detector. Every
//! operation additionally threads the calling thread's [ThreadState]
//! explicitly: that state is exclusively owned by its thread, which is what
//! keeps the per-access path free of locks.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Condvar, Mutex};

use crate::clock::{ClockAlloc, ClockCache, Epoch, VectorClock};
use crate::log::{diag, die, Verbosity};
use crate::report::{
    self, DladdrSymbolizer, NoSuppression, ReportSink, StderrSink, Suppressor, Symbolizer,
};
use crate::shadow::{self, ShadowMemory, ShadowSlot};
use crate::stats::{self, Stat, StatCounts, Stats};
use crate::sync::{SyncKind, SyncTab, SyncVar};
use crate::threads::{ThreadRegistry, ThreadStatus, Tid, MAX_TID};
use crate::trace::{EventKind, Trace};

pub(crate) struct Global {
    pub(crate) shadow: Box<dyn ShadowMemory>,
    pub(crate) clock_slab: Arc<ClockAlloc>,
    pub(crate) synctab: SyncTab,
    pub(crate) registry: Mutex<ThreadRegistry>,
    /// Signalled whenever a thread transitions to `Finished`; joiners wait
    /// here.
    pub(crate) finished_cv: Condvar,
    /// Races serialize into a single report channel.
    pub(crate) report_mtx: Mutex<()>,
    pub(crate) nreported: AtomicU64,
    pub(crate) symbolizer: Box<dyn Symbolizer>,
    pub(crate) suppressor: Box<dyn Suppressor>,
    pub(crate) sink: Box<dyn ReportSink>,
    pub(crate) stats: Stats,
}

/// Everything the detector needs to know before the first thread runs. The
/// shadow projection is mandatory; the report-path collaborators default to
/// `dladdr` symbolization, no suppression, and stderr output.
pub struct DetectorOptions {
    shadow: Box<dyn ShadowMemory>,
    symbolizer: Box<dyn Symbolizer>,
    suppressor: Box<dyn Suppressor>,
    sink: Box<dyn ReportSink>,
}

impl DetectorOptions {
    pub fn new(shadow: impl ShadowMemory + 'static) -> Self {
        Self {
            shadow: Box::new(shadow),
            symbolizer: Box::new(DladdrSymbolizer),
            suppressor: Box::new(NoSuppression),
            sink: Box::new(StderrSink),
        }
    }

    pub fn with_symbolizer(mut self, s: impl Symbolizer + 'static) -> Self {
        self.symbolizer = Box::new(s);
        self
    }

    pub fn with_suppressor(mut self, s: impl Suppressor + 'static) -> Self {
        self.suppressor = Box::new(s);
        self
    }

    pub fn with_sink(mut self, s: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(s);
        self
    }
}

/// Per-thread detector state. Obtained from [Detector::thread_start], owned
/// by exactly one thread, and given back to [Detector::thread_finish] (or
/// [Detector::finalize] for thread 0).
pub struct ThreadState {
    tid: Tid,
    epoch: Epoch,
    /// This thread's epoch as of its last release operation. A shadow slot
    /// of ours stamped at or after this epoch summarizes any same-range
    /// access we make now, so the update can be skipped.
    fast_synch_epoch: Epoch,
    trace: Arc<Trace>,
    clock: VectorClock,
    clock_cache: ClockCache,
    stats: StatCounts,
}

impl ThreadState {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The epoch of `tid` this thread has observed (via acquire edges).
    pub fn observed(&self, tid: Tid) -> Epoch {
        self.clock.get(tid)
    }
}

/// The race detector. Clones share one underlying detector.
#[derive(Clone)]
pub struct Detector {
    global: Arc<Global>,
}

impl Detector {
    /// Build the process-wide state and bring up thread 0 (the thread calling
    /// this). Thread 0 is created detached: it is finalized, never joined.
    pub fn initialize(opts: DetectorOptions) -> (Detector, ThreadState) {
        let det = Detector {
            global: Arc::new(Global {
                shadow: opts.shadow,
                clock_slab: Arc::new(ClockAlloc::new()),
                synctab: SyncTab::new(),
                registry: Mutex::new(ThreadRegistry::new()),
                finished_cv: Condvar::new(),
                report_mtx: Mutex::new(()),
                nreported: AtomicU64::new(0),
                symbolizer: opts.symbolizer,
                suppressor: opts.suppressor,
                sink: opts.sink,
                stats: Stats::new(),
            }),
        };
        let tid = match det.global.registry.lock().alloc_tid(0, true) {
            Some(tid) => tid,
            None => die!("cannot allocate thread 0"),
        };
        debug_assert_eq!(tid, 0);
        let thr0 = det.thread_start(tid);
        (det, thr0)
    }

    /// Number of races reported so far.
    pub fn race_count(&self) -> u64 {
        self.global.nreported.load(Ordering::Relaxed)
    }

    /// Tear down after the last thread (other than thread 0) has finished.
    /// Returns the number of races reported, for exit-code purposes.
    pub fn finalize(&self, mut thr0: ThreadState) -> u64 {
        if thr0.tid != 0 {
            die!("finalize called with thread {}", thr0.tid);
        }
        thr0.clock.free(&mut thr0.clock_cache);
        self.global.stats.merge(&thr0.stats);
        self.global.stats.dump();
        let n = self.race_count();
        diag!(
            Verbosity::Lifecycle,
            "#0: finalize, {n} race(s) reported"
        );
        n
    }

    // Thread lifecycle ----------------------------------------------------

    /// Register a new thread about to be spawned by `thr`. Establishes the
    /// creator-happens-before-created edge and returns the dense tid the
    /// instrumentation must hand to [Detector::thread_start] on the new
    /// thread.
    pub fn thread_create(&self, thr: &mut ThreadState, uid: u64, detached: bool) -> Tid {
        stats::inc(&mut thr.stats, Stat::ThreadsCreated);
        let mut reg = self.global.registry.lock();
        let Some(tid) = reg.alloc_tid(uid, detached) else {
            die!("out of thread slots (max {MAX_TID})");
        };
        diag!(
            Verbosity::Lifecycle,
            "#{}: thread create tid={tid} uid={uid:#x} detached={detached}",
            thr.tid
        );
        if tid != 0 {
            let ctx = reg.get_mut(tid).unwrap();
            thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
            thr.fast_synch_epoch = thr.epoch;
            thr.clock.release_into(&mut ctx.sync, &mut thr.clock_cache);
        }
        tid
    }

    /// Called on the new thread itself, once, before any other operation.
    pub fn thread_start(&self, tid: Tid) -> ThreadState {
        let mut cache = ClockCache::new(Arc::clone(&self.global.clock_slab));
        let mut reg = self.global.registry.lock();
        let Some(ctx) = reg.get_mut(tid) else {
            die!("start of unregistered thread {tid}");
        };
        if ctx.status != ThreadStatus::Created {
            die!("thread {tid} started in state {:?}", ctx.status);
        }
        // Epochs continue across lifetimes of a tid, so events stamped by a
        // previous occupant can never masquerade as ours.
        let epoch0 = ctx.last_epoch + 1;
        ctx.epoch0 = epoch0;
        let trace = Arc::new(Trace::new(epoch0));
        ctx.trace = Some(Arc::clone(&trace));
        ctx.status = ThreadStatus::Running;
        let mut clock = VectorClock::new();
        clock.set(tid, epoch0, &mut cache);
        clock.acquire(&ctx.sync, &mut cache);
        diag!(
            Verbosity::Lifecycle,
            "#{tid}: thread start, epoch {epoch0}, lifetime {}",
            ctx.reuse_count
        );
        ThreadState {
            tid,
            epoch: epoch0,
            fast_synch_epoch: epoch0,
            trace,
            clock,
            clock_cache: cache,
            stats: stats::new_counts(),
        }
    }

    /// Called on the finishing thread, consuming its state. A joinable
    /// thread's clock is published for the joiner; a detached thread's slot
    /// is freed immediately.
    pub fn thread_finish(&self, mut thr: ThreadState) {
        stats::inc(&mut thr.stats, Stat::ThreadsFinished);
        let tid = thr.tid;
        {
            let mut reg = self.global.registry.lock();
            let detached = {
                let Some(ctx) = reg.get_mut(tid) else {
                    die!("finish of unregistered thread {tid}");
                };
                if ctx.status != ThreadStatus::Running {
                    die!("thread {tid} finished in state {:?}", ctx.status);
                }
                ctx.last_epoch = thr.epoch;
                ctx.detached
            };
            if detached {
                reg.free_context(tid, &mut thr.clock_cache);
            } else {
                let ctx = reg.get_mut(tid).unwrap();
                thr.clock.set(tid, thr.epoch, &mut thr.clock_cache);
                thr.fast_synch_epoch = thr.epoch;
                thr.clock.release_into(&mut ctx.sync, &mut thr.clock_cache);
                ctx.status = ThreadStatus::Finished;
                ctx.dead_info = ctx.trace.take();
                self.global.finished_cv.notify_all();
            }
        }
        diag!(Verbosity::Lifecycle, "#{tid}: thread finish");
        thr.clock.free(&mut thr.clock_cache);
        self.global.stats.merge(&thr.stats);
        // Dropping `thr` flushes its chunk cache back to the global slab.
    }

    /// Join the thread with user id `uid`, blocking until it has finished.
    /// Joining acquires everything the joined thread released at its finish.
    pub fn thread_join(&self, thr: &mut ThreadState, uid: u64) {
        let mut reg = self.global.registry.lock();
        let Some(tid) = reg.find_by_uid(uid) else {
            diag!(
                Verbosity::Warning,
                "#{}: join of non-existent thread uid={uid:#x}",
                thr.tid
            );
            return;
        };
        if tid == thr.tid {
            diag!(Verbosity::Warning, "#{}: join of self", thr.tid);
            return;
        }
        if reg.get(tid).unwrap().detached {
            diag!(
                Verbosity::Warning,
                "#{}: join of detached thread {tid}",
                thr.tid
            );
            return;
        }
        while matches!(
            reg.get(tid).unwrap().status,
            ThreadStatus::Created | ThreadStatus::Running
        ) {
            self.global.finished_cv.wait(&mut reg);
        }
        let ctx = reg.get_mut(tid).unwrap();
        if ctx.status != ThreadStatus::Finished {
            diag!(
                Verbosity::Warning,
                "#{}: join of thread {tid} in state {:?}",
                thr.tid,
                ctx.status
            );
            return;
        }
        thr.clock.acquire(&ctx.sync, &mut thr.clock_cache);
        ctx.status = ThreadStatus::Dead;
        diag!(Verbosity::Lifecycle, "#{}: joined thread {tid}", thr.tid);
        if let Some(evicted) = reg.push_dead(tid) {
            reg.free_context(evicted, &mut thr.clock_cache);
        }
    }

    /// Mark the thread with user id `uid` as detached; if it has already
    /// finished, free it now.
    pub fn thread_detach(&self, thr: &mut ThreadState, uid: u64) {
        let mut reg = self.global.registry.lock();
        let Some(tid) = reg.find_by_uid(uid) else {
            diag!(
                Verbosity::Warning,
                "#{}: detach of non-existent thread uid={uid:#x}",
                thr.tid
            );
            return;
        };
        diag!(Verbosity::Lifecycle, "#{}: detach thread {tid}", thr.tid);
        if reg.get(tid).unwrap().status == ThreadStatus::Finished {
            reg.free_context(tid, &mut thr.clock_cache);
        } else {
            reg.get_mut(tid).unwrap().detached = true;
        }
    }

    // Memory accesses -----------------------------------------------------

    /// Record one memory access and check it for races. `size` must be 1, 2,
    /// 4 or 8 and `addr..addr+size` must not cross an 8-byte boundary; use
    /// [Detector::memory_access_range] for anything else.
    pub fn memory_access(
        &self,
        thr: &mut ThreadState,
        pc: usize,
        addr: usize,
        size: usize,
        is_write: bool,
    ) {
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        stats::inc(&mut thr.stats, Stat::Mop);
        stats::inc(
            &mut thr.stats,
            if is_write { Stat::MopWrite } else { Stat::MopRead },
        );
        stats::inc(
            &mut thr.stats,
            match size {
                1 => Stat::Mop1,
                2 => Stat::Mop2,
                4 => Stat::Mop4,
                _ => Stat::Mop8,
            },
        );
        if !self.global.shadow.is_app_mem(addr) {
            debug_assert!(false, "access outside application memory: {addr:#x}");
            return;
        }
        diag!(
            Verbosity::Access,
            "#{}: access pc={pc:#x} addr={addr:#x} size={size} write={is_write}",
            thr.tid
        );
        thr.epoch += 1;
        stats::inc(&mut thr.stats, Stat::Events);
        thr.trace.add_event(thr.epoch, EventKind::Mop, pc);

        let addr0 = addr & 7;
        let addr1 = (addr0 + size - 1).min(7);
        let s0 = ShadowSlot::new(thr.tid, thr.epoch, addr0, addr1, is_write);
        // Start the scan where a naturally aligned access from a single
        // thread will keep finding its own slot, so the common case stops at
        // the first probe.
        let off = match size {
            1 => addr & 7,
            2 => addr & 6,
            4 => addr & 4,
            _ => 0,
        };
        let cell = self.global.shadow.cell(addr);
        let racy = shadow::scan_cell(
            cell,
            &thr.clock,
            &mut thr.stats,
            s0,
            thr.fast_synch_epoch,
            is_write,
            off,
        );
        if let Some(racy) = racy {
            report::report_race(&self.global, &mut thr.stats, addr, s0, racy);
        }
    }

    /// Record an access of arbitrary size and alignment by splitting it into
    /// aligned 1/2/4/8-byte pieces.
    pub fn memory_access_range(
        &self,
        thr: &mut ThreadState,
        pc: usize,
        mut addr: usize,
        mut size: usize,
        is_write: bool,
    ) {
        while size > 0 {
            let chunk = if addr & 1 != 0 || size < 2 {
                1
            } else if addr & 2 != 0 || size < 4 {
                2
            } else if addr & 4 != 0 || size < 8 {
                4
            } else {
                8
            };
            self.memory_access(thr, pc, addr, chunk, is_write);
            addr += chunk;
            size -= chunk;
        }
    }

    // Function boundaries -------------------------------------------------

    pub fn func_entry(&self, thr: &mut ThreadState, pc: usize) {
        stats::inc(&mut thr.stats, Stat::FuncEnter);
        stats::inc(&mut thr.stats, Stat::Events);
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::FuncEnter, pc);
    }

    pub fn func_exit(&self, thr: &mut ThreadState) {
        stats::inc(&mut thr.stats, Stat::FuncExit);
        stats::inc(&mut thr.stats, Stat::Events);
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::FuncExit, 0);
    }

    // Synchronization -----------------------------------------------------

    /// Register an explicitly created mutex at `addr`.
    pub fn mutex_create(
        &self,
        thr: &mut ThreadState,
        pc: usize,
        addr: usize,
        rw: bool,
        recursive: bool,
    ) {
        stats::inc(&mut thr.stats, Stat::SyncCreated);
        diag!(
            Verbosity::Lifecycle,
            "#{}: mutex create {addr:#x} rw={rw} recursive={recursive}",
            thr.tid
        );
        self.global
            .synctab
            .insert(SyncVar::new(addr, SyncKind::Mutex { rw, recursive }));
        // Creation writes the mutex memory; races between creation and use
        // are real races.
        if self.global.shadow.is_app_mem(addr) {
            self.memory_access(thr, pc, addr, 1, true);
        }
    }

    /// Remove the mutex at `addr`, returning its clock storage to the caller.
    pub fn mutex_destroy(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncDestroyed);
        diag!(Verbosity::Lifecycle, "#{}: mutex destroy {addr:#x}", thr.tid);
        let Some(s) = self.global.synctab.remove(addr) else {
            diag!(
                Verbosity::Warning,
                "#{}: destroy of unknown mutex {addr:#x}",
                thr.tid
            );
            return;
        };
        if self.global.shadow.is_app_mem(addr) {
            self.memory_access(thr, pc, addr, 1, true);
        }
        let mut state = s.state.lock();
        state.clock.free(&mut thr.clock_cache);
        state.read_clock.free(&mut thr.clock_cache);
    }

    /// Write-lock the mutex at `addr`. Locking an address the table has
    /// never seen creates a mutex there (statically initialized primitives).
    pub fn mutex_lock(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncAcquire);
        stats::inc(&mut thr.stats, Stat::Events);
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::Lock, addr);
        let s = self.global.synctab.get_or_create(
            addr,
            SyncKind::Mutex {
                rw: true,
                recursive: false,
            },
        );
        if self.global.shadow.is_app_mem(addr) {
            self.memory_access(thr, pc, addr, 1, false);
        }
        let mut state = s.state.lock();
        if state.holder == Some(thr.tid)
            && !matches!(s.kind, SyncKind::Mutex { recursive: true, .. })
        {
            diag!(
                Verbosity::Warning,
                "#{}: recursive lock of non-recursive mutex {addr:#x}",
                thr.tid
            );
        }
        thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
        thr.clock.acquire(&state.clock, &mut thr.clock_cache);
        // A writer must also see every previous reader's critical section.
        thr.clock.acquire(&state.read_clock, &mut thr.clock_cache);
        state.holder = Some(thr.tid);
        state.recursion += 1;
    }

    /// Write-unlock the mutex at `addr`, releasing this thread's clock into
    /// it.
    pub fn mutex_unlock(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncRelease);
        stats::inc(&mut thr.stats, Stat::Events);
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::Unlock, addr);
        let Some(s) = self.global.synctab.get(addr) else {
            diag!(
                Verbosity::Warning,
                "#{}: unlock of unknown mutex {addr:#x}",
                thr.tid
            );
            return;
        };
        if self.global.shadow.is_app_mem(addr) {
            self.memory_access(thr, pc, addr, 1, false);
        }
        let mut state = s.state.lock();
        if state.holder != Some(thr.tid) {
            diag!(
                Verbosity::Warning,
                "#{}: unlock of mutex {addr:#x} not write-held by this thread",
                thr.tid
            );
            return;
        }
        state.recursion -= 1;
        if state.recursion > 0 {
            return;
        }
        state.holder = None;
        thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
        thr.fast_synch_epoch = thr.epoch;
        thr.clock
            .release_into(&mut state.clock, &mut thr.clock_cache);
    }

    /// Read-lock the mutex at `addr`. Readers acquire prior writers but not
    /// each other.
    pub fn mutex_read_lock(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncAcquire);
        stats::inc(&mut thr.stats, Stat::Events);
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::RLock, addr);
        let s = self.global.synctab.get_or_create(
            addr,
            SyncKind::Mutex {
                rw: true,
                recursive: false,
            },
        );
        if !matches!(s.kind, SyncKind::Mutex { rw: true, .. }) {
            diag!(
                Verbosity::Warning,
                "#{}: read lock of non-rw mutex {addr:#x}",
                thr.tid
            );
        }
        if self.global.shadow.is_app_mem(addr) {
            self.memory_access(thr, pc, addr, 1, false);
        }
        let state = s.state.lock();
        thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
        thr.clock.acquire(&state.clock, &mut thr.clock_cache);
    }

    /// Read-unlock the mutex at `addr`, releasing into its read clock.
    pub fn mutex_read_unlock(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncRelease);
        stats::inc(&mut thr.stats, Stat::Events);
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::RUnlock, addr);
        let Some(s) = self.global.synctab.get(addr) else {
            diag!(
                Verbosity::Warning,
                "#{}: read unlock of unknown mutex {addr:#x}",
                thr.tid
            );
            return;
        };
        if self.global.shadow.is_app_mem(addr) {
            self.memory_access(thr, pc, addr, 1, false);
        }
        let mut state = s.state.lock();
        thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
        thr.fast_synch_epoch = thr.epoch;
        thr.clock
            .release_into(&mut state.read_clock, &mut thr.clock_cache);
    }

    /// Unlock a mutex whose acquisition mode the interceptor cannot see
    /// (e.g. `pthread_rwlock_unlock`): if this thread is the recorded write
    /// holder it is a write unlock, otherwise a read unlock.
    pub fn mutex_read_or_write_unlock(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        let Some(s) = self.global.synctab.get(addr) else {
            diag!(
                Verbosity::Warning,
                "#{}: unlock of unknown mutex {addr:#x}",
                thr.tid
            );
            return;
        };
        let write_held = s.state.lock().holder == Some(thr.tid);
        if write_held {
            self.mutex_unlock(thr, pc, addr);
        } else {
            self.mutex_read_unlock(thr, pc, addr);
        }
    }

    /// Raw happens-before annotation: acquire whatever has been released at
    /// `addr`.
    pub fn acquire(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncAcquire);
        stats::inc(&mut thr.stats, Stat::Events);
        diag!(
            Verbosity::Lifecycle,
            "#{}: acquire {addr:#x} pc={pc:#x}",
            thr.tid
        );
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::Lock, addr);
        let s = self.global.synctab.get_or_create(addr, SyncKind::Annotation);
        let state = s.state.lock();
        thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
        thr.clock.acquire(&state.clock, &mut thr.clock_cache);
    }

    /// Raw happens-before annotation: release this thread's clock at `addr`.
    pub fn release(&self, thr: &mut ThreadState, pc: usize, addr: usize) {
        stats::inc(&mut thr.stats, Stat::SyncRelease);
        stats::inc(&mut thr.stats, Stat::Events);
        diag!(
            Verbosity::Lifecycle,
            "#{}: release {addr:#x} pc={pc:#x}",
            thr.tid
        );
        thr.epoch += 1;
        thr.trace.add_event(thr.epoch, EventKind::Unlock, addr);
        let s = self.global.synctab.get_or_create(addr, SyncKind::Annotation);
        let mut state = s.state.lock();
        thr.clock.set(thr.tid, thr.epoch, &mut thr.clock_cache);
        thr.fast_synch_epoch = thr.epoch;
        thr.clock
            .release_into(&mut state.clock, &mut thr.clock_cache);
    }
}

#[cfg(test)]
mod tests {
    use super::{Detector, DetectorOptions};
    use crate::shadow::FixedShadow;

    const BASE: usize = 0x10000;

    fn detector() -> (Detector, super::ThreadState) {
        let shadow = FixedShadow::new(BASE, 0x1000).unwrap();
        Detector::initialize(DetectorOptions::new(shadow))
    }

    #[test]
    fn thread_zero_starts_at_epoch_one() {
        let (_det, thr0) = detector();
        assert_eq!(thr0.tid(), 0);
        assert_eq!(thr0.epoch(), 1);
        assert_eq!(thr0.observed(0), 1);
    }

    #[test]
    fn every_access_advances_the_epoch() {
        let (det, mut thr0) = detector();
        let before = thr0.epoch();
        det.memory_access(&mut thr0, 0x400000, BASE, 8, true);
        det.memory_access(&mut thr0, 0x400004, BASE + 8, 4, false);
        assert_eq!(thr0.epoch(), before + 2);
    }

    #[test]
    fn range_access_splits_on_alignment() {
        let (det, mut thr0) = detector();
        let before = thr0.epoch();
        // 11 bytes from a word boundary: 8 + 2 + 1.
        det.memory_access_range(&mut thr0, 0x400000, BASE, 11, true);
        assert_eq!(thr0.epoch(), before + 3);
        let before = thr0.epoch();
        // 7 bytes starting at an odd address: 1 + 2 + 4.
        det.memory_access_range(&mut thr0, 0x400000, BASE + 17, 7, false);
        assert_eq!(thr0.epoch(), before + 3);
    }

    #[test]
    fn join_of_unknown_uid_warns_and_returns() {
        let (det, mut thr0) = detector();
        det.thread_join(&mut thr0, 0xdeadbeef);
        det.thread_detach(&mut thr0, 0xdeadbeef);
        // Still operational.
        det.memory_access(&mut thr0, 0x400000, BASE, 8, true);
    }

    #[test]
    fn unlock_of_unknown_mutex_warns_and_returns() {
        let (det, mut thr0) = detector();
        det.mutex_unlock(&mut thr0, 0x400000, BASE + 0x500);
        det.mutex_destroy(&mut thr0, 0x400000, BASE + 0x500);
        assert_eq!(det.race_count(), 0);
    }

    #[test]
    fn joined_thread_slot_is_retained_not_recycled() {
        let (det, mut thr0) = detector();
        let tid = det.thread_create(&mut thr0, 100, false);
        let mut thr1 = det.thread_start(tid);
        det.memory_access(&mut thr1, 0x400000, BASE + 0x10, 8, true);
        det.thread_finish(thr1);
        det.thread_join(&mut thr0, 100);
        // The joined slot stays on the dead list, so the next create must
        // get a fresh tid, starting its own epoch sequence at 1.
        let tid2 = det.thread_create(&mut thr0, 101, false);
        assert_ne!(tid2, tid);
        let thr2 = det.thread_start(tid2);
        assert_eq!(thr2.epoch(), 1);
        det.thread_finish(thr2);
    }

    #[test]
    fn finalize_reports_zero_without_races() {
        let (det, mut thr0) = detector();
        det.memory_access(&mut thr0, 0x400000, BASE, 4, true);
        assert_eq!(det.finalize(thr0), 0);
    }
}
