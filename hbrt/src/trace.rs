//! Per-thread event traces.
//!
//! Every epoch-stamped operation appends one packed event to its thread's
//! ring. The ring is divided into [TRACE_PARTS] partitions, each with a
//! header recording the epoch at which the partition was (re)entered;
//! rotation overwrites a partition wholesale, so a header that no longer
//! matches an epoch's partition base means the events for that epoch are
//! gone.
//!
//! The owning thread is the ring's only writer and appends with relaxed
//! stores, no lock. Rotation and cross-thread replay (stack reconstruction
//! for a race report) serialize on the trace mutex; replay tolerates the
//! truncated prefix a concurrent writer can produce, because the slots it
//! reads are each a single machine word.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use strum::FromRepr;
use thiserror::Error;

use crate::clock::Epoch;
use crate::threads::Tid;

/// Events per thread ring.
pub const TRACE_SIZE: usize = 16384;
/// Partitions per ring; rotation granularity.
pub const TRACE_PARTS: usize = 8;
pub(crate) const TRACE_PART_SIZE: usize = TRACE_SIZE / TRACE_PARTS;
/// Deepest call stack reconstruction will report.
pub const STACK_MAX: usize = 64;

/// Low 61 bits of an event hold the pc; the top 3 hold the [EventKind].
const PC_MASK: u64 = (1 << 61) - 1;

#[repr(u64)]
#[derive(Copy, Clone, Debug, Eq, FromRepr, PartialEq)]
pub(crate) enum EventKind {
    /// A memory access; pc of the access.
    Mop,
    /// Function entry; pc of the callee.
    FuncEnter,
    /// Function exit; pc unused.
    FuncExit,
    /// Write-lock of a sync object; carries the object address.
    Lock,
    Unlock,
    /// Read-lock of a sync object.
    RLock,
    RUnlock,
}

#[inline]
pub(crate) fn pack_event(kind: EventKind, pc: usize) -> u64 {
    ((kind as u64) << 61) | (pc as u64 & PC_MASK)
}

#[inline]
pub(crate) fn unpack_event(ev: u64) -> (Option<EventKind>, usize) {
    (EventKind::from_repr(ev >> 61), (ev & PC_MASK) as usize)
}

/// Why a stack could not be reconstructed. Reports carry on with an empty
/// stack in every case.
#[derive(Debug, Error)]
pub(crate) enum TraceError {
    /// The partition holding the epoch has been overwritten since.
    #[error("trace partition overwritten")]
    PartitionRotated,
    /// The epoch predates the current lifetime of the tid (the slot was
    /// recycled and the event belongs to a previous thread).
    #[error("event predates thread start")]
    StaleEpoch,
    /// No live or retained context exists for the tid.
    #[error("no trace for thread {0}")]
    NoContext(Tid),
}

struct TraceHeader {
    /// Epoch at which this partition was last entered. Written under the
    /// trace mutex; the atomic lets the owner's rotation race benignly with
    /// a replayer that will re-check under the lock.
    epoch0: AtomicU64,
}

pub(crate) struct Trace {
    mtx: Mutex<()>,
    headers: [TraceHeader; TRACE_PARTS],
    events: Box<[AtomicU64]>,
}

impl Trace {
    /// A fresh ring for a thread whose first epoch will be
    /// `start_epoch + 1`. The partition containing the start epoch is
    /// pre-stamped so that reconstruction works before the first rotation.
    pub(crate) fn new(start_epoch: Epoch) -> Self {
        let events = (0..TRACE_SIZE)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let headers: [TraceHeader; TRACE_PARTS] = std::array::from_fn(|_| TraceHeader {
            epoch0: AtomicU64::new(0),
        });
        let part = Self::part_of(start_epoch);
        headers[part]
            .epoch0
            .store(Self::part_base(start_epoch), Ordering::Relaxed);
        Self {
            mtx: Mutex::new(()),
            headers,
            events,
        }
    }

    #[inline]
    fn part_of(epoch: Epoch) -> usize {
        (epoch / TRACE_PART_SIZE as u64) as usize % TRACE_PARTS
    }

    #[inline]
    fn part_base(epoch: Epoch) -> Epoch {
        epoch - epoch % TRACE_PART_SIZE as u64
    }

    /// Append the event stamped `epoch`. Owner thread only.
    #[inline]
    pub(crate) fn add_event(&self, epoch: Epoch, kind: EventKind, pc: usize) {
        if epoch % TRACE_PART_SIZE as u64 == 0 {
            self.rotate(epoch);
        }
        self.events[(epoch % TRACE_SIZE as u64) as usize]
            .store(pack_event(kind, pc), Ordering::Relaxed);
    }

    #[cold]
    fn rotate(&self, epoch: Epoch) {
        let _lock = self.mtx.lock();
        self.headers[Self::part_of(epoch)]
            .epoch0
            .store(epoch, Ordering::Relaxed);
    }

    /// Rebuild the call stack in effect at `epoch`, innermost frame last.
    ///
    /// Replays the enclosing partition from its start: `FuncEnter` pushes,
    /// `FuncExit` pops, and a `Mop` marks the pc of the access itself on top
    /// of the current frames. Frames beyond [STACK_MAX] are dropped.
    pub(crate) fn restore_stack(&self, epoch: Epoch) -> Result<Vec<usize>, TraceError> {
        let _lock = self.mtx.lock();
        let part = Self::part_of(epoch);
        if self.headers[part].epoch0.load(Ordering::Relaxed) != Self::part_base(epoch) {
            return Err(TraceError::PartitionRotated);
        }
        let base = part * TRACE_PART_SIZE;
        let rel = (epoch % TRACE_PART_SIZE as u64) as usize;
        let mut frames = [0usize; STACK_MAX];
        let mut depth = 0usize;
        let mut top = None;
        for slot in &self.events[base..=base + rel] {
            let ev = slot.load(Ordering::Relaxed);
            if ev == 0 {
                // Never written (the partition was entered mid-way).
                continue;
            }
            match unpack_event(ev) {
                (Some(EventKind::Mop), pc) => top = Some(pc),
                (Some(EventKind::FuncEnter), pc) => {
                    if depth < STACK_MAX {
                        frames[depth] = pc;
                    }
                    depth += 1;
                    top = None;
                }
                (Some(EventKind::FuncExit), _) => {
                    depth = depth.saturating_sub(1);
                    top = None;
                }
                // Sync events carry no frame information.
                _ => (),
            }
        }
        let mut stack = frames[..depth.min(STACK_MAX)].to_vec();
        if let Some(pc) = top {
            if stack.len() < STACK_MAX {
                stack.push(pc);
            }
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        pack_event, unpack_event, EventKind, Trace, TraceError, STACK_MAX, TRACE_PART_SIZE,
        TRACE_SIZE,
    };

    #[test]
    fn event_round_trip() {
        for (kind, pc) in [
            (EventKind::Mop, 0xdead_beef),
            (EventKind::FuncEnter, 0x7fff_ffff_f000),
            (EventKind::FuncExit, 0),
            (EventKind::RUnlock, 0x1234),
        ] {
            let (k, p) = unpack_event(pack_event(kind, pc));
            assert_eq!(k, Some(kind));
            assert_eq!(p, pc);
        }
    }

    #[test]
    fn restores_enter_chain() {
        let t = Trace::new(0);
        t.add_event(1, EventKind::FuncEnter, 0x100);
        t.add_event(2, EventKind::FuncEnter, 0x200);
        t.add_event(3, EventKind::Mop, 0x300);
        assert_eq!(t.restore_stack(3).unwrap(), vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn func_exit_pops() {
        let t = Trace::new(0);
        t.add_event(1, EventKind::FuncEnter, 0x100);
        t.add_event(2, EventKind::FuncEnter, 0x200);
        t.add_event(3, EventKind::FuncExit, 0);
        t.add_event(4, EventKind::Mop, 0x900);
        assert_eq!(t.restore_stack(4).unwrap(), vec![0x100, 0x900]);
    }

    #[test]
    fn mop_marks_only_the_queried_epoch() {
        let t = Trace::new(0);
        t.add_event(1, EventKind::FuncEnter, 0x100);
        t.add_event(2, EventKind::Mop, 0x111);
        t.add_event(3, EventKind::Mop, 0x222);
        // Restoring at epoch 2 must not see the later access.
        assert_eq!(t.restore_stack(2).unwrap(), vec![0x100, 0x111]);
    }

    #[test]
    fn sync_events_are_transparent() {
        let t = Trace::new(0);
        t.add_event(1, EventKind::FuncEnter, 0x100);
        t.add_event(2, EventKind::Lock, 0x5000);
        t.add_event(3, EventKind::Unlock, 0x5000);
        t.add_event(4, EventKind::Mop, 0x300);
        assert_eq!(t.restore_stack(4).unwrap(), vec![0x100, 0x300]);
    }

    #[test]
    fn replay_starts_at_partition_boundary() {
        let t = Trace::new(0);
        let base = TRACE_PART_SIZE as u64;
        t.add_event(base, EventKind::FuncEnter, 0x100);
        t.add_event(base + 1, EventKind::Mop, 0x200);
        assert_eq!(t.restore_stack(base + 1).unwrap(), vec![0x100, 0x200]);
    }

    #[test]
    fn rotation_loses_the_old_partition() {
        let t = Trace::new(0);
        t.add_event(1, EventKind::Mop, 0x100);
        assert!(t.restore_stack(1).is_ok());
        // One full lap of the ring re-enters partition 0.
        t.add_event(TRACE_SIZE as u64, EventKind::Mop, 0x200);
        assert!(matches!(
            t.restore_stack(1),
            Err(TraceError::PartitionRotated)
        ));
        assert_eq!(t.restore_stack(TRACE_SIZE as u64).unwrap(), vec![0x200]);
    }

    #[test]
    fn depth_is_capped() {
        let t = Trace::new(0);
        for i in 0..(STACK_MAX as u64 + 10) {
            t.add_event(i + 1, EventKind::FuncEnter, 0x1000 + i as usize);
        }
        let stack = t.restore_stack(STACK_MAX as u64 + 10).unwrap();
        assert_eq!(stack.len(), STACK_MAX);
        assert_eq!(stack[0], 0x1000);
    }

    #[test]
    fn mid_partition_start_skips_unwritten_slots() {
        // A thread whose first epoch is not at a partition boundary.
        let t = Trace::new(100);
        t.add_event(101, EventKind::FuncEnter, 0x100);
        t.add_event(102, EventKind::Mop, 0x200);
        assert_eq!(t.restore_stack(102).unwrap(), vec![0x100, 0x200]);
    }
}
