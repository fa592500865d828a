//! Shadow memory: what the detector remembers about recent accesses to each
//! 8-byte application word, and the per-access scan that turns a new access
//! plus that memory into "recorded", "redundant" or "race".
//!
//! Each application word owns a cell of [SHADOW_CNT] slots. A slot is a
//! single `u64` so it can be read and written with one relaxed atomic
//! operation; torn state is impossible and no ordering is implied or needed.
//! The packing is explicit (no bitfields):
//!
//!   bit(s) | 63     | 62    | 61..59 | 58..56 | 55..16 | 15..0
//!          | unused | write | addr1  | addr0  | epoch  | tid
//!
//! `addr0..=addr1` is the byte range touched within the word. A raw value of
//! 0 means the slot is empty, which cannot collide with a real record
//! because every recorded access has `epoch >= 1`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;
use thiserror::Error;

use crate::clock::{Epoch, VectorClock};
use crate::stats::{self, Stat, StatCounts};
use crate::threads::Tid;

pub(crate) const TID_BITS: u32 = 16;
pub(crate) const CLK_BITS: u32 = 40;
/// Shadow slots per 8-byte application word.
pub(crate) const SHADOW_CNT: usize = 8;

const TID_MASK: u64 = (1 << TID_BITS) - 1;
const CLK_MASK: u64 = (1 << CLK_BITS) - 1;
const EPOCH_SHIFT: u32 = TID_BITS;
const ADDR0_SHIFT: u32 = TID_BITS + CLK_BITS;
const ADDR1_SHIFT: u32 = ADDR0_SHIFT + 3;
const WRITE_SHIFT: u32 = ADDR1_SHIFT + 3;

/// One recorded access, packed into a shadow word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ShadowSlot(u64);

impl ShadowSlot {
    pub(crate) fn new(
        tid: Tid,
        epoch: Epoch,
        addr0: usize,
        addr1: usize,
        is_write: bool,
    ) -> Self {
        debug_assert!((tid as u64) <= TID_MASK);
        debug_assert!(epoch <= CLK_MASK);
        debug_assert!(addr0 <= addr1 && addr1 < 8);
        ShadowSlot(
            (tid as u64)
                | (epoch << EPOCH_SHIFT)
                | ((addr0 as u64) << ADDR0_SHIFT)
                | ((addr1 as u64) << ADDR1_SHIFT)
                | ((is_write as u64) << WRITE_SHIFT),
        )
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        ShadowSlot(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn tid(self) -> Tid {
        (self.0 & TID_MASK) as Tid
    }

    pub fn epoch(self) -> Epoch {
        (self.0 >> EPOCH_SHIFT) & CLK_MASK
    }

    /// First byte offset touched within the word.
    pub fn addr0(self) -> usize {
        ((self.0 >> ADDR0_SHIFT) & 7) as usize
    }

    /// Last byte offset touched within the word (inclusive).
    pub fn addr1(self) -> usize {
        ((self.0 >> ADDR1_SHIFT) & 7) as usize
    }

    pub fn size(self) -> usize {
        self.addr1() - self.addr0() + 1
    }

    pub fn is_write(self) -> bool {
        (self.0 >> WRITE_SHIFT) & 1 != 0
    }

    fn same_range(self, other: ShadowSlot) -> bool {
        const RANGE: u64 = (0b111111) << ADDR0_SHIFT;
        (self.0 ^ other.0) & RANGE == 0
    }

    fn overlaps(self, other: ShadowSlot) -> bool {
        self.addr1().min(other.addr1()) >= self.addr0().max(other.addr0())
    }
}

/// The shadow state of one 8-byte application word.
#[repr(C)]
pub struct ShadowCell {
    slots: [AtomicU64; SHADOW_CNT],
}

impl ShadowCell {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Relaxed snapshot of the cell, one slot at a time; slots may move under
    /// a concurrent mutator.
    pub fn snapshot(&self) -> [ShadowSlot; SHADOW_CNT] {
        std::array::from_fn(|i| ShadowSlot(self.slots[i].load(Ordering::Relaxed)))
    }

    /// How many slots currently hold a record.
    pub fn occupied(&self) -> usize {
        self.snapshot().iter().filter(|s| !s.is_empty()).count()
    }
}

impl Default for ShadowCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide what one existing slot means for the current access. Returns `true`
/// if the slot already summarizes the access (scan is done, nothing stored).
///
/// At most one slot is mutated across a whole scan: the first store sets
/// `replaced`, and any later slot that would also be replaced is zeroed
/// instead.
#[inline]
fn check_slot(
    clock: &VectorClock,
    stats: &mut StatCounts,
    s0: ShadowSlot,
    synch_epoch: Epoch,
    is_write: bool,
    sp: &AtomicU64,
    replaced: &mut bool,
    racy: &mut Option<ShadowSlot>,
) -> bool {
    let s = ShadowSlot(sp.load(Ordering::Relaxed));
    if s.is_empty() {
        stats::inc(stats, Stat::ShadowZero);
        if !*replaced {
            sp.store(s0.raw(), Ordering::Relaxed);
            *replaced = true;
        }
        return false;
    }
    if s.same_range(s0) {
        stats::inc(stats, Stat::ShadowSameSize);
        if s.tid() == s0.tid() {
            stats::inc(stats, Stat::ShadowSameThread);
            if s.epoch() >= synch_epoch {
                // Same synch epoch: no release has happened since the
                // recorded access, so anything unordered with it is equally
                // unordered with us.
                if s.is_write() || !is_write {
                    return true;
                }
                // Read -> write upgrade.
                sp.store(if *replaced { 0 } else { s0.raw() }, Ordering::Relaxed);
                *replaced = true;
                return false;
            }
            // Recorded before our last release: prefer the fresher epoch
            // unless that would downgrade a write to a read.
            if !s.is_write() || is_write {
                sp.store(if *replaced { 0 } else { s0.raw() }, Ordering::Relaxed);
                *replaced = true;
            }
            return false;
        }
        stats::inc(stats, Stat::ShadowAnotherThread);
        if clock.get(s.tid()) >= s.epoch() {
            // Happens-before us: safe to supersede.
            sp.store(if *replaced { 0 } else { s0.raw() }, Ordering::Relaxed);
            *replaced = true;
            return false;
        }
        if !s.is_write() && !is_write {
            return false;
        }
        *racy = Some(s);
        return false;
    }
    if s.overlaps(s0) {
        stats::inc(stats, Stat::ShadowIntersect);
        if s.tid() == s0.tid() {
            return false;
        }
        if clock.get(s.tid()) >= s.epoch() {
            return false;
        }
        if !s.is_write() && !is_write {
            return false;
        }
        *racy = Some(s);
        return false;
    }
    stats::inc(stats, Stat::ShadowNotIntersect);
    false
}

/// Run the current access `s0` against a cell: record it, detect redundancy,
/// and return a conflicting slot if one was found.
///
/// `off` is the scan's starting slot, chosen by the caller so that naturally
/// aligned accesses from one thread keep hitting their own slot first. If no
/// slot absorbed `s0`, a pseudo-random victim (`epoch % SHADOW_CNT`) is
/// overwritten so the newest access is always remembered.
pub(crate) fn scan_cell(
    cell: &ShadowCell,
    clock: &VectorClock,
    stats: &mut StatCounts,
    s0: ShadowSlot,
    synch_epoch: Epoch,
    is_write: bool,
    off: usize,
) -> Option<ShadowSlot> {
    let mut replaced = false;
    let mut racy = None;
    for i in 0..SHADOW_CNT {
        let sp = &cell.slots[(i + off) % SHADOW_CNT];
        stats::inc(stats, Stat::ShadowProcessed);
        if check_slot(
            clock,
            stats,
            s0,
            synch_epoch,
            is_write,
            sp,
            &mut replaced,
            &mut racy,
        ) {
            // A slot already holds effectively this access; a conflict found
            // earlier in the scan was against superseded state, so drop it.
            return None;
        }
    }
    if !replaced {
        stats::inc(stats, Stat::ShadowReplace);
        cell.slots[(s0.epoch() % SHADOW_CNT as u64) as usize].store(s0.raw(), Ordering::Relaxed);
    }
    racy
}

/// Where the shadow cells for application memory live. The projection is
/// supplied by the embedder; the engine only requires that every application
/// address it is asked about has a stable cell.
pub trait ShadowMemory: Send + Sync {
    fn is_app_mem(&self, addr: usize) -> bool;

    /// The cell of the 8-byte word containing `addr`. May panic if
    /// `is_app_mem(addr)` does not hold.
    fn cell(&self, addr: usize) -> &ShadowCell;
}

impl<S: ShadowMemory + ?Sized> ShadowMemory for Arc<S> {
    fn is_app_mem(&self, addr: usize) -> bool {
        (**self).is_app_mem(addr)
    }

    fn cell(&self, addr: usize) -> &ShadowCell {
        (**self).cell(addr)
    }
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("cannot map shadow region: {0}")]
    Map(#[from] std::io::Error),
    #[error("empty application range")]
    EmptyRange,
}

/// Shadow projection for one contiguous application range, backed by an
/// anonymous memory map (zero-filled by the kernel, one cell per word).
pub struct FixedShadow {
    base: usize,
    ncells: usize,
    map: MmapMut,
}

impl FixedShadow {
    /// Cover the application range `[base, base + len)`, rounded out to
    /// 8-byte word boundaries.
    pub fn new(base: usize, len: usize) -> Result<Self, ShadowError> {
        if len == 0 {
            return Err(ShadowError::EmptyRange);
        }
        let word_base = base & !7;
        let ncells = (base + len - word_base + 7) / 8;
        let map = MmapMut::map_anon(ncells * std::mem::size_of::<ShadowCell>())?;
        Ok(Self {
            base: word_base,
            ncells,
            map,
        })
    }
}

impl ShadowMemory for FixedShadow {
    fn is_app_mem(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.ncells * 8
    }

    fn cell(&self, addr: usize) -> &ShadowCell {
        assert!(self.is_app_mem(addr));
        let idx = (addr - self.base) >> 3;
        // SAFETY: the map is anonymous (zero-filled), page-aligned, sized for
        // `ncells` cells and never remapped while `self` lives. `ShadowCell`
        // is a `#[repr(C)]` array of `AtomicU64`, for which the all-zeroes
        // byte pattern is valid, and we only ever produce shared references
        // into it.
        unsafe { &*(self.map.as_ptr() as *const ShadowCell).add(idx) }
    }
}
