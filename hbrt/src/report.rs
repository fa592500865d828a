//! Turning a detected race into something a human can read.
//!
//! Reporting serializes on a global mutex: races are rare and the path is
//! deliberately slow (stack reconstruction, symbolization). The pieces that
//! live outside the core -- symbol lookup, suppression rules, the output
//! channel -- are trait seams with best-effort defaults.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use crate::clock::Epoch;
use crate::rt::Global;
use crate::shadow::ShadowSlot;
use crate::stats::{self, Stat, StatCounts};
use crate::threads::{ThreadStatus, Tid};
use crate::trace::TraceError;

/// One symbolized stack entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub pc: usize,
    /// Function name, if symbolization found one.
    pub func: Option<String>,
    /// Object the pc was loaded from.
    pub obj: Option<PathBuf>,
    /// Offset from the function's entry point.
    pub off: usize,
}

impl Frame {
    pub fn unresolved(pc: usize) -> Self {
        Frame {
            pc,
            func: None,
            obj: None,
            off: 0,
        }
    }
}

/// One side of a race: which thread touched which bytes, how, and where it
/// was in the program at the time (innermost frame first; empty when the
/// trace context was lost).
#[derive(Clone, Debug)]
pub struct AccessReport {
    pub tid: Tid,
    pub addr: usize,
    pub size: usize,
    pub is_write: bool,
    pub stack: Vec<Frame>,
}

/// A pair of unordered conflicting accesses to the same word.
#[derive(Clone, Debug)]
pub struct RaceReport {
    /// The 8-byte-aligned word both accesses fall into.
    pub word: usize,
    /// The access that tripped the detector first, then the recorded one.
    pub accesses: [AccessReport; 2],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReportKind {
    Race,
}

/// Best-effort pc -> symbol resolution.
pub trait Symbolizer: Send + Sync {
    fn symbolize(&self, pc: usize) -> Frame;
}

/// Decides whether a finished report should be dropped instead of printed.
pub trait Suppressor: Send + Sync {
    fn is_suppressed(&self, kind: ReportKind, report: &RaceReport) -> bool;
}

/// Where finished reports go.
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &RaceReport);
}

/// Default symbolizer: whatever the dynamic linker knows about the pc.
pub struct DladdrSymbolizer;

impl Symbolizer for DladdrSymbolizer {
    fn symbolize(&self, pc: usize) -> Frame {
        match hbaddr::sym_for_pc(pc) {
            Some(sym) => Frame {
                pc,
                func: sym.func,
                obj: Some(sym.obj),
                off: sym.off,
            },
            None => Frame::unresolved(pc),
        }
    }
}

/// Default suppressor: nothing is suppressed.
pub struct NoSuppression;

impl Suppressor for NoSuppression {
    fn is_suppressed(&self, _kind: ReportKind, _report: &RaceReport) -> bool {
        false
    }
}

/// Default sink: print to stderr.
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn report(&self, report: &RaceReport) {
        eprint!("{report}");
    }
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "WARNING: data race on word {:#x}", self.word)?;
        for (i, a) in self.accesses.iter().enumerate() {
            let what = if a.is_write { "Write" } else { "Read" };
            let when = if i == 0 { "" } else { "Previous " };
            writeln!(
                f,
                "  {when}{what} of size {} at {:#x} by thread T{}:",
                a.size, a.addr, a.tid
            )?;
            if a.stack.is_empty() {
                writeln!(f, "    <no stack available>")?;
            }
            for (n, frame) in a.stack.iter().enumerate() {
                match (&frame.func, &frame.obj) {
                    (Some(func), _) => {
                        writeln!(f, "    #{n} {:#x} in {func}+{:#x}", frame.pc, frame.off)?
                    }
                    (None, Some(obj)) => {
                        writeln!(f, "    #{n} {:#x} in {}", frame.pc, obj.display())?
                    }
                    (None, None) => writeln!(f, "    #{n} {:#x}", frame.pc)?,
                }
            }
        }
        Ok(())
    }
}

/// Rebuild the call stack of `(tid, epoch)`, innermost last.
///
/// Takes the registry lock to pin the context (live or retained) and then the
/// target's trace lock for the replay.
pub(crate) fn restore_stack(
    global: &Global,
    tid: Tid,
    epoch: Epoch,
) -> Result<Vec<usize>, TraceError> {
    let registry = global.registry.lock();
    let ctx = registry.get(tid).ok_or(TraceError::NoContext(tid))?;
    if epoch < ctx.epoch0 {
        // Stamped by a previous occupant of this tid.
        return Err(TraceError::StaleEpoch);
    }
    let trace = match ctx.status {
        ThreadStatus::Running => ctx.trace.as_ref(),
        ThreadStatus::Finished | ThreadStatus::Dead => ctx.dead_info.as_ref(),
        ThreadStatus::Invalid | ThreadStatus::Created => None,
    }
    .ok_or(TraceError::NoContext(tid))?;
    trace.restore_stack(epoch)
}

/// Serialize, symbolize and emit a race between the current access `s0` and
/// the recorded access `s1`. A lost trace context downgrades a stack to
/// empty; the report is still emitted.
pub(crate) fn report_race(
    global: &Global,
    thr_stats: &mut StatCounts,
    addr: usize,
    s0: ShadowSlot,
    s1: ShadowSlot,
) {
    let _lock = global.report_mtx.lock();
    stats::inc(thr_stats, Stat::Races);
    let word = addr & !7;
    let accesses = [s0, s1].map(|s| {
        let pcs = restore_stack(global, s.tid(), s.epoch()).unwrap_or_default();
        // Replay yields innermost-last; reports read innermost-first.
        let stack = pcs
            .iter()
            .rev()
            .map(|pc| global.symbolizer.symbolize(*pc))
            .collect();
        AccessReport {
            tid: s.tid(),
            addr: word + s.addr0(),
            size: s.size(),
            is_write: s.is_write(),
            stack,
        }
    });
    let report = RaceReport { word, accesses };
    if global.suppressor.is_suppressed(ReportKind::Race, &report) {
        return;
    }
    global.nreported.fetch_add(1, Ordering::Relaxed);
    global.sink.report(&report);
}

#[cfg(test)]
mod tests {
    use super::{AccessReport, Frame, RaceReport};

    fn report() -> RaceReport {
        RaceReport {
            word: 0x1000,
            accesses: [
                AccessReport {
                    tid: 1,
                    addr: 0x1004,
                    size: 4,
                    is_write: false,
                    stack: vec![
                        Frame {
                            pc: 0x400123,
                            func: Some("consume".to_string()),
                            obj: None,
                            off: 0x23,
                        },
                        Frame::unresolved(0x400200),
                    ],
                },
                AccessReport {
                    tid: 0,
                    addr: 0x1004,
                    size: 4,
                    is_write: true,
                    stack: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn display_labels_both_accesses() {
        let out = report().to_string();
        assert!(out.starts_with("WARNING: data race on word 0x1000"));
        assert!(out.contains("Read of size 4 at 0x1004 by thread T1"));
        assert!(out.contains("Previous Write of size 4 at 0x1004 by thread T0"));
    }

    #[test]
    fn display_resolves_frames_and_tolerates_missing_stacks() {
        let out = report().to_string();
        assert!(out.contains("#0 0x400123 in consume+0x23"));
        assert!(out.contains("#1 0x400200"));
        assert!(out.contains("<no stack available>"));
    }
}
