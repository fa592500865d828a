//! Counters for what the detector spent its time on. Hot-path counters live
//! in a plain per-thread array (one add, no locking) and are folded into the
//! process-wide table when a thread finishes; the table is only ever written
//! out at `finalize`, and only if the end user asked for it via the
//! `HB_LOG_STATS` environment variable (`-` = stderr).

#[cfg(not(test))]
use std::env;
use std::{fmt::Write as _, fs};

use parking_lot::Mutex;
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// One countable runtime event.
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter)]
pub(crate) enum Stat {
    Mop,
    MopRead,
    MopWrite,
    Mop1,
    Mop2,
    Mop4,
    Mop8,
    ShadowProcessed,
    ShadowZero,
    ShadowSameSize,
    ShadowIntersect,
    ShadowNotIntersect,
    ShadowSameThread,
    ShadowAnotherThread,
    ShadowReplace,
    FuncEnter,
    FuncExit,
    Events,
    SyncCreated,
    SyncDestroyed,
    SyncAcquire,
    SyncRelease,
    ThreadsCreated,
    ThreadsFinished,
    Races,
}

/// Per-thread counter array, indexed by [Stat].
pub(crate) type StatCounts = [u64; Stat::COUNT];

pub(crate) fn new_counts() -> StatCounts {
    [0; Stat::COUNT]
}

#[inline]
pub(crate) fn inc(counts: &mut StatCounts, s: Stat) {
    counts[s as usize] += 1;
}

/// The process-wide statistics table.
pub(crate) struct Stats {
    // Most runs won't record statistics, so the quickest possible "is there
    // anything to do?" check matters: the outer `Option` makes it one branch,
    // and only enabled runs pay for the `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be
    /// written to stderr.
    output_path: String,
    counts: StatCounts,
}

impl Stats {
    #[cfg(not(test))]
    pub(crate) fn new() -> Self {
        if let Ok(p) = env::var("HB_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// Fold a finished thread's counters into the table.
    pub(crate) fn merge(&self, counts: &StatCounts) {
        if let Some(mtx) = &self.inner {
            let mut inner = mtx.lock();
            for (total, n) in inner.counts.iter_mut().zip(counts.iter()) {
                *total += n;
            }
        }
    }

    /// Write the table out. Called once, at `finalize`.
    pub(crate) fn dump(&self) {
        if let Some(mtx) = &self.inner {
            mtx.lock().write_out();
        }
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            counts: [0; Stat::COUNT],
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("hbrt statistics:\n");
        for s in Stat::iter() {
            writeln!(out, "  {}: {}", s, self.counts[s as usize]).ok();
        }
        out
    }

    fn write_out(&self) {
        if self.output_path == "-" {
            eprint!("{}", self.render());
        } else {
            fs::write(&self.output_path, self.render()).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{inc, new_counts, Stat, Stats, StatsInner};
    use strum::EnumCount;

    #[test]
    fn merge_accumulates() {
        let stats = Stats::new();
        let mut a = new_counts();
        let mut b = new_counts();
        inc(&mut a, Stat::Mop);
        inc(&mut a, Stat::Mop);
        inc(&mut b, Stat::Mop);
        inc(&mut b, Stat::Races);
        stats.merge(&a);
        stats.merge(&b);
        let inner = stats.inner.as_ref().unwrap().lock();
        assert_eq!(inner.counts[Stat::Mop as usize], 3);
        assert_eq!(inner.counts[Stat::Races as usize], 1);
    }

    #[test]
    fn render_names_every_counter() {
        let mut inner = StatsInner::new("-".to_string());
        inner.counts[Stat::FuncEnter as usize] = 7;
        let out = inner.render();
        assert_eq!(out.lines().count(), 1 + Stat::COUNT);
        assert!(out.contains("FuncEnter: 7"));
    }

    #[test]
    fn dump_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("stats.txt");
        let mut inner = StatsInner::new(p.display().to_string());
        inner.counts[Stat::Events as usize] = 42;
        inner.write_out();
        let buf = std::fs::read_to_string(&p).unwrap();
        assert!(buf.starts_with("hbrt statistics:"));
        assert!(buf.contains("Events: 42"));
    }
}
