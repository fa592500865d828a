//! A dynamic happens-before data-race detector for multithreaded native
//! programs.
//!
//! The instrumentation (outside this crate) reports every memory access,
//! function boundary, synchronization operation and thread lifecycle event to
//! a [Detector]. The detector decides, in constant amortized time per access,
//! whether the access is ordered (happens-before) with respect to earlier
//! accesses from other threads, and emits a [RaceReport] when it is not.
//!
//! Per-thread state is threaded through every call as a [ThreadState]; the
//! per-access path touches only that state plus the word's shadow cell, with
//! relaxed single-word atomics and no locks.

mod clock;
mod log;
mod report;
mod rt;
mod shadow;
mod slab;
mod stats;
mod sync;
mod threads;
mod trace;

pub use report::{
    AccessReport, DladdrSymbolizer, Frame, NoSuppression, RaceReport, ReportKind, ReportSink,
    StderrSink, Suppressor, Symbolizer,
};
pub use rt::{Detector, DetectorOptions, ThreadState};
pub use shadow::{FixedShadow, ShadowCell, ShadowError, ShadowMemory, ShadowSlot};
pub use threads::Tid;
pub use trace::{STACK_MAX, TRACE_PARTS, TRACE_SIZE};
