//! User-visible synchronization objects and the address-keyed table that owns
//! them.
//!
//! A sync object's table entry is looked up under the table mutex, but its
//! clocks are guarded by the object's own short-critical-section lock, held
//! only across a single acquire/release. Mutex operations on an address the
//! table has never seen create the object on the fly: statically initialized
//! primitives are locked before anything resembling "create" runs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::VectorClock;
use crate::threads::Tid;

/// What kind of synchronization lives at an address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SyncKind {
    Mutex {
        /// Supports read locking.
        rw: bool,
        recursive: bool,
    },
    /// A raw acquire/release annotation point; no holder, no lock protocol.
    Annotation,
}

pub(crate) struct SyncVar {
    pub(crate) addr: usize,
    pub(crate) kind: SyncKind,
    pub(crate) state: Mutex<SyncState>,
}

pub(crate) struct SyncState {
    /// Released into by write-unlocks; acquired by every lock.
    pub(crate) clock: VectorClock,
    /// Released into by read-unlocks; acquired only by write-locks, so
    /// readers do not synchronize with each other.
    pub(crate) read_clock: VectorClock,
    /// Current write holder, if any.
    pub(crate) holder: Option<Tid>,
    /// Write-lock depth for recursive mutexes.
    pub(crate) recursion: u32,
}

impl SyncVar {
    pub(crate) fn new(addr: usize, kind: SyncKind) -> Arc<Self> {
        Arc::new(Self {
            addr,
            kind,
            state: Mutex::new(SyncState {
                clock: VectorClock::new(),
                read_clock: VectorClock::new(),
                holder: None,
                recursion: 0,
            }),
        })
    }
}

pub(crate) struct SyncTab {
    tab: Mutex<HashMap<usize, Arc<SyncVar>>>,
}

impl SyncTab {
    pub(crate) fn new() -> Self {
        Self {
            tab: Mutex::new(HashMap::new()),
        }
    }

    /// Add an explicitly created object. An existing entry at the same
    /// address is replaced (the program recreated a primitive in place).
    pub(crate) fn insert(&self, var: Arc<SyncVar>) -> Option<Arc<SyncVar>> {
        self.tab.lock().insert(var.addr, var)
    }

    pub(crate) fn get(&self, addr: usize) -> Option<Arc<SyncVar>> {
        self.tab.lock().get(&addr).cloned()
    }

    /// Look up `addr`, creating `kind` there if nothing exists yet.
    pub(crate) fn get_or_create(&self, addr: usize, kind: SyncKind) -> Arc<SyncVar> {
        Arc::clone(
            self.tab
                .lock()
                .entry(addr)
                .or_insert_with(|| SyncVar::new(addr, kind)),
        )
    }

    /// Remove and return the object at `addr`, if any. The caller owns
    /// freeing its clocks.
    pub(crate) fn remove(&self, addr: usize) -> Option<Arc<SyncVar>> {
        self.tab.lock().remove(&addr)
    }
}
