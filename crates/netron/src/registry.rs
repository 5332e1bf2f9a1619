//! Definition id allocation.
//!
//! Ids are handed out by one allocator per runtime. Allocation is a single
//! atomic step, so ids are totally ordered across every peer of the runtime.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Source of process-unique definition ids.
pub trait IdAllocator: Send + Sync + 'static {
    /// Returns an id never returned before by this allocator.
    fn next_id(&self) -> u64;
}

/// Monotonic counter. The first id is 1, leaving 0 to mean "no parent".
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self { next: AtomicU64::new(first) }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator for SequentialIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
