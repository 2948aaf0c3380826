//! Transaction contexts threaded through every mutating chain operation.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Monotonic transaction id source for one filesystem instance.
#[derive(Debug)]
pub struct TidAllocator {
    next: AtomicU64,
}

impl TidAllocator {
    /// Creates an allocator whose first id is `start`.
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Allocates the next transaction id.
    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`alloc`](Self::alloc) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for TidAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A modifying transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trans {
    /// Transaction id stamped into modified chains and flushed brefs.
    pub sync_tid: u64,
}

impl Trans {
    /// Starts a transaction with a fresh id from `tids`.
    pub fn begin(tids: &TidAllocator) -> Self {
        let sync_tid = tids.alloc();
        debug!(sync_tid, "transaction begin");
        Self { sync_tid }
    }
}
