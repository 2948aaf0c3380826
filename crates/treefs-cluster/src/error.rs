//! Error types for the cluster subsystem.

use thiserror::Error;
use treefs_chain::{ChainError, Key};

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in the cluster subsystem.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A per-replica chain operation failed.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// The cluster has no focus chain to answer the request.
    #[error("cluster has no focus")]
    NoFocus,

    /// More replica slots were supplied than a cluster can hold.
    #[error("too many chains: {count} exceeds {max}")]
    TooManyChains {
        /// Number of slots supplied.
        count: usize,
        /// Cluster capacity.
        max: usize,
    },

    /// Parent and child clusters have a different number of slots.
    #[error("slot count mismatch: parent has {parent}, child has {child}")]
    SlotCountMismatch {
        /// Parent slot count.
        parent: usize,
        /// Child slot count.
        child: usize,
    },

    /// A name is empty or too long.
    #[error("invalid name: {reason}")]
    InvalidName {
        /// Description of the problem.
        reason: String,
    },

    /// Every collision key for a directory hash is taken.
    #[error("no free key in hash bucket {key:#x}")]
    KeySpaceExhausted {
        /// First key of the exhausted bucket.
        key: Key,
    },

    /// An asynchronous load completed with an error.
    #[error("load failed: {reason}")]
    LoadFailed {
        /// The underlying failure.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Configuration could not be parsed.
    #[error("configuration parse error")]
    ConfigParse(#[from] serde_json::Error),

    /// The synchronization thread is not running.
    #[error("sync thread {name} not running")]
    SyncThrNotRunning {
        /// Sync thread name.
        name: String,
    },

    /// The synchronization thread was already started.
    #[error("sync thread {name} already running")]
    SyncThrAlreadyRunning {
        /// Sync thread name.
        name: String,
    },

    /// The synchronization thread exited before acknowledging a request.
    #[error("sync thread {name} exited")]
    SyncThrGone {
        /// Sync thread name.
        name: String,
    },

    /// No tokio runtime is available to run the synchronization thread.
    #[error("no async runtime available")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_converts() {
        let err: ClusterError = ChainError::KeyExists { key: 0x10 }.into();
        assert!(matches!(err, ClusterError::Chain(ChainError::KeyExists { key: 0x10 })));
        assert_eq!(format!("{}", err), "chain error: Key 0x10 already exists under parent");
    }

    #[test]
    fn test_slot_count_mismatch_display() {
        let err = ClusterError::SlotCountMismatch { parent: 3, child: 2 };
        assert_eq!(format!("{}", err), "slot count mismatch: parent has 3, child has 2");
    }
}
