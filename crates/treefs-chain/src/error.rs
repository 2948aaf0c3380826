//! Error types for the chain subsystem.

use thiserror::Error;

use crate::bref::Key;

/// Result type alias for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Error variants for chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A device read failed (media error or injected fault).
    #[error("Read failed on {device} at data_off {data_off:#x}")]
    ReadFailed {
        /// The device name.
        device: String,
        /// The data offset (including radix bits) that failed.
        data_off: u64,
    },

    /// Data read back does not match the check value in its block reference.
    #[error("Check failed for key {key:#x}: expected {expected:#x}, actual {actual:#x}")]
    CheckFailed {
        /// The key of the chain being validated.
        key: Key,
        /// Check value recorded in the block reference.
        expected: u32,
        /// Check value computed over the data read.
        actual: u32,
    },

    /// Nothing has ever been written at the requested offset.
    #[error("Unallocated block on {device} at data_off {data_off:#x}")]
    Unallocated {
        /// The device name.
        device: String,
        /// The data offset that was requested.
        data_off: u64,
    },

    /// The chain has no device to resolve its data from.
    #[error("Chain {chain_id} has no backing device")]
    NoDevice {
        /// The chain identifier.
        chain_id: u64,
    },

    /// No free space left on the device.
    #[error("Out of space on {device}: requested {bytes} bytes")]
    OutOfSpace {
        /// The device name.
        device: String,
        /// The requested allocation size.
        bytes: u64,
    },

    /// The chain's data buffer is not resident.
    #[error("Chain {chain_id} data not resolved")]
    NotResolved {
        /// The chain identifier.
        chain_id: u64,
    },

    /// A child with the same key already exists under the parent.
    #[error("Key {key:#x} already exists under parent")]
    KeyExists {
        /// The conflicting key.
        key: Key,
    },

    /// The parent's block table cannot hold another entry.
    #[error("Block table full at key {key:#x}: capacity {capacity}")]
    BlockTableFull {
        /// The parent key.
        key: Key,
        /// Number of entries the block table can hold.
        capacity: usize,
    },

    /// The parent chain has been deleted.
    #[error("Parent chain {chain_id} is deleted")]
    ParentDeleted {
        /// The parent chain identifier.
        chain_id: u64,
    },

    /// The node type cannot hold children.
    #[error("Chain {chain_id} of type {bref_type} cannot hold children")]
    NotAParent {
        /// The chain identifier.
        chain_id: u64,
        /// The chain's block reference type name.
        bref_type: &'static str,
    },

    /// An invalid argument was supplied.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the problem.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_result_alias() {
        let ok: ChainResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: ChainResult<i32> = Err(ChainError::KeyExists { key: 7 });
        assert!(err.is_err());
    }

    #[test]
    fn test_read_failed_display() {
        let err = ChainError::ReadFailed {
            device: "node1".to_string(),
            data_off: 0x400a,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("node1"));
        assert!(msg.contains("0x400a"));
    }

    #[test]
    fn test_block_table_full_display() {
        let err = ChainError::BlockTableFull {
            key: 0x10,
            capacity: 8,
        };
        assert_eq!(
            format!("{}", err),
            "Block table full at key 0x10: capacity 8"
        );
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ChainError = std_err.into();
        assert!(matches!(err, ChainError::IoError(_)));
    }
}
