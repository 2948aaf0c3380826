#![warn(missing_docs)]

//! treefs chain layer: per-replica tree nodes over a block device.
//!
//! A chain is one replica's view of one position in a copy-on-write tree.
//! This crate provides the chain type with its lock/ref discipline, the
//! on-media block reference and inode formats, an in-memory block device with
//! asynchronous reads, and a depth-first flush that places modified chains
//! on their device.

pub mod bref;
pub mod chain;
pub mod device;
pub mod error;
pub mod flags;
pub mod flush;
pub mod media;
pub mod trans;

pub use bref::{
    dirhash, BlockRef, BrefType, CheckMethod, Key, BREF_FLAG_PFSROOT, DIRHASH_LOMASK,
    DIRHASH_VISIBLE, KEY_MAX,
};
pub use chain::{Chain, ChainFlags, ChainRef, LookupFlags, ResolveFlags};
pub use device::{Device, DeviceConfig, DeviceRef, IoCallback, IoStats};
pub use error::{ChainError, ChainResult};
pub use flush::{flush, FlushStats};
pub use media::{InodeData, ObjType, PfsType};
pub use trans::{TidAllocator, Trans};
