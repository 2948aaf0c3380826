#![warn(missing_docs)]

//! treefs cluster subsystem: replica aggregation over per-replica chains.
//!
//! A [`Cluster`] binds the chains that represent the same logical tree
//! position on every replica and presents them as one object: all-or-nothing
//! locking, lookup and iteration that merge the replicas' key spaces,
//! fan-out mutation, and propagation of in-place edits from the focus
//! replica to the others. Each filesystem instance ([`Pfs`]) runs a
//! [`SyncThr`] that schedules replica repair.

pub mod cluster;
pub mod config;
pub mod error;
pub mod io;
pub mod pfs;
pub mod snapshot;
pub mod syncthr;

pub use cluster::{Cluster, ClusterFlags, ClusterRef, ClusterSlot, MAX_CLUSTER_CHAINS};
pub use config::{ClusterConfig, SyncThrConfig};
pub use error::{ClusterError, ClusterResult};
pub use io::Iocb;
pub use pfs::Pfs;
pub use syncthr::{PrimarySync, SyncDriver, SyncMsg, SyncState, SyncThr, SyncThrStats};
