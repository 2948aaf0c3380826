//! Shared fixtures for treefs-cluster integration tests.

#![allow(dead_code)]

use treefs_chain::{
    flush, BrefType, Chain, ChainRef, Device, DeviceConfig, DeviceRef, ResolveFlags, TidAllocator,
    Trans,
};
use treefs_cluster::{Cluster, ClusterRef};

/// Size of every replica's volume root.
pub const ROOT_BYTES: usize = 4096;

/// Installs a test-friendly subscriber once per test binary. `RUST_LOG`
/// controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A set of independent replicas, each a device with a volume root.
pub struct Replicas {
    pub devices: Vec<DeviceRef>,
    pub roots: Vec<ChainRef>,
    pub tids: TidAllocator,
}

impl Replicas {
    pub fn new(tag: &str, n: usize) -> Self {
        init_tracing();
        let devices: Vec<DeviceRef> = (0..n)
            .map(|i| Device::new(DeviceConfig::named(&format!("{}-r{}", tag, i))).unwrap())
            .collect();
        let roots = devices
            .iter()
            .map(|dev| Chain::new_root(Some(dev.clone()), BrefType::Volume, ROOT_BYTES))
            .collect();
        Self {
            devices,
            roots,
            tids: TidAllocator::default(),
        }
    }

    /// Root chains as cluster slots.
    pub fn slots(&self) -> Vec<Option<ChainRef>> {
        self.roots.iter().cloned().map(Some).collect()
    }

    /// Locks every root and wraps them in a locked cluster.
    pub fn root_cluster(&self) -> ClusterRef {
        for root in &self.roots {
            root.lock(ResolveFlags::ALWAYS).unwrap();
        }
        Cluster::from_chains(self.slots(), None).unwrap()
    }

    pub fn begin(&self) -> Trans {
        Trans::begin(&self.tids)
    }

    /// Flushes every replica from its root.
    pub fn flush_all(&self) {
        let trans = self.begin();
        for root in &self.roots {
            flush(&trans, root).unwrap();
        }
    }
}

/// Walks `[0, KEY_MAX]` under `cparent` and returns each position's key with
/// the slots populated there.
pub fn walk(cparent: &ClusterRef) -> Vec<(u64, Vec<usize>)> {
    use treefs_chain::{LookupFlags, KEY_MAX};

    let mut seen = Vec::new();
    let mut key_next = 0;
    let mut cur = Cluster::lookup(cparent, &mut key_next, 0, KEY_MAX, LookupFlags::empty()).unwrap();
    while let Some(cluster) = cur {
        let slots: Vec<usize> = cluster
            .chains()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| i)
            .collect();
        seen.push((cluster.bref().unwrap().key, slots));
        cur = Cluster::next(cparent, cluster, &mut key_next, 0, KEY_MAX, LookupFlags::empty())
            .unwrap();
    }
    seen
}
