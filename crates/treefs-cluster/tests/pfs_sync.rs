//! Filesystem instance lifecycle with its sync thread.

mod common;

use common::Replicas;
use treefs_chain::{BrefType, PfsType};
use treefs_cluster::{
    Cluster, ClusterConfig, ClusterError, Pfs, SyncState, SyncThr, SyncThrConfig,
};

fn fast_config() -> ClusterConfig {
    ClusterConfig {
        syncthr: SyncThrConfig {
            ack_poll_interval_ms: 10,
            ..SyncThrConfig::default()
        },
        ..ClusterConfig::default()
    }
}

#[tokio::test]
async fn test_sync_thread_follows_pfs_lifecycle() {
    let replicas = Replicas::new("pfs-sync", 2);
    let pmp = Pfs::new("data", PfsType::Master, replicas.slots(), fast_config()).unwrap();
    assert_eq!(pmp.syncthr().state(), SyncState::Stopped);

    pmp.start_sync().unwrap();
    let mut states = pmp.syncthr().subscribe().unwrap();
    pmp.syncthr().remaster().await.unwrap();
    pmp.syncthr().requeue(0x1234).await.unwrap();
    pmp.syncthr().freeze().await.unwrap();
    assert_eq!(*states.borrow_and_update(), SyncState::Frozen);

    let stats = pmp.syncthr().stats();
    assert_eq!(stats.remasters, 1);
    assert_eq!(stats.resyncs, 1);
    assert_eq!(stats.freezes, 1);
    assert_eq!(stats.deferred, 0);

    pmp.syncthr().unfreeze().await.unwrap();
    assert_eq!(pmp.syncthr().state(), SyncState::Idle);

    pmp.unmount().await.unwrap();
    assert_eq!(pmp.syncthr().state(), SyncState::Stopped);
    assert_eq!(pmp.syncthr().stats().unfreezes, 1);
    assert!(matches!(
        pmp.syncthr().freeze().await,
        Err(ClusterError::SyncThrNotRunning { .. })
    ));
    for root in &replicas.roots {
        assert_eq!(root.refs(), 0);
    }
}

#[tokio::test]
async fn test_unmount_without_sync_thread() {
    let replicas = Replicas::new("pfs-nosync", 1);
    let pmp = Pfs::new("cold", PfsType::Slave, replicas.slots(), fast_config()).unwrap();
    assert!(!pmp.syncthr().is_running());
    pmp.unmount().await.unwrap();
    pmp.unmount().await.unwrap();
    assert_eq!(replicas.roots[0].refs(), 0);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let thr = SyncThr::new("idem", fast_config().syncthr);
    thr.delete().await.unwrap();
    thr.start(treefs_cluster::PrimarySync::new("idem")).unwrap();
    thr.delete().await.unwrap();
    thr.delete().await.unwrap();
    assert!(!thr.is_running());

    // A stopped thread can be started again.
    thr.start(treefs_cluster::PrimarySync::new("idem")).unwrap();
    assert!(thr.is_running());
    thr.delete().await.unwrap();
}

#[tokio::test]
async fn test_clusters_carry_their_pfs() {
    let replicas = Replicas::new("pfs-pmp", 2);
    let pmp = Pfs::new("owner", PfsType::Master, replicas.slots(), fast_config()).unwrap();
    let root = pmp.lock_root().unwrap();
    let trans = pmp.begin();
    let child = Cluster::create(&trans, &root, None, 7, 0, BrefType::Data, 16, 0).unwrap();
    assert!(std::sync::Arc::ptr_eq(&child.pmp().unwrap(), &pmp));
    child.unlock();
    root.unlock();
    pmp.unmount().await.unwrap();
}

#[test]
fn test_config_from_json_drives_pfs() {
    let config = ClusterConfig::from_json(r#"{"max_chains": 2}"#).unwrap();
    let replicas = Replicas::new("pfs-json", 3);
    assert!(matches!(
        Pfs::new("wide", PfsType::Master, replicas.slots(), config),
        Err(ClusterError::TooManyChains { count: 3, max: 2 })
    ));
}
