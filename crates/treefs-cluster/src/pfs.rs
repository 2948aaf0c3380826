//! Filesystem instances (PFS).

use std::sync::Arc;

use tracing::info;
use treefs_chain::{ChainRef, PfsType, ResolveFlags, TidAllocator, Trans};
use uuid::Uuid;

use crate::cluster::{Cluster, ClusterRef};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::syncthr::{PrimarySync, SyncThr};

/// A logical filesystem instance spanning one or more replicas.
#[derive(Debug)]
pub struct Pfs {
    name: String,
    pfs_type: PfsType,
    clid: Uuid,
    fsid: Uuid,
    iroot: ClusterRef,
    tids: TidAllocator,
    syncthr: SyncThr,
    config: ClusterConfig,
}

impl Pfs {
    /// Creates an instance over the per-replica root chains (`None` for an
    /// absent replica). The root chains get one reference for the
    /// instance's template root cluster.
    pub fn new(
        name: &str,
        pfs_type: PfsType,
        roots: Vec<Option<ChainRef>>,
        config: ClusterConfig,
    ) -> ClusterResult<Arc<Self>> {
        config.validate()?;
        if roots.len() > config.max_chains {
            return Err(ClusterError::TooManyChains {
                count: roots.len(),
                max: config.max_chains,
            });
        }
        let pfs = Arc::new_cyclic(|weak| Pfs {
            name: name.to_string(),
            pfs_type,
            clid: Uuid::new_v4(),
            fsid: Uuid::new_v4(),
            iroot: Cluster::build_template(roots, Some(weak.clone())),
            tids: TidAllocator::default(),
            syncthr: SyncThr::new(name, config.syncthr.clone()),
            config: config.clone(),
        });
        info!(pfs = %name, clid = %pfs.clid, fsid = %pfs.fsid, nchains = pfs.iroot.nchains(), "pfs created");
        Ok(pfs)
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance type.
    pub fn pfs_type(&self) -> PfsType {
        self.pfs_type
    }

    /// Cluster id shared by every replica of this instance.
    pub fn clid(&self) -> Uuid {
        self.clid
    }

    /// Filesystem id of this instance.
    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The root template cluster. It cannot be locked; use
    /// [`lock_root`](Self::lock_root).
    pub fn iroot(&self) -> &ClusterRef {
        &self.iroot
    }

    /// A locked copy of the root cluster.
    pub fn lock_root(&self) -> ClusterResult<ClusterRef> {
        let root = self.iroot.copy();
        if let Err(e) = root.lock(ResolveFlags::ALWAYS | ResolveFlags::NOREF) {
            root.drop_ref();
            return Err(e);
        }
        Ok(root)
    }

    /// Starts a modifying transaction.
    pub fn begin(&self) -> Trans {
        Trans::begin(&self.tids)
    }

    /// The instance's sync thread.
    pub fn syncthr(&self) -> &SyncThr {
        &self.syncthr
    }

    /// Starts the sync thread with the default driver.
    pub fn start_sync(&self) -> ClusterResult<()> {
        self.syncthr.start(PrimarySync::new(&self.name))
    }

    /// Stops the sync thread and releases the root template's references.
    pub async fn unmount(&self) -> ClusterResult<()> {
        self.syncthr.delete().await?;
        if self.iroot.refs() > 0 {
            self.iroot.drop_ref();
        }
        info!(pfs = %self.name, "pfs unmounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treefs_chain::{BrefType, Chain};

    fn roots(n: usize) -> Vec<Option<ChainRef>> {
        (0..n)
            .map(|_| Some(Chain::new_root(None, BrefType::Volume, 1024)))
            .collect()
    }

    #[test]
    fn test_new_and_lock_root() {
        let chains = roots(2);
        let pfs = Pfs::new("test", PfsType::Master, chains.clone(), ClusterConfig::default()).unwrap();
        assert_ne!(pfs.clid(), pfs.fsid());
        for chain in chains.iter().flatten() {
            assert_eq!(chain.refs(), 1);
        }

        let root = pfs.lock_root().unwrap();
        assert!(root.is_locked());
        assert_eq!(root.focus_index(), Some(0));
        assert!(Arc::ptr_eq(&root.pmp().unwrap(), &pfs));
        for chain in chains.iter().flatten() {
            assert!(chain.is_locked());
            assert_eq!(chain.refs(), 2);
        }
        root.unlock();
        for chain in chains.iter().flatten() {
            assert!(!chain.is_locked());
            assert_eq!(chain.refs(), 1);
        }
    }

    #[test]
    #[should_panic(expected = "inode-embedded template")]
    fn test_template_cannot_be_locked() {
        let pfs = Pfs::new("tmpl", PfsType::Master, roots(1), ClusterConfig::default()).unwrap();
        let _ = pfs.iroot().lock(ResolveFlags::NEVER);
    }

    #[test]
    fn test_too_many_roots() {
        let config = ClusterConfig {
            max_chains: 2,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            Pfs::new("big", PfsType::Master, roots(3), config),
            Err(ClusterError::TooManyChains { count: 3, max: 2 })
        ));
    }

    #[test]
    fn test_transactions_are_monotonic() {
        let pfs = Pfs::new("tids", PfsType::Master, roots(1), ClusterConfig::default()).unwrap();
        let a = pfs.begin();
        let b = pfs.begin();
        assert!(b.sync_tid > a.sync_tid);
    }

    #[tokio::test]
    async fn test_unmount_is_idempotent() {
        let pfs = Pfs::new("umount", PfsType::Master, roots(1), ClusterConfig::default()).unwrap();
        pfs.start_sync().unwrap();
        assert!(pfs.syncthr().is_running());
        pfs.unmount().await.unwrap();
        assert!(!pfs.syncthr().is_running());
        pfs.unmount().await.unwrap();
    }
}
