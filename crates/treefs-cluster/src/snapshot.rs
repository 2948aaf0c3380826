//! Snapshot creation.
//!
//! A snapshot is a new PFS root inode placed under the super-root. Each of
//! its replicas starts with the blockset of the corresponding source replica,
//! so the snapshot shares every flushed block with its source copy-on-write,
//! and gets a fresh cluster id and filesystem id. Nothing links the snapshot
//! back to its source afterwards.

use std::sync::Arc;

use tracing::{debug, info, warn};
use treefs_chain::{
    dirhash, flush,
    media::{inode_union, inode_union_mut, INODE_BYTES, INODE_MAXNAME, OPFLAG_PFSROOT},
    BrefType, ChainError, LookupFlags, PfsType, Trans, BREF_FLAG_PFSROOT, DIRHASH_LOMASK,
};
use uuid::Uuid;

use crate::cluster::{Cluster, ClusterRef};
use crate::error::{ClusterError, ClusterResult};
use crate::pfs::Pfs;

impl Cluster {
    /// Snapshots the PFS root `ocluster` (locked) under the super-root of
    /// `spmp` with the given name. Returns an unlocked cluster over the new
    /// root inode, holding one reference.
    ///
    /// The source is flushed first so that its blockset covers everything
    /// written so far.
    pub fn snapshot(
        trans: &Trans,
        ocluster: &ClusterRef,
        spmp: &Arc<Pfs>,
        name: &str,
    ) -> ClusterResult<ClusterRef> {
        if name.is_empty() || name.len() > INODE_MAXNAME {
            return Err(ClusterError::InvalidName {
                reason: format!("snapshot name length {} outside 1..={}", name.len(), INODE_MAXNAME),
            });
        }
        if ocluster.cluster_type() != Some(BrefType::Inode) {
            return Err(ChainError::InvalidArgument {
                reason: "snapshot source is not an inode".to_string(),
            }
            .into());
        }
        let oip = ocluster.rdata_inode()?;
        for chain in ocluster.chains().iter().flatten() {
            flush(trans, chain)?;
        }

        let cparent = spmp.lock_root()?;
        let result = Self::snapshot_under(trans, ocluster, &cparent, oip, name);
        cparent.unlock();
        result
    }

    fn snapshot_under(
        trans: &Trans,
        ocluster: &ClusterRef,
        cparent: &ClusterRef,
        oip: treefs_chain::InodeData,
        name: &str,
    ) -> ClusterResult<ClusterRef> {
        let hash = dirhash(name.as_bytes());
        let mut lhc = hash;
        loop {
            let mut key_next = 0;
            let found = Cluster::lookup(
                cparent,
                &mut key_next,
                lhc,
                lhc,
                LookupFlags::NOLOCK | LookupFlags::NODATA,
            )?;
            let Some(found) = found else { break };
            found.drop_ref();
            if lhc & DIRHASH_LOMASK == DIRHASH_LOMASK {
                return Err(ClusterError::KeySpaceExhausted { key: hash });
            }
            lhc += 1;
        }
        debug!(name, key = %format_args!("{:#x}", lhc), "snapshot key");

        let nclust = Cluster::create(
            trans,
            cparent,
            None,
            lhc,
            0,
            BrefType::Inode,
            INODE_BYTES,
            BREF_FLAG_PFSROOT,
        )?;
        if let Err(e) = Self::snapshot_fill(trans, ocluster, &nclust, oip, name, lhc) {
            if let Err(de) = Cluster::delete(trans, cparent, &nclust) {
                warn!(name, error = %de, "snapshot: could not remove partial root");
            }
            nclust.unlock();
            warn!(name, error = %e, "snapshot failed, partial root removed");
            return Err(e);
        }
        let snap = nclust.copy();
        nclust.unlock();
        Ok(snap)
    }

    fn snapshot_fill(
        trans: &Trans,
        ocluster: &ClusterRef,
        nclust: &ClusterRef,
        oip: treefs_chain::InodeData,
        name: &str,
        lhc: u64,
    ) -> ClusterResult<()> {
        let ofocus = ocluster.focus().ok_or(ClusterError::NoFocus)?;
        for (i, nchain) in nclust.chains().iter().enumerate() {
            let Some(nchain) = nchain else { continue };
            let source = ocluster.chain(i).unwrap_or_else(|| Arc::clone(&ofocus));
            let blockset = source.with_data(|d| {
                (d.len() >= INODE_BYTES).then(|| inode_union(d).to_vec())
            })?;
            let Some(blockset) = blockset else {
                return Err(ChainError::InvalidArgument {
                    reason: format!("snapshot source replica {} is not a full inode", i),
                }
                .into());
            };
            nchain.with_data_mut(|d| inode_union_mut(d).copy_from_slice(&blockset))?;
        }

        let mut nip = oip;
        nip.filename = name.to_string();
        nip.name_key = lhc;
        nip.nlinks = 1;
        nip.pfs_type = PfsType::Snapshot;
        nip.op_flags |= OPFLAG_PFSROOT;
        nip.pfs_clid = Uuid::new_v4();
        nip.pfs_fsid = Uuid::new_v4();
        nclust.wdata(|d| nip.encode_into(d))??;
        nclust.modsync();

        for chain in nclust.chains().iter().flatten() {
            flush(trans, chain)?;
        }
        info!(
            name,
            key = %format_args!("{:#x}", lhc),
            clid = %nip.pfs_clid,
            fsid = %nip.pfs_fsid,
            "snapshot created"
        );
        Ok(())
    }
}
