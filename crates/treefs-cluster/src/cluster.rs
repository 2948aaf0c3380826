//! Clusters: the set of per-replica chains that represent one logical tree
//! position.
//!
//! A cluster holds one slot per replica. Slots keep their index for the life
//! of the cluster ("replica N" is always slot N) and may be empty when a
//! replica is absent or has failed. One populated slot is the *focus*: the
//! replica that answers every query that is not about block-table layout.
//!
//! Reference accounting: a cluster's `refs` is the number of logical holders,
//! and every populated slot's chain carries one chain reference per cluster
//! reference. Locking a cluster adds a reference (unless `NOREF`) and locks
//! every populated chain in slot order; unlocking reverses both.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use treefs_chain::{
    bref::OFF_MASK_RADIX,
    media::{INODE_BYTES, INODE_UNION_OFFSET},
    BlockRef, BrefType, Chain, ChainError, ChainFlags, ChainRef, CheckMethod, InodeData, Key,
    LookupFlags, ResolveFlags, Trans,
};

use crate::error::{ClusterError, ClusterResult};
use crate::pfs::Pfs;

/// Shared handle to a cluster.
pub type ClusterRef = Arc<Cluster>;

/// Fixed capacity of a cluster's slot array.
pub const MAX_CLUSTER_CHAINS: usize = 8;

/// Re-checks of a moving parent link after which `parent()` starts warning.
const PARENT_RETRY_WARN: u32 = 100;

treefs_chain::flag_set! {
    /// State bits of a cluster.
    pub struct ClusterFlags {
        /// Locked by its holder.
        const LOCKED = 0x0001;
        /// Template embedded in an inode; only copies may be locked.
        const INODE = 0x0002;
    }
}

/// One replica position.
#[derive(Debug, Clone, Default)]
pub struct ClusterSlot {
    /// The replica's chain, if present.
    pub chain: Option<ChainRef>,
    /// Iteration hint into the chain's child index.
    pub cache_index: usize,
}

impl ClusterSlot {
    fn new(chain: Option<ChainRef>) -> Self {
        Self {
            chain,
            cache_index: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    pub(crate) array: Vec<ClusterSlot>,
    pub(crate) focus: Option<usize>,
    pub(crate) flags: ClusterFlags,
    pub(crate) ddflag: bool,
    pub(crate) iocb_inflight: bool,
}

impl ClusterState {
    fn chains(&self) -> Vec<Option<ChainRef>> {
        self.array.iter().map(|s| s.chain.clone()).collect()
    }

    fn focus_chain(&self) -> Option<ChainRef> {
        self.focus
            .and_then(|i| self.array.get(i))
            .and_then(|s| s.chain.clone())
    }

    fn release_slots(&mut self) {
        for slot in &mut self.array {
            slot.chain = None;
        }
        self.focus = None;
    }
}

/// The per-replica chains that represent one logical tree position.
#[derive(Debug)]
pub struct Cluster {
    refs: AtomicU32,
    pmp: Option<Weak<Pfs>>,
    pub(crate) state: Mutex<ClusterState>,
}

/// Focus for a result array: the slot mirroring `preferred` when populated,
/// otherwise the first populated slot.
fn pick_focus(array: &[ClusterSlot], preferred: Option<usize>) -> Option<usize> {
    preferred
        .filter(|&i| array.get(i).is_some_and(|s| s.chain.is_some()))
        .or_else(|| array.iter().position(|s| s.chain.is_some()))
}

fn release_chain(chain: &ChainRef, flags: LookupFlags) {
    if flags.contains(LookupFlags::NOLOCK) {
        chain.decrement_ref();
    } else {
        chain.unlock();
    }
}

impl Cluster {
    fn build(
        array: Vec<ClusterSlot>,
        focus: Option<usize>,
        flags: ClusterFlags,
        pmp: Option<Weak<Pfs>>,
    ) -> ClusterRef {
        let ddflag = focus
            .and_then(|i| array.get(i))
            .and_then(|s| s.chain.as_ref())
            .is_some_and(|c| c.bref_type() == BrefType::Inode);
        Arc::new(Self {
            refs: AtomicU32::new(1),
            pmp,
            state: Mutex::new(ClusterState {
                array,
                focus,
                flags,
                ddflag,
                iocb_inflight: false,
            }),
        })
    }

    /// Wraps one already-locked chain. The cluster is locked, holds one
    /// reference, and focuses on that chain.
    pub fn from_chain(chain: ChainRef, pmp: Option<&Arc<Pfs>>) -> ClusterRef {
        Self::build(
            vec![ClusterSlot::new(Some(chain))],
            Some(0),
            ClusterFlags::LOCKED,
            pmp.map(Arc::downgrade),
        )
    }

    /// Wraps one already-locked chain per replica; `None` marks an absent
    /// replica.
    pub fn from_chains(
        chains: Vec<Option<ChainRef>>,
        pmp: Option<&Arc<Pfs>>,
    ) -> ClusterResult<ClusterRef> {
        if chains.len() > MAX_CLUSTER_CHAINS {
            return Err(ClusterError::TooManyChains {
                count: chains.len(),
                max: MAX_CLUSTER_CHAINS,
            });
        }
        let array: Vec<ClusterSlot> = chains.into_iter().map(ClusterSlot::new).collect();
        let focus = pick_focus(&array, None);
        Ok(Self::build(
            array,
            focus,
            ClusterFlags::LOCKED,
            pmp.map(Arc::downgrade),
        ))
    }

    /// Builds the unlocked template cluster embedded in an inode. Each chain
    /// gets a reference; the template itself may never be locked, only its
    /// copies.
    pub fn template(
        chains: Vec<Option<ChainRef>>,
        pmp: Option<Weak<Pfs>>,
    ) -> ClusterResult<ClusterRef> {
        if chains.len() > MAX_CLUSTER_CHAINS {
            return Err(ClusterError::TooManyChains {
                count: chains.len(),
                max: MAX_CLUSTER_CHAINS,
            });
        }
        Ok(Self::build_template(chains, pmp))
    }

    /// [`template`](Self::template) for callers that already checked the
    /// slot count.
    pub(crate) fn build_template(chains: Vec<Option<ChainRef>>, pmp: Option<Weak<Pfs>>) -> ClusterRef {
        for chain in chains.iter().flatten() {
            chain.increment_ref();
        }
        let array: Vec<ClusterSlot> = chains.into_iter().map(ClusterSlot::new).collect();
        let focus = pick_focus(&array, None);
        Self::build(array, focus, ClusterFlags::INODE, pmp)
    }

    /// New unlocked cluster over the same chains, holding one reference.
    /// The focus is left unset until the copy is locked.
    pub fn copy(&self) -> ClusterRef {
        let st = self.state.lock();
        for chain in st.array.iter().filter_map(|s| s.chain.as_ref()) {
            chain.increment_ref();
        }
        let ncluster = Self::build(
            st.array.clone(),
            None,
            ClusterFlags::empty(),
            self.pmp.clone(),
        );
        ncluster.state.lock().ddflag = st.ddflag;
        ncluster
    }

    /// Adds a cluster reference and one reference to every chain.
    pub fn add_ref(&self) {
        let st = self.state.lock();
        self.refs.fetch_add(1, Ordering::AcqRel);
        for chain in st.array.iter().filter_map(|s| s.chain.as_ref()) {
            chain.increment_ref();
        }
    }

    /// Drops a cluster reference and one reference from every chain. The
    /// last drop releases every slot.
    pub fn drop_ref(&self) {
        let mut st = self.state.lock();
        let refs = self.refs.load(Ordering::Acquire);
        assert!(refs > 0, "cluster drop: no references held");
        for chain in st.array.iter().filter_map(|s| s.chain.as_ref()) {
            chain.decrement_ref();
        }
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            st.release_slots();
        }
    }

    /// Locks every populated slot in slot order, adding a cluster reference
    /// unless `how` contains `NOREF`.
    ///
    /// All-or-nothing: if any slot fails, the slots locked by this call are
    /// unlocked in reverse order, the added reference is undone and the
    /// first error is returned.
    pub fn lock(&self, how: ResolveFlags) -> ClusterResult<()> {
        let chains = {
            let st = self.state.lock();
            assert!(
                !st.flags.contains(ClusterFlags::INODE),
                "cluster lock: inode-embedded template cannot be locked"
            );
            if st.flags.contains(ClusterFlags::LOCKED) {
                warn!(refs = self.refs(), "cluster lock: already locked");
            }
            st.chains()
        };
        let add_ref = !how.contains(ResolveFlags::NOREF);
        if add_ref {
            self.refs.fetch_add(1, Ordering::AcqRel);
        }

        let mut locked: Vec<&ChainRef> = Vec::with_capacity(chains.len());
        for (i, chain) in chains.iter().enumerate() {
            let Some(chain) = chain else { continue };
            if let Err(e) = chain.lock(how) {
                debug!(slot = i, error = %e, "cluster lock: slot failed, unwinding");
                for prev in locked.iter().rev() {
                    if how.contains(ResolveFlags::NOREF) {
                        prev.increment_ref();
                    }
                    prev.unlock();
                }
                if add_ref {
                    self.refs.fetch_sub(1, Ordering::AcqRel);
                }
                return Err(e.into());
            }
            locked.push(chain);
        }

        let mut st = self.state.lock();
        st.flags.insert(ClusterFlags::LOCKED);
        if st.focus.is_none() {
            st.focus = pick_focus(&st.array, None);
        }
        if let Some(focus) = st.focus_chain() {
            st.ddflag = focus.bref_type() == BrefType::Inode;
        }
        Ok(())
    }

    /// Unlocks every populated slot and drops the lock's reference. The last
    /// reference releases every slot.
    pub fn unlock(&self) {
        let chains = {
            let mut st = self.state.lock();
            assert!(self.refs() > 0, "cluster unlock: no references held");
            if !st.flags.contains(ClusterFlags::LOCKED) {
                warn!(refs = self.refs(), "cluster unlock: not locked");
            }
            st.flags.remove(ClusterFlags::LOCKED);
            st.chains()
        };
        for chain in chains.iter().flatten() {
            chain.unlock();
        }
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.lock().release_slots();
        }
    }

    /// Prepares `cparent` for a lookup: returns a copy holding its own
    /// reference, locked unless `flags` contains `NOLOCK`, focused on the
    /// same replica as `cparent`.
    pub fn lookup_init(cparent: &ClusterRef, flags: LookupFlags) -> ClusterResult<ClusterRef> {
        let focus = cparent.focus_index();
        let cluster = cparent.copy();
        if !flags.contains(LookupFlags::NOLOCK) {
            let mut how = ResolveFlags::ALWAYS | ResolveFlags::NOREF;
            if flags.contains(LookupFlags::SHARED) {
                how |= ResolveFlags::SHARED;
            }
            if let Err(e) = cluster.lock(how) {
                cluster.drop_ref();
                return Err(e);
            }
        }
        let mut st = cluster.state.lock();
        st.focus = pick_focus(&st.array, focus);
        drop(st);
        Ok(cluster)
    }

    /// Releases a parent obtained from [`lookup_init`](Self::lookup_init)
    /// with the same `flags`.
    pub fn lookup_done(cparent: ClusterRef, flags: LookupFlags) {
        if flags.contains(LookupFlags::NOLOCK) {
            cparent.drop_ref();
        } else {
            cparent.unlock();
        }
    }

    /// Finds the first block position overlapping `[key_beg, key_end]` on
    /// any replica under `cparent`.
    ///
    /// Each replica is searched independently. Replicas whose result lies
    /// beyond the smallest key found are released for this round and appear
    /// as holes; they are found again by a later [`next`](Self::next).
    /// Results at the same key must describe the same node, and a released
    /// result must not start inside the range of the node kept; either
    /// divergence panics. `key_next` is
    /// set to the minimum resume key across replicas (0 once the key space
    /// is exhausted). Fails only if every populated parent slot fails.
    pub fn lookup(
        cparent: &ClusterRef,
        key_next: &mut Key,
        key_beg: Key,
        key_end: Key,
        flags: LookupFlags,
    ) -> ClusterResult<Option<ClusterRef>> {
        let (parents, parent_focus) = {
            let st = cparent.state.lock();
            let parents: Vec<(Option<ChainRef>, usize)> = st
                .array
                .iter()
                .map(|s| (s.chain.clone(), s.cache_index))
                .collect();
            (parents, st.focus)
        };

        let mut next_min = key_end.wrapping_add(1);
        let mut results: Vec<ClusterSlot> = Vec::with_capacity(parents.len());
        let mut populated = 0usize;
        let mut first_err: Option<ChainError> = None;
        let mut failed = 0usize;

        for (i, (parent, cache_index)) in parents.iter().enumerate() {
            let mut slot = ClusterSlot {
                chain: None,
                cache_index: *cache_index,
            };
            if let Some(parent) = parent {
                populated += 1;
                let mut slot_next = 0;
                match Chain::lookup(
                    parent,
                    &mut slot_next,
                    key_beg,
                    key_end,
                    &mut slot.cache_index,
                    flags,
                ) {
                    Ok(found) => {
                        slot.chain = found;
                        if slot_next.wrapping_sub(1) < next_min.wrapping_sub(1) {
                            next_min = slot_next;
                        }
                    }
                    Err(e) => {
                        warn!(slot = i, error = %e, "cluster lookup: replica failed");
                        failed += 1;
                        first_err.get_or_insert(e);
                    }
                }
            }
            results.push(slot);
        }

        {
            let mut st = cparent.state.lock();
            for (slot, result) in st.array.iter_mut().zip(&results) {
                slot.cache_index = result.cache_index;
            }
        }

        if populated > 0 && failed == populated {
            error!(key_beg, key_end, "cluster lookup: every replica failed");
            if let Some(e) = first_err {
                return Err(e.into());
            }
        }

        *key_next = next_min;
        Self::assemble(cparent, results, parent_focus, flags)
    }

    /// Releases `cluster` (as returned by [`lookup`](Self::lookup) or a
    /// previous `next` with the same `flags`) and finds the next block
    /// position after it within `[key_beg, key_end]`.
    pub fn next(
        cparent: &ClusterRef,
        cluster: ClusterRef,
        key_next: &mut Key,
        key_beg: Key,
        key_end: Key,
        flags: LookupFlags,
    ) -> ClusterResult<Option<ClusterRef>> {
        let after = cluster
            .chains()
            .iter()
            .flatten()
            .map(|c| c.bref().key_after())
            .min_by_key(|k| k.wrapping_sub(1));
        if flags.contains(LookupFlags::NOLOCK) {
            cluster.drop_ref();
        } else {
            cluster.unlock();
        }
        let key_beg = match after {
            Some(0) => {
                *key_next = 0;
                return Ok(None);
            }
            Some(after) => key_beg.max(after),
            None => key_beg,
        };
        Self::lookup(cparent, key_next, key_beg, key_end, flags)
    }

    /// Keeps only the results at the smallest key, checks that they agree
    /// and wraps them into a cluster.
    fn assemble(
        cparent: &ClusterRef,
        mut results: Vec<ClusterSlot>,
        parent_focus: Option<usize>,
        flags: LookupFlags,
    ) -> ClusterResult<Option<ClusterRef>> {
        let Some(min_key) = results
            .iter()
            .filter_map(|s| s.chain.as_ref())
            .map(|c| c.bref().key)
            .min()
        else {
            return Ok(None);
        };

        // A released result must start past the kept node's range, or the
        // resume key taken from that range would skip it.
        let span_end = results
            .iter()
            .filter_map(|s| s.chain.as_ref())
            .map(|c| c.bref())
            .filter(|b| b.key == min_key)
            .map(|b| b.key_end())
            .max()
            .unwrap_or(min_key);
        let mut seed: Option<(usize, BlockRef)> = None;
        for (i, slot) in results.iter_mut().enumerate() {
            let Some(chain) = slot.chain.as_ref() else {
                continue;
            };
            let bref = chain.bref();
            if bref.key != min_key {
                if bref.key <= span_end {
                    panic!(
                        "cluster lookup: replica {} diverges at key {:#x}: \
                         it lies inside the range {:#x}..={:#x} held by another replica",
                        i, bref.key, min_key, span_end
                    );
                }
                release_chain(chain, flags);
                slot.chain = None;
                continue;
            }
            match &seed {
                None => seed = Some((i, bref)),
                Some((first, expect)) => {
                    if bref.bref_type != expect.bref_type
                        || bref.keybits != expect.keybits
                        || bref.bytes != expect.bytes
                    {
                        panic!(
                            "cluster lookup: replica {} diverges from replica {} at key {:#x}: \
                             {}/{}/{} vs {}/{}/{}",
                            i,
                            first,
                            min_key,
                            bref.bref_type,
                            bref.keybits,
                            bref.bytes,
                            expect.bref_type,
                            expect.keybits,
                            expect.bytes
                        );
                    }
                }
            }
        }

        let focus = pick_focus(&results, parent_focus);
        let cflags = if flags.contains(LookupFlags::NOLOCK) {
            ClusterFlags::empty()
        } else {
            ClusterFlags::LOCKED
        };
        debug!(key = min_key, focus = ?focus, "cluster lookup hit");
        Ok(Some(Self::build(results, focus, cflags, cparent.pmp.clone())))
    }

    /// Creates a new node on every populated replica of `cparent`.
    ///
    /// With `cluster`, only the slots it does not already populate are
    /// created and the new chains are added to it; otherwise a new locked
    /// cluster is returned. If any replica fails, the chains created by this
    /// call are deleted again and the error is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        trans: &Trans,
        cparent: &ClusterRef,
        cluster: Option<&ClusterRef>,
        key: Key,
        keybits: u8,
        bref_type: BrefType,
        bytes: usize,
        bref_flags: u8,
    ) -> ClusterResult<ClusterRef> {
        let (parents, parent_focus) = {
            let st = cparent.state.lock();
            (st.chains(), st.focus)
        };
        let existing: Vec<bool> = match cluster {
            Some(c) => {
                let st = c.state.lock();
                (0..parents.len())
                    .map(|i| st.array.get(i).is_some_and(|s| s.chain.is_some()))
                    .collect()
            }
            None => vec![false; parents.len()],
        };

        let mut created: Vec<(usize, ChainRef)> = Vec::new();
        for (i, parent) in parents.iter().enumerate() {
            let Some(parent) = parent else { continue };
            if existing[i] {
                continue;
            }
            match Chain::create(trans, parent, key, keybits, bref_type, bytes, bref_flags) {
                Ok(chain) => created.push((i, chain)),
                Err(e) => {
                    warn!(slot = i, key, error = %e, "cluster create: replica failed, rolling back");
                    for (j, chain) in created.iter().rev() {
                        if let Some(parent) = &parents[*j] {
                            if let Err(e) = Chain::delete(trans, parent, chain) {
                                warn!(slot = j, error = %e, "cluster create: rollback delete failed");
                            }
                        }
                        chain.unlock();
                    }
                    return Err(e.into());
                }
            }
        }

        let target = match cluster {
            Some(c) => {
                let extra = c.refs().saturating_sub(1);
                let mut st = c.state.lock();
                if st.array.len() < parents.len() {
                    st.array.resize_with(parents.len(), ClusterSlot::default);
                }
                for (i, chain) in created {
                    for _ in 0..extra {
                        chain.increment_ref();
                    }
                    st.array[i].chain = Some(chain);
                }
                if st.focus.is_none() {
                    st.focus = pick_focus(&st.array, parent_focus);
                }
                if let Some(focus) = st.focus_chain() {
                    st.ddflag = focus.bref_type() == BrefType::Inode;
                }
                Arc::clone(c)
            }
            None => {
                let mut array = vec![ClusterSlot::default(); parents.len()];
                for (i, chain) in created {
                    array[i].chain = Some(chain);
                }
                let focus = pick_focus(&array, parent_focus);
                Self::build(array, focus, ClusterFlags::LOCKED, cparent.pmp.clone())
            }
        };
        debug!(key, bref_type = %bref_type, bytes, "cluster created");
        Ok(target)
    }

    /// Marks every populated chain modified. Replicas that fail are logged;
    /// the call fails only if every replica fails. The focus moves off a
    /// replica that could not be modified.
    pub fn modify(&self, trans: &Trans) -> ClusterResult<()> {
        let chains = self.chains();
        let mut first_err = None;
        let mut ok = 0usize;
        for (i, chain) in chains.iter().enumerate() {
            let Some(chain) = chain else { continue };
            match chain.modify(trans) {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(slot = i, error = %e, "cluster modify: replica failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if ok == 0 {
            if let Some(e) = first_err {
                error!("cluster modify: every replica failed");
                return Err(e.into());
            }
        }

        let mut st = self.state.lock();
        let focus_ok = st
            .focus_chain()
            .is_some_and(|c| c.flags().contains(ChainFlags::MODIFIED));
        if !focus_ok {
            st.focus = st.array.iter().position(|s| {
                s.chain
                    .as_ref()
                    .is_some_and(|c| c.flags().contains(ChainFlags::MODIFIED))
            });
        }
        Ok(())
    }

    /// Copies the focus chain's replica-identical payload into every other
    /// replica.
    ///
    /// Inodes copy only the meta area ahead of the union, unless the inode
    /// stores direct data, in which case the whole payload is copied. Data
    /// blocks copy whole. Every other node type carries a replica-local
    /// block table and must never get here. All chains must be modified.
    pub fn modsync(&self) {
        let (focus_idx, chains) = {
            let st = self.state.lock();
            (st.focus, st.chains())
        };
        let Some(focus_idx) = focus_idx else {
            panic!("cluster modsync: no focus");
        };
        let Some(focus) = chains.get(focus_idx).and_then(|c| c.clone()) else {
            panic!("cluster modsync: focus slot {} empty", focus_idx);
        };
        assert!(
            focus.flags().contains(ChainFlags::MODIFIED),
            "cluster modsync: focus not modified"
        );

        let ftype = focus.bref_type();
        let fbytes = focus.bytes();
        let payload = match ftype {
            BrefType::Inode => focus.with_data(|d| {
                let direct = InodeData::decode(d)
                    .map(|ip| ip.has_direct_data())
                    .unwrap_or(false);
                if direct {
                    d.to_vec()
                } else {
                    d[..INODE_UNION_OFFSET.min(d.len())].to_vec()
                }
            }),
            BrefType::Data => focus.with_data(|d| d.to_vec()),
            other => panic!("cluster modsync: illegal node type {}", other),
        };
        let payload = match payload {
            Ok(p) => p,
            Err(e) => panic!("cluster modsync: focus data not resident: {}", e),
        };

        for (i, chain) in chains.iter().enumerate() {
            let Some(chain) = chain else { continue };
            if i == focus_idx || Arc::ptr_eq(chain, &focus) {
                continue;
            }
            assert!(
                chain.flags().contains(ChainFlags::MODIFIED),
                "cluster modsync: replica {} not modified",
                i
            );
            assert!(
                chain.bref_type() == ftype && chain.bytes() == fbytes,
                "cluster modsync: replica {} is {}/{} bytes, focus is {}/{} bytes",
                i,
                chain.bref_type(),
                chain.bytes(),
                ftype,
                fbytes
            );
            let copied = chain.with_data_mut(|d| {
                let n = payload.len().min(d.len());
                d[..n].copy_from_slice(&payload[..n]);
            });
            if let Err(e) = copied {
                panic!("cluster modsync: replica {} data not resident: {}", i, e);
            }
        }
        debug!(bref_type = %ftype, bytes = payload.len(), "cluster modsync");
    }

    /// Moves every replica's chain under the matching slot of `cparent`,
    /// optionally changing its key. Replicas without a parent slot are
    /// skipped.
    pub fn rename(
        trans: &Trans,
        new_key: Option<(Key, u8)>,
        cparent: &ClusterRef,
        cluster: &ClusterRef,
    ) -> ClusterResult<()> {
        let parents = cparent.chains();
        let chains = cluster.chains();
        Self::fan_out("rename", &parents, &chains, |parent, chain| {
            Chain::rename(trans, new_key, parent, chain)
        })
    }

    /// Deletes every replica's chain from the matching slot of `cparent`.
    /// A replica whose chain is not a child of its parent slot is logged and
    /// skipped.
    pub fn delete(trans: &Trans, cparent: &ClusterRef, cluster: &ClusterRef) -> ClusterResult<()> {
        let parents = cparent.chains();
        let chains = cluster.chains();
        let mut matched_parents = parents.clone();
        for (i, chain) in chains.iter().enumerate() {
            let (Some(chain), Some(Some(parent))) = (chain, parents.get(i)) else {
                continue;
            };
            if !chain.parent().is_some_and(|p| Arc::ptr_eq(&p, parent)) {
                warn!(
                    slot = i,
                    chain = chain.id(),
                    parent = parent.id(),
                    "cluster delete: parent mismatch, skipping replica"
                );
                matched_parents[i] = None;
            }
        }
        Self::fan_out("delete", &matched_parents, &chains, |parent, chain| {
            Chain::delete(trans, parent, chain)
        })
    }

    /// Resizes every replica's data chain to `1 << nradix` bytes. Parent and
    /// child must have the same number of slots.
    pub fn resize(
        trans: &Trans,
        cparent: &ClusterRef,
        cluster: &ClusterRef,
        nradix: u8,
    ) -> ClusterResult<()> {
        let parents = cparent.chains();
        let chains = cluster.chains();
        if parents.len() != chains.len() {
            return Err(ClusterError::SlotCountMismatch {
                parent: parents.len(),
                child: chains.len(),
            });
        }
        Self::fan_out("resize", &parents, &chains, |parent, chain| {
            Chain::resize(trans, parent, chain, nradix)
        })
    }

    fn fan_out<F>(
        op: &'static str,
        parents: &[Option<ChainRef>],
        chains: &[Option<ChainRef>],
        mut f: F,
    ) -> ClusterResult<()>
    where
        F: FnMut(&ChainRef, &ChainRef) -> Result<(), ChainError>,
    {
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut first_err = None;
        for (i, chain) in chains.iter().enumerate() {
            let Some(chain) = chain else { continue };
            let Some(Some(parent)) = parents.get(i) else {
                debug!(op, slot = i, "no parent replica, skipping");
                continue;
            };
            attempted += 1;
            if let Err(e) = f(parent, chain) {
                warn!(op, slot = i, error = %e, "replica failed");
                failed += 1;
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) if failed == attempted => {
                error!(op, failed, "every replica failed");
                Err(e.into())
            }
            Some(_) => {
                warn!(op, failed, attempted, "partial replica failure");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Returns a new locked cluster whose slots are the current parents of
    /// this cluster's chains, focused on the replica this cluster focuses on.
    ///
    /// A chain's parent can change while its lock is dropped, so each slot
    /// re-validates the parent link once both are held and retries if it
    /// moved.
    pub fn parent(&self) -> ClusterResult<ClusterRef> {
        let (chains, focus) = {
            let st = self.state.lock();
            (st.chains(), st.focus)
        };
        let mut parents: Vec<ClusterSlot> = Vec::with_capacity(chains.len());
        for (i, chain) in chains.iter().enumerate() {
            let Some(chain) = chain else {
                parents.push(ClusterSlot::default());
                continue;
            };
            match Self::lock_parent(i, chain) {
                Ok(parent) => parents.push(ClusterSlot::new(parent)),
                Err(e) => {
                    for p in parents.iter().rev().filter_map(|s| s.chain.as_ref()) {
                        p.unlock();
                    }
                    return Err(e);
                }
            }
        }
        let focus = pick_focus(&parents, focus);
        Ok(Self::build(
            parents,
            focus,
            ClusterFlags::LOCKED,
            self.pmp.clone(),
        ))
    }

    fn lock_parent(slot: usize, chain: &ChainRef) -> ClusterResult<Option<ChainRef>> {
        let mut retries = 0u32;
        loop {
            let Some(parent) = chain.parent() else {
                return Ok(None);
            };
            parent.increment_ref();
            chain.increment_ref();
            chain.unlock();
            let locked = parent.lock(ResolveFlags::ALWAYS);
            parent.decrement_ref();
            // The extra child reference becomes the relock's reference. The
            // child is relocked without resolving and stays locked on every
            // exit.
            if let Err(e) = chain.lock(ResolveFlags::NEVER | ResolveFlags::NOREF) {
                panic!(
                    "cluster parent: slot {} chain {} could not be relocked: {}",
                    slot,
                    chain.id(),
                    e
                );
            }
            locked?;
            if chain.parent().is_some_and(|p| Arc::ptr_eq(&p, &parent)) {
                return Ok(Some(parent));
            }
            parent.unlock();
            retries += 1;
            debug!(slot, retries, "cluster parent: parent moved, retrying");
            if retries % PARENT_RETRY_WARN == 0 {
                warn!(slot, retries, "cluster parent: parent link keeps moving");
            }
        }
    }

    /// Logical reference count.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Current state bits.
    pub fn flags(&self) -> ClusterFlags {
        self.state.lock().flags
    }

    /// True while locked by its holder.
    pub fn is_locked(&self) -> bool {
        self.flags().contains(ClusterFlags::LOCKED)
    }

    /// Owning filesystem instance, if any.
    pub fn pmp(&self) -> Option<Arc<Pfs>> {
        self.pmp.as_ref().and_then(Weak::upgrade)
    }

    /// Number of slots.
    pub fn nchains(&self) -> usize {
        self.state.lock().array.len()
    }

    /// The chain in slot `i`.
    pub fn chain(&self, i: usize) -> Option<ChainRef> {
        self.state.lock().array.get(i).and_then(|s| s.chain.clone())
    }

    /// Every slot's chain, in slot order.
    pub fn chains(&self) -> Vec<Option<ChainRef>> {
        self.state.lock().chains()
    }

    /// Index of the focus slot.
    pub fn focus_index(&self) -> Option<usize> {
        self.state.lock().focus
    }

    /// The focus chain.
    pub fn focus(&self) -> Option<ChainRef> {
        self.state.lock().focus_chain()
    }

    /// True when the focus is a directory-entry/inode node.
    pub fn ddflag(&self) -> bool {
        self.state.lock().ddflag
    }

    fn require_focus(&self) -> ClusterResult<ChainRef> {
        self.focus().ok_or(ClusterError::NoFocus)
    }

    /// Runs `f` over the focus payload.
    pub fn rdata<R>(&self, f: impl FnOnce(&[u8]) -> R) -> ClusterResult<R> {
        Ok(self.require_focus()?.with_data(f)?)
    }

    /// Runs `f` over the focus payload, mutably. The cluster must already
    /// be modified.
    pub fn wdata<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> ClusterResult<R> {
        let focus = self.require_focus()?;
        assert!(
            focus.flags().contains(ChainFlags::MODIFIED),
            "cluster wdata: focus not modified"
        );
        Ok(focus.with_data_mut(f)?)
    }

    /// Decodes the focus inode.
    pub fn rdata_inode(&self) -> ClusterResult<InodeData> {
        let raw = self.rdata(|d| InodeData::decode(d))?;
        Ok(raw?)
    }

    /// Applies `f` to the decoded focus inode and writes it back. The
    /// cluster must already be modified.
    pub fn wdata_inode(&self, f: impl FnOnce(&mut InodeData)) -> ClusterResult<()> {
        let raw = self.wdata(|d| -> Result<(), ChainError> {
            let mut ip = InodeData::decode(d)?;
            f(&mut ip);
            let n = INODE_BYTES.min(d.len());
            ip.encode_into(&mut d[..n])
        })?;
        Ok(raw?)
    }

    /// Focus block reference with the replica-local device offset stripped
    /// (the allocation radix is kept).
    pub fn bref(&self) -> Option<BlockRef> {
        self.focus().map(|c| {
            let mut bref = c.bref();
            bref.data_off &= OFF_MASK_RADIX;
            bref
        })
    }

    /// Node type of the focus.
    pub fn cluster_type(&self) -> Option<BrefType> {
        self.focus().map(|c| c.bref_type())
    }

    /// True when the focus is modified.
    pub fn is_modified(&self) -> bool {
        self.focus()
            .is_some_and(|c| c.flags().contains(ChainFlags::MODIFIED))
    }

    /// True when the focus payload size differs from `bytes`.
    pub fn need_resize(&self, bytes: usize) -> bool {
        self.focus().is_some_and(|c| c.bytes() != bytes)
    }

    /// True when any replica is unlinked.
    pub fn is_unlinked(&self) -> bool {
        self.chains()
            .iter()
            .flatten()
            .any(|c| c.flags().contains(ChainFlags::UNLINKED))
    }

    /// Sets chain flags on every replica.
    pub fn set_chain_flags(&self, flags: ChainFlags) {
        for chain in self.chains().iter().flatten() {
            chain.set_flags(flags);
        }
    }

    /// Clears chain flags on every replica.
    pub fn clear_chain_flags(&self, flags: ChainFlags) {
        for chain in self.chains().iter().flatten() {
            chain.clear_flags(flags);
        }
    }

    /// Flags every replica (and its ancestors) as needing a flush.
    pub fn setflush(&self) {
        for chain in self.chains().iter().flatten() {
            chain.setflush();
        }
    }

    /// Changes the check method on every replica. The cluster must be
    /// modified.
    pub fn set_check_method(&self, method: CheckMethod) {
        for chain in self.chains().iter().flatten() {
            chain.set_check_method(method);
        }
    }
}
