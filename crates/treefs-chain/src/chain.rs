//! Per-replica tree nodes ("chains").
//!
//! A chain is one replica's in-memory view of one tree position. Chains are
//! shared as [`ChainRef`] (`Arc<Chain>`); the parent link is a `Weak`
//! back-reference and a parent owns its children through a key-ordered
//! index. Children that exist only in the parent's on-media block table are
//! instantiated on demand by [`Chain::lookup`], with their data unresolved
//! until a resolving lock or load.
//!
//! Besides the `Arc`, each chain carries an explicit logical reference count
//! (`refs`) and a re-entrant lock that can be held across calls, mirroring
//! the ref/lock discipline the cluster layer relies on.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bref::{decode_table, encode_table, table_capacity, BlockRef, BrefType, CheckMethod, Key};
use crate::device::DeviceRef;
use crate::error::{ChainError, ChainResult};
use crate::media;
use crate::trans::Trans;

/// Shared handle to a chain.
pub type ChainRef = Arc<Chain>;

/// Largest radix accepted by [`Chain::resize`].
pub const MAX_RADIX: u8 = 30;

crate::flag_set! {
    /// State bits of a chain.
    pub struct ChainFlags {
        /// Payload modified since the last flush.
        const MODIFIED = 0x0001;
        /// Removed from its parent (pending flush).
        const DELETED = 0x0002;
        /// The inode has been unlinked from the namespace.
        const UNLINKED = 0x0004;
        /// Freshly created; the payload is zero-filled and never read from media.
        const INITIAL = 0x0008;
        /// This chain or something beneath it needs flushing.
        const UPDATE = 0x0010;
        /// Root of a PFS within the super-root.
        const PFSBOUNDARY = 0x0020;
    }
}

crate::flag_set! {
    /// How [`Chain::lock`] resolves data and accounts references.
    pub struct ResolveFlags {
        /// Never load data.
        const NEVER = 0x0001;
        /// Load data for meta-data node types only.
        const MAYBE = 0x0002;
        /// Always load data.
        const ALWAYS = 0x0004;
        /// Shared intent (currently served by the exclusive lock).
        const SHARED = 0x0010;
        /// Do not add a reference; the caller already holds one.
        const NOREF = 0x0020;
    }
}

crate::flag_set! {
    /// Modifiers for lookup and iteration.
    pub struct LookupFlags {
        /// Do not load data of returned chains.
        const NODATA = 0x0001;
        /// Return referenced but unlocked chains.
        const NOLOCK = 0x0002;
        /// Lock returned chains with shared intent.
        const SHARED = 0x0004;
        /// Load data of returned chains regardless of type.
        const ALWAYS = 0x0008;
    }
}

impl LookupFlags {
    /// Lock mode used for chains returned by a lookup.
    pub fn resolve_flags(&self) -> ResolveFlags {
        let mut how = if self.contains(LookupFlags::NODATA) {
            ResolveFlags::NEVER
        } else if self.contains(LookupFlags::ALWAYS) {
            ResolveFlags::ALWAYS
        } else {
            ResolveFlags::MAYBE
        };
        if self.contains(LookupFlags::SHARED) {
            how |= ResolveFlags::SHARED;
        }
        how
    }
}

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Re-entrant per-chain lock that can be held across calls.
#[derive(Default)]
struct ChainLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl ChainLock {
    fn acquire(&self) {
        let me = std::thread::current().id();
        let mut st = self.state.lock();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    return;
                }
                Some(_) => self.cond.wait(&mut st),
            }
        }
    }

    fn release(&self) -> bool {
        let mut st = self.state.lock();
        if st.depth == 0 {
            return false;
        }
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            drop(st);
            self.cond.notify_all();
        }
        true
    }

    fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

struct ChildEntry {
    key: Key,
    key_end: Key,
    chain: ChainRef,
}

impl ChildEntry {
    fn new(chain: ChainRef) -> Self {
        let bref = chain.bref();
        Self {
            key: bref.key,
            key_end: bref.key_end(),
            chain,
        }
    }
}

struct ChainCore {
    bref: BlockRef,
    flags: ChainFlags,
    data: Option<Vec<u8>>,
    parent: Weak<Chain>,
    children: Vec<ChildEntry>,
}

impl ChainCore {
    fn table_capacity(&self) -> usize {
        match &self.data {
            Some(data) => media::block_table(self.bref.bref_type, data)
                .map(|t| table_capacity(t.len()))
                .unwrap_or(0),
            None => match self.bref.bref_type {
                BrefType::Inode => table_capacity(media::INODE_UNION_BYTES),
                t if t.has_block_table() => table_capacity(self.bref.bytes as usize),
                _ => 0,
            },
        }
    }

    fn live_children(&self) -> usize {
        self.children
            .iter()
            .filter(|e| !e.chain.flags().contains(ChainFlags::DELETED))
            .count()
    }

    fn collides(&self, key: Key, key_end: Key, except: Option<&ChainRef>) -> bool {
        self.children.iter().any(|e| {
            e.key <= key_end
                && e.key_end >= key
                && !except.is_some_and(|c| Arc::ptr_eq(c, &e.chain))
                && !e.chain.flags().contains(ChainFlags::DELETED)
        })
    }

    /// Inserts in key order, replacing a deleted entry at the same key.
    fn insert_child(&mut self, entry: ChildEntry) {
        if let Some(pos) = self.children.iter().position(|e| {
            e.key == entry.key && e.chain.flags().contains(ChainFlags::DELETED)
        }) {
            self.children[pos] = entry;
            return;
        }
        let pos = self.children.partition_point(|e| e.key <= entry.key);
        self.children.insert(pos, entry);
    }
}

/// One replica's tree node.
pub struct Chain {
    id: u64,
    device: Option<DeviceRef>,
    refs: AtomicU32,
    lock: ChainLock,
    core: Mutex<ChainCore>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("type", &core.bref.bref_type)
            .field("key", &format_args!("{:#x}", core.bref.key))
            .field("keybits", &core.bref.keybits)
            .field("bytes", &core.bref.bytes)
            .field("flags", &core.flags)
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl Chain {
    fn alloc(
        device: Option<DeviceRef>,
        bref: BlockRef,
        flags: ChainFlags,
        data: Option<Vec<u8>>,
        parent: Weak<Chain>,
    ) -> ChainRef {
        Arc::new(Self {
            id: NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed),
            device,
            refs: AtomicU32::new(0),
            lock: ChainLock::default(),
            core: Mutex::new(ChainCore {
                bref,
                flags,
                data,
                parent,
                children: Vec::new(),
            }),
        })
    }

    /// Creates a fresh, parentless root chain (typically a volume header)
    /// covering the whole key space.
    pub fn new_root(device: Option<DeviceRef>, bref_type: BrefType, bytes: usize) -> ChainRef {
        let mut bref = BlockRef::new(bref_type, 0, 64);
        bref.bytes = bytes as u32;
        Self::alloc(
            device,
            bref,
            ChainFlags::MODIFIED | ChainFlags::INITIAL | ChainFlags::UPDATE,
            Some(vec![0u8; bytes]),
            Weak::new(),
        )
    }

    /// Instantiates a parentless root chain from a flushed block reference.
    /// Its data is resolved from `device` on first use.
    pub fn from_media(device: DeviceRef, bref: BlockRef) -> ChainRef {
        Self::alloc(Some(device), bref, ChainFlags::empty(), None, Weak::new())
    }

    fn tombstone(device: Option<DeviceRef>, bref: BlockRef, parent: Weak<Chain>) -> ChainRef {
        Self::alloc(device, bref, ChainFlags::DELETED, None, parent)
    }

    /// Unique identifier (diagnostics only).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Backing device, if any.
    pub fn device(&self) -> Option<&DeviceRef> {
        self.device.as_ref()
    }

    /// Copy of the block reference.
    pub fn bref(&self) -> BlockRef {
        self.core.lock().bref
    }

    /// Node type.
    pub fn bref_type(&self) -> BrefType {
        self.core.lock().bref.bref_type
    }

    /// Payload size in bytes.
    pub fn bytes(&self) -> usize {
        self.core.lock().bref.bytes as usize
    }

    /// Current state bits.
    pub fn flags(&self) -> ChainFlags {
        self.core.lock().flags
    }

    /// Sets state bits.
    pub fn set_flags(&self, flags: ChainFlags) {
        self.core.lock().flags.insert(flags);
    }

    /// Clears state bits.
    pub fn clear_flags(&self, flags: ChainFlags) {
        self.core.lock().flags.remove(flags);
    }

    /// Sets `BREF_FLAG_*` bits in the block reference.
    pub fn set_bref_flags(&self, bits: u8) {
        self.core.lock().bref.flags |= bits;
    }

    /// Changes the check method. The chain must be modified.
    pub fn set_check_method(&self, method: CheckMethod) {
        let mut core = self.core.lock();
        assert!(
            core.flags.contains(ChainFlags::MODIFIED),
            "set_check_method: chain {} not modified",
            self.id
        );
        core.bref.set_check_method(method);
    }

    /// Current parent, if still alive.
    pub fn parent(&self) -> Option<ChainRef> {
        self.core.lock().parent.upgrade()
    }

    /// Logical reference count.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Adds a logical reference.
    pub fn increment_ref(&self) {
        let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(chain = self.id, refs, "chain ref");
    }

    /// Drops a logical reference; returns the new count.
    pub fn decrement_ref(&self) -> u32 {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
        {
            Ok(prev) => {
                trace!(chain = self.id, refs = prev - 1, "chain drop");
                prev - 1
            }
            Err(_) => {
                warn!(chain = self.id, "chain reference underflow");
                debug_assert!(false, "chain {} reference underflow", self.id);
                0
            }
        }
    }

    /// True while some thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Locks the chain, adding a reference unless `NOREF` is given, and
    /// resolves data according to `how`. On failure the lock and the
    /// reference are undone.
    pub fn lock(&self, how: ResolveFlags) -> ChainResult<()> {
        let add_ref = !how.contains(ResolveFlags::NOREF);
        if add_ref {
            self.increment_ref();
        }
        self.lock.acquire();

        let resolve = if how.contains(ResolveFlags::ALWAYS) {
            true
        } else if how.contains(ResolveFlags::MAYBE) {
            self.bref_type() != BrefType::Data
        } else {
            false
        };
        if resolve {
            if let Err(e) = self.resolve_data() {
                debug!(chain = self.id, error = %e, "lock: data resolve failed");
                self.lock.release();
                if add_ref {
                    self.decrement_ref();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Releases one lock level and the reference that came with it.
    pub fn unlock(&self) {
        if !self.lock.release() {
            warn!(chain = self.id, "unlock of unlocked chain");
            return;
        }
        self.decrement_ref();
    }

    /// True when the payload is resident.
    pub fn is_resident(&self) -> bool {
        self.core.lock().data.is_some()
    }

    /// Makes the payload resident, reading it from the device if needed.
    pub fn resolve_data(&self) -> ChainResult<()> {
        let (bref, flags) = {
            let mut core = self.core.lock();
            if core.data.is_some() {
                return Ok(());
            }
            if core.flags.contains(ChainFlags::INITIAL) || !core.bref.is_placed() {
                let bytes = core.bref.bytes as usize;
                core.data = Some(vec![0u8; bytes]);
                return Ok(());
            }
            (core.bref, core.flags)
        };
        let device = self
            .device
            .as_ref()
            .ok_or(ChainError::NoDevice { chain_id: self.id })?;
        trace!(chain = self.id, data_off = bref.data_off, flags = ?flags, "resolve read");
        let data = device.read(bref.data_off, bref.bytes as usize)?;
        self.install_data(data)
    }

    /// Resolves the payload, completing through `done` exactly once: inline
    /// when no I/O is needed, otherwise on the device's completion thread.
    pub fn resolve_async<F>(self: &Arc<Self>, done: F)
    where
        F: FnOnce(ChainResult<()>) + Send + 'static,
    {
        let (bref, resident, initial) = {
            let core = self.core.lock();
            (
                core.bref,
                core.data.is_some(),
                core.flags.contains(ChainFlags::INITIAL),
            )
        };
        if resident || initial || !bref.is_placed() {
            done(self.resolve_data());
            return;
        }
        let Some(device) = self.device.clone() else {
            done(Err(ChainError::NoDevice { chain_id: self.id }));
            return;
        };
        let chain = Arc::clone(self);
        device.getblk(
            bref.data_off,
            bref.bytes as usize,
            Box::new(move |res| done(res.and_then(|data| chain.install_data(data)))),
        );
    }

    fn install_data(&self, data: Vec<u8>) -> ChainResult<()> {
        let mut core = self.core.lock();
        if core.bref.check_method() == CheckMethod::Crc32 {
            let actual = crc32fast::hash(&data);
            if actual != core.bref.check {
                return Err(ChainError::CheckFailed {
                    key: core.bref.key,
                    expected: core.bref.check,
                    actual,
                });
            }
        }
        if core.data.is_none() {
            core.data = Some(data);
        }
        Ok(())
    }

    /// Drops a clean, placed payload so the next access reads it back from
    /// the device. Returns false when the payload cannot be evicted.
    pub fn evict_data(&self) -> bool {
        let mut core = self.core.lock();
        if core
            .flags
            .intersects(ChainFlags::MODIFIED | ChainFlags::INITIAL)
            || !core.bref.is_placed()
        {
            return false;
        }
        core.data = None;
        true
    }

    /// Runs `f` over the resident payload.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> ChainResult<R> {
        let core = self.core.lock();
        match core.data.as_deref() {
            Some(data) => Ok(f(data)),
            None => Err(ChainError::NotResolved { chain_id: self.id }),
        }
    }

    /// Runs `f` over the resident payload, mutably.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> ChainResult<R> {
        let mut core = self.core.lock();
        match core.data.as_deref_mut() {
            Some(data) => Ok(f(data)),
            None => Err(ChainError::NotResolved { chain_id: self.id }),
        }
    }

    /// Keys of the live (non-deleted) in-memory children, in order.
    pub fn child_keys(&self) -> Vec<Key> {
        self.core
            .lock()
            .children
            .iter()
            .filter(|e| !e.chain.flags().contains(ChainFlags::DELETED))
            .map(|e| e.key)
            .collect()
    }

    /// Flags this chain and every ancestor as needing a flush.
    pub fn setflush(&self) {
        let mut cur = {
            let mut core = self.core.lock();
            core.flags.insert(ChainFlags::UPDATE);
            core.parent.upgrade()
        };
        while let Some(chain) = cur {
            let mut core = chain.core.lock();
            if core.flags.contains(ChainFlags::UPDATE) {
                break;
            }
            core.flags.insert(ChainFlags::UPDATE);
            cur = core.parent.upgrade();
        }
    }

    /// Instantiates children referenced by the on-media block table that are
    /// not yet in memory.
    fn load_children(parent: &ChainRef, core: &mut ChainCore) -> ChainResult<()> {
        let entries = {
            let Some(data) = core.data.as_deref() else {
                return Ok(());
            };
            let Some(table) = media::block_table(core.bref.bref_type, data) else {
                return Ok(());
            };
            decode_table(table)?
        };
        for (_, bref) in entries {
            if let Err(pos) = core.children.binary_search_by_key(&bref.key, |e| e.key) {
                let child = Chain::alloc(
                    parent.device.clone(),
                    bref,
                    ChainFlags::empty(),
                    None,
                    Arc::downgrade(parent),
                );
                trace!(parent = parent.id, key = bref.key, "instantiated child from block table");
                core.children.insert(pos, ChildEntry::new(child));
            }
        }
        Ok(())
    }

    fn find_child(
        core: &ChainCore,
        key_beg: Key,
        key_end: Key,
        cache_index: &mut usize,
    ) -> Option<ChainRef> {
        let children = &core.children;
        let mut i = *cache_index;
        if i >= children.len() || children[i].key > key_beg {
            i = children
                .partition_point(|e| e.key <= key_beg)
                .saturating_sub(1);
        }
        while i < children.len() {
            let e = &children[i];
            if e.key > key_end {
                break;
            }
            if e.key_end >= key_beg && !e.chain.flags().contains(ChainFlags::DELETED) {
                *cache_index = i;
                return Some(Arc::clone(&e.chain));
            }
            i += 1;
        }
        None
    }

    /// Finds the first live child overlapping `[key_beg, key_end]`.
    ///
    /// `key_next` is set to the key following the returned chain's range (0
    /// when that range reaches the end of the key space), or to
    /// `key_end + 1` when nothing is found. The returned chain is locked and
    /// referenced, or only referenced with `NOLOCK`.
    pub fn lookup(
        parent: &ChainRef,
        key_next: &mut Key,
        key_beg: Key,
        key_end: Key,
        cache_index: &mut usize,
        flags: LookupFlags,
    ) -> ChainResult<Option<ChainRef>> {
        *key_next = key_end.wrapping_add(1);
        if key_beg > key_end {
            return Ok(None);
        }
        let found = {
            let mut core = parent.core.lock();
            Chain::load_children(parent, &mut core)?;
            Chain::find_child(&core, key_beg, key_end, cache_index)
        };
        let Some(chain) = found else {
            return Ok(None);
        };
        *key_next = chain.bref().key_after();
        if flags.contains(LookupFlags::NOLOCK) {
            chain.increment_ref();
        } else {
            chain.lock(flags.resolve_flags())?;
        }
        Ok(Some(chain))
    }

    /// Releases `chain` (as returned by a lookup with the same `flags`) and
    /// finds the next live child after it within `[key_beg, key_end]`.
    pub fn next(
        parent: &ChainRef,
        chain: ChainRef,
        key_next: &mut Key,
        key_beg: Key,
        key_end: Key,
        cache_index: &mut usize,
        flags: LookupFlags,
    ) -> ChainResult<Option<ChainRef>> {
        let after = chain.bref().key_after();
        if flags.contains(LookupFlags::NOLOCK) {
            chain.decrement_ref();
        } else {
            chain.unlock();
        }
        if after == 0 {
            *key_next = 0;
            return Ok(None);
        }
        Chain::lookup(
            parent,
            key_next,
            key_beg.max(after),
            key_end,
            cache_index,
            flags,
        )
    }

    /// Creates a new child under `parent`. The returned chain is locked,
    /// referenced, modified and zero-filled.
    pub fn create(
        trans: &Trans,
        parent: &ChainRef,
        key: Key,
        keybits: u8,
        bref_type: BrefType,
        bytes: usize,
        bref_flags: u8,
    ) -> ChainResult<ChainRef> {
        if bref_type == BrefType::Empty {
            return Err(ChainError::InvalidArgument {
                reason: "cannot create an empty block reference".to_string(),
            });
        }
        let bytes32 = u32::try_from(bytes).map_err(|_| ChainError::InvalidArgument {
            reason: format!("chain size {} too large", bytes),
        })?;
        let mut bref = BlockRef::new(bref_type, key, keybits);
        bref.bytes = bytes32;
        bref.flags = bref_flags;
        bref.modify_tid = trans.sync_tid;

        let chain = {
            let mut core = parent.core.lock();
            if !core.bref.bref_type.is_parent_type() {
                return Err(ChainError::NotAParent {
                    chain_id: parent.id,
                    bref_type: core.bref.bref_type.name(),
                });
            }
            if core.flags.contains(ChainFlags::DELETED) {
                return Err(ChainError::ParentDeleted {
                    chain_id: parent.id,
                });
            }
            Chain::load_children(parent, &mut core)?;
            if core.collides(key, bref.key_end(), None) {
                return Err(ChainError::KeyExists { key });
            }
            let capacity = core.table_capacity();
            if core.live_children() + 1 > capacity {
                return Err(ChainError::BlockTableFull {
                    key: core.bref.key,
                    capacity,
                });
            }
            let chain = Chain::alloc(
                parent.device.clone(),
                bref,
                ChainFlags::MODIFIED | ChainFlags::INITIAL | ChainFlags::UPDATE,
                Some(vec![0u8; bytes]),
                Arc::downgrade(parent),
            );
            core.insert_child(ChildEntry::new(Arc::clone(&chain)));
            chain
        };
        parent.setflush();
        chain.lock(ResolveFlags::NEVER)?;
        debug!(
            parent = parent.id,
            chain = chain.id,
            key = %format_args!("{:#x}", key),
            bref_type = %bref_type,
            bytes,
            "chain created"
        );
        Ok(chain)
    }

    /// Moves `chain` under `parent`, optionally changing its key and keybits.
    /// The old position is shadowed until the old parent is flushed.
    pub fn rename(
        trans: &Trans,
        new_key: Option<(Key, u8)>,
        parent: &ChainRef,
        chain: &ChainRef,
    ) -> ChainResult<()> {
        if Arc::ptr_eq(parent, chain) {
            return Err(ChainError::InvalidArgument {
                reason: "cannot rename a chain under itself".to_string(),
            });
        }
        let mut bref = chain.bref();
        if let Some((key, keybits)) = new_key {
            bref.key = key;
            bref.keybits = keybits;
        }
        let old_parent = chain.parent();
        let already_child = old_parent.as_ref().is_some_and(|p| Arc::ptr_eq(p, parent));

        {
            let mut core = parent.core.lock();
            if !core.bref.bref_type.is_parent_type() {
                return Err(ChainError::NotAParent {
                    chain_id: parent.id,
                    bref_type: core.bref.bref_type.name(),
                });
            }
            if core.flags.contains(ChainFlags::DELETED) {
                return Err(ChainError::ParentDeleted {
                    chain_id: parent.id,
                });
            }
            Chain::load_children(parent, &mut core)?;
            if core.collides(bref.key, bref.key_end(), Some(chain)) {
                return Err(ChainError::KeyExists { key: bref.key });
            }
            let capacity = core.table_capacity();
            if !already_child && core.live_children() + 1 > capacity {
                return Err(ChainError::BlockTableFull {
                    key: core.bref.key,
                    capacity,
                });
            }
        }

        if let Some(old) = &old_parent {
            let mut core = old.core.lock();
            if let Some(pos) = core
                .children
                .iter()
                .position(|e| Arc::ptr_eq(&e.chain, chain))
            {
                let old_bref = core.children[pos].chain.bref();
                let tomb = Chain::tombstone(old.device.clone(), old_bref, Arc::downgrade(old));
                core.children[pos] = ChildEntry::new(tomb);
            }
            drop(core);
            old.setflush();
        }

        {
            let mut core = chain.core.lock();
            core.bref.key = bref.key;
            core.bref.keybits = bref.keybits;
            core.bref.modify_tid = trans.sync_tid;
            core.parent = Arc::downgrade(parent);
            core.flags.remove(ChainFlags::DELETED);
        }
        parent.core.lock().insert_child(ChildEntry::new(Arc::clone(chain)));
        chain.setflush();
        debug!(
            parent = parent.id,
            chain = chain.id,
            key = %format_args!("{:#x}", bref.key),
            "chain renamed"
        );
        Ok(())
    }

    /// Marks `chain` deleted under `parent`. The entry is removed from the
    /// parent's block table by the next flush.
    pub fn delete(trans: &Trans, parent: &ChainRef, chain: &ChainRef) -> ChainResult<()> {
        match chain.parent() {
            Some(p) if Arc::ptr_eq(&p, parent) => {}
            _ => {
                return Err(ChainError::InvalidArgument {
                    reason: format!("chain {} is not a child of {}", chain.id, parent.id),
                })
            }
        }
        {
            let mut core = chain.core.lock();
            if core.flags.contains(ChainFlags::DELETED) {
                return Ok(());
            }
            core.flags.insert(ChainFlags::DELETED);
            core.bref.modify_tid = trans.sync_tid;
        }
        parent.setflush();
        debug!(parent = parent.id, chain = chain.id, "chain deleted");
        Ok(())
    }

    /// Resizes a data chain's payload to `1 << nradix` bytes, preserving the
    /// leading bytes.
    pub fn resize(trans: &Trans, parent: &ChainRef, chain: &ChainRef, nradix: u8) -> ChainResult<()> {
        if nradix > MAX_RADIX {
            return Err(ChainError::InvalidArgument {
                reason: format!("radix {} out of range", nradix),
            });
        }
        if chain.bref_type() != BrefType::Data {
            return Err(ChainError::InvalidArgument {
                reason: format!("cannot resize {} chain", chain.bref_type()),
            });
        }
        if !chain.parent().is_some_and(|p| Arc::ptr_eq(&p, parent)) {
            return Err(ChainError::InvalidArgument {
                reason: format!("chain {} is not a child of {}", chain.id, parent.id),
            });
        }
        chain.resolve_data()?;
        let nbytes = 1usize << nradix;
        {
            let mut core = chain.core.lock();
            if core.bref.bytes as usize == nbytes {
                return Ok(());
            }
            if let Some(data) = core.data.as_mut() {
                data.resize(nbytes, 0);
            }
            core.bref.bytes = nbytes as u32;
            core.bref.modify_tid = trans.sync_tid;
            core.flags.insert(ChainFlags::MODIFIED | ChainFlags::UPDATE);
        }
        chain.setflush();
        debug!(chain = chain.id, nbytes, "chain resized");
        Ok(())
    }

    /// Marks the chain modified in place, resolving its payload first.
    pub fn modify(&self, trans: &Trans) -> ChainResult<()> {
        self.resolve_data()?;
        {
            let mut core = self.core.lock();
            core.flags.insert(ChainFlags::MODIFIED | ChainFlags::UPDATE);
            core.bref.modify_tid = trans.sync_tid;
        }
        self.setflush();
        Ok(())
    }

    /// In-memory children, live or deleted.
    pub(crate) fn child_chains(&self) -> Vec<ChainRef> {
        self.core
            .lock()
            .children
            .iter()
            .map(|e| Arc::clone(&e.chain))
            .collect()
    }

    /// Drops deleted children and re-encodes the block table from the live
    /// ones, including entries not yet instantiated in memory. Returns the
    /// number of children dropped.
    pub(crate) fn sync_block_table(chain: &ChainRef) -> ChainResult<u64> {
        let mut core = chain.core.lock();
        Chain::load_children(chain, &mut core)?;
        let before = core.children.len();
        core.children
            .retain(|e| !e.chain.flags().contains(ChainFlags::DELETED));
        let removed = (before - core.children.len()) as u64;

        let bref_type = core.bref.bref_type;
        let key = core.bref.key;
        if !bref_type.has_block_table() {
            return Ok(removed);
        }
        let brefs: Vec<BlockRef> = core.children.iter().map(|e| e.chain.bref()).collect();
        if let Some(table) = core
            .data
            .as_deref_mut()
            .and_then(|data| media::block_table_mut(bref_type, data))
        {
            encode_table(&brefs, table, key)?;
        }
        Ok(removed)
    }

    /// Writes the payload to a fresh device location when it changed and
    /// stamps the flush transaction. Returns the number of bytes written.
    pub(crate) fn write_out(&self, trans: &Trans) -> ChainResult<u64> {
        let mut core = self.core.lock();
        let needs_write = core.flags.contains(ChainFlags::MODIFIED)
            || (core.bref.bref_type.has_block_table() && core.flags.contains(ChainFlags::UPDATE));
        let mut written = 0;
        if needs_write {
            if let (Some(device), Some(data)) = (&self.device, core.data.as_deref()) {
                let data_off = device.alloc(data.len())?;
                let check = crc32fast::hash(data);
                device.write(data_off, data)?;
                written = data.len() as u64;
                core.bref.data_off = data_off;
                if core.bref.check_method() == CheckMethod::Crc32 {
                    core.bref.check = check;
                }
            }
        }
        core.bref.mirror_tid = trans.sync_tid;
        core.flags
            .remove(ChainFlags::MODIFIED | ChainFlags::UPDATE | ChainFlags::INITIAL);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::trans::TidAllocator;

    fn make_root() -> (ChainRef, TidAllocator) {
        let dev = Device::new(DeviceConfig::named("t0")).unwrap();
        let root = Chain::new_root(Some(dev), BrefType::Volume, 4096);
        (root, TidAllocator::default())
    }

    fn create_data(trans: &Trans, parent: &ChainRef, key: Key) -> ChainRef {
        Chain::create(trans, parent, key, 0, BrefType::Data, 16, 0).unwrap()
    }

    #[test]
    fn test_lock_adds_and_unlock_drops_ref() {
        let (root, _) = make_root();
        assert_eq!(root.refs(), 0);
        root.lock(ResolveFlags::ALWAYS).unwrap();
        assert!(root.is_locked());
        assert_eq!(root.refs(), 1);
        root.unlock();
        assert!(!root.is_locked());
        assert_eq!(root.refs(), 0);
    }

    #[test]
    fn test_lock_noref() {
        let (root, _) = make_root();
        root.increment_ref();
        root.lock(ResolveFlags::NEVER | ResolveFlags::NOREF).unwrap();
        assert_eq!(root.refs(), 1);
        root.unlock();
        assert_eq!(root.refs(), 0);
    }

    #[test]
    fn test_lock_is_reentrant_per_thread() {
        let (root, _) = make_root();
        root.lock(ResolveFlags::NEVER).unwrap();
        root.lock(ResolveFlags::NEVER).unwrap();
        root.unlock();
        assert!(root.is_locked());
        root.unlock();
        assert!(!root.is_locked());
    }

    #[test]
    fn test_lock_blocks_other_thread() {
        let (root, _) = make_root();
        root.lock(ResolveFlags::NEVER).unwrap();
        let other = Arc::clone(&root);
        let handle = std::thread::spawn(move || {
            other.lock(ResolveFlags::NEVER).unwrap();
            other.unlock();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        root.unlock();
        handle.join().unwrap();
        assert_eq!(root.refs(), 0);
    }

    #[test]
    fn test_create_lookup_next() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        for key in [9u64, 1, 5] {
            create_data(&trans, &root, key).unlock();
        }
        assert_eq!(root.child_keys(), vec![1, 5, 9]);

        let mut cache = 0;
        let mut key_next = 0;
        let mut seen = Vec::new();
        let mut cur = Chain::lookup(&root, &mut key_next, 0, u64::MAX, &mut cache, LookupFlags::empty()).unwrap();
        while let Some(chain) = cur {
            seen.push(chain.bref().key);
            assert!(chain.is_locked());
            cur = Chain::next(&root, chain, &mut key_next, 0, u64::MAX, &mut cache, LookupFlags::empty()).unwrap();
        }
        assert_eq!(seen, vec![1, 5, 9]);
    }

    #[test]
    fn test_lookup_key_next() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        create_data(&trans, &root, 4).unlock();

        let mut cache = 0;
        let mut key_next = 0;
        let chain = Chain::lookup(&root, &mut key_next, 0, 100, &mut cache, LookupFlags::NOLOCK)
            .unwrap()
            .unwrap();
        assert_eq!(key_next, 5);
        assert!(!chain.is_locked());
        assert_eq!(chain.refs(), 1);
        chain.decrement_ref();

        let none = Chain::lookup(&root, &mut key_next, 5, 100, &mut cache, LookupFlags::empty()).unwrap();
        assert!(none.is_none());
        assert_eq!(key_next, 101);
    }

    #[test]
    fn test_create_duplicate_key() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        create_data(&trans, &root, 3).unlock();
        assert!(matches!(
            Chain::create(&trans, &root, 3, 0, BrefType::Data, 16, 0),
            Err(ChainError::KeyExists { key: 3 })
        ));
    }

    #[test]
    fn test_create_under_data_rejected() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let data = create_data(&trans, &root, 3);
        assert!(matches!(
            Chain::create(&trans, &data, 1, 0, BrefType::Data, 16, 0),
            Err(ChainError::NotAParent { .. })
        ));
    }

    #[test]
    fn test_inode_blockset_capacity() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let ip = Chain::create(&trans, &root, 1, 0, BrefType::Inode, media::INODE_BYTES, 0).unwrap();
        let capacity = table_capacity(media::INODE_UNION_BYTES);
        for key in 0..capacity as u64 {
            create_data(&trans, &ip, key).unlock();
        }
        assert!(matches!(
            Chain::create(&trans, &ip, 100, 0, BrefType::Data, 16, 0),
            Err(ChainError::BlockTableFull { .. })
        ));
    }

    #[test]
    fn test_delete_hides_and_allows_recreate() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let chain = create_data(&trans, &root, 7);
        Chain::delete(&trans, &root, &chain).unwrap();
        assert!(chain.flags().contains(ChainFlags::DELETED));
        assert!(root.child_keys().is_empty());
        chain.unlock();

        let again = create_data(&trans, &root, 7);
        assert_eq!(root.child_keys(), vec![7]);
        again.unlock();
    }

    #[test]
    fn test_delete_wrong_parent() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let a = Chain::create(&trans, &root, 1, 0, BrefType::Indirect, 1024, 0).unwrap();
        let b = create_data(&trans, &root, 2);
        assert!(Chain::delete(&trans, &a, &b).is_err());
        assert!(!b.flags().contains(ChainFlags::DELETED));
    }

    #[test]
    fn test_rename_moves_between_parents() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let dir = Chain::create(&trans, &root, 1, 0, BrefType::Indirect, 1024, 0).unwrap();
        let chain = create_data(&trans, &root, 2);

        Chain::rename(&trans, Some((0x20, 0)), &dir, &chain).unwrap();
        assert_eq!(root.child_keys(), vec![1]);
        assert_eq!(dir.child_keys(), vec![0x20]);
        assert!(Arc::ptr_eq(&chain.parent().unwrap(), &dir));
        assert_eq!(chain.bref().key, 0x20);
    }

    #[test]
    fn test_resize_keeps_prefix() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let chain = create_data(&trans, &root, 2);
        chain.with_data_mut(|d| d[..4].copy_from_slice(b"abcd")).unwrap();
        Chain::resize(&trans, &root, &chain, 10).unwrap();
        assert_eq!(chain.bytes(), 1024);
        chain.with_data(|d| assert_eq!(&d[..4], b"abcd")).unwrap();
        Chain::resize(&trans, &root, &chain, 1).unwrap();
        chain.with_data(|d| assert_eq!(d, b"ab")).unwrap();
    }

    #[test]
    fn test_resolve_failure_undoes_lock() {
        let (root, tids) = make_root();
        let trans = Trans::begin(&tids);
        let chain = create_data(&trans, &root, 2);
        chain.unlock();
        crate::flush::flush(&trans, &root).unwrap();
        assert!(chain.evict_data());

        let dev = chain.device().unwrap().clone();
        dev.set_fail_reads(true);
        assert!(chain.lock(ResolveFlags::ALWAYS).is_err());
        assert!(!chain.is_locked());
        assert_eq!(chain.refs(), 0);

        dev.set_fail_reads(false);
        chain.lock(ResolveFlags::ALWAYS).unwrap();
        assert!(chain.is_resident());
        chain.unlock();
    }

    #[test]
    fn test_lookup_flags_resolve_mode() {
        assert_eq!(LookupFlags::NODATA.resolve_flags(), ResolveFlags::NEVER);
        assert_eq!(LookupFlags::empty().resolve_flags(), ResolveFlags::MAYBE);
        assert_eq!(
            (LookupFlags::ALWAYS | LookupFlags::SHARED).resolve_flags(),
            ResolveFlags::ALWAYS | ResolveFlags::SHARED
        );
    }
}
