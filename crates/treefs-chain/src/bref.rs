//! Block references: the (type, key, keybits) identity of a tree position
//! and the replica-local physical placement of its data.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};

/// Logical key within a parent's key space.
pub type Key = u64;

/// Largest key.
pub const KEY_MAX: Key = u64::MAX;

/// Low bits of `data_off` holding the allocation radix.
pub const OFF_MASK_RADIX: u64 = 0x3f;

/// Size of one encoded block table entry.
pub const BREF_ENCODED_SIZE: usize = 64;

/// The chain is the root of a PFS (set on snapshot roots).
pub const BREF_FLAG_PFSROOT: u8 = 0x01;

/// Type of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum BrefType {
    /// Unused block table entry.
    #[default]
    Empty = 0,
    /// Inode (directory entry and file metadata, embedded blockset).
    Inode = 1,
    /// Indirect block: a block table of child references.
    Indirect = 2,
    /// Raw file data.
    Data = 3,
    /// Freemap interior node.
    FreemapNode = 4,
    /// Freemap leaf.
    FreemapLeaf = 5,
    /// Volume header.
    Volume = 6,
    /// Freemap root.
    Freemap = 7,
}

impl BrefType {
    /// True for node types whose payload is (or embeds) a block table.
    ///
    /// Block tables hold replica-local child pointers and are never
    /// copied between replicas.
    pub fn has_block_table(&self) -> bool {
        !matches!(self, BrefType::Data | BrefType::Empty)
    }

    /// True for node types that can hold children at all.
    pub fn is_parent_type(&self) -> bool {
        self.has_block_table()
    }

    /// Static name for logging and errors.
    pub fn name(&self) -> &'static str {
        match self {
            BrefType::Empty => "empty",
            BrefType::Inode => "inode",
            BrefType::Indirect => "indirect",
            BrefType::Data => "data",
            BrefType::FreemapNode => "freemap_node",
            BrefType::FreemapLeaf => "freemap_leaf",
            BrefType::Volume => "volume",
            BrefType::Freemap => "freemap",
        }
    }
}

impl fmt::Display for BrefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integrity check method stored in the high nibble of `BlockRef::methods`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CheckMethod {
    /// No check.
    None = 0,
    /// CRC32 over the block payload.
    Crc32 = 1,
}

impl CheckMethod {
    fn from_nibble(v: u8) -> CheckMethod {
        match v {
            1 => CheckMethod::Crc32,
            _ => CheckMethod::None,
        }
    }
}

/// Reference to one tree node as stored in its parent's block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct BlockRef {
    /// Node type.
    pub bref_type: BrefType,
    /// Check method (high nibble) and compression method (low nibble).
    pub methods: u8,
    /// Number of low key bits covered by this reference.
    pub keybits: u8,
    /// `BREF_FLAG_*` bits.
    pub flags: u8,
    /// First key covered.
    pub key: Key,
    /// Logical payload size in bytes.
    pub bytes: u32,
    /// Device offset with the allocation radix in the low bits.
    pub data_off: u64,
    /// Transaction id of the last flush that reached this node.
    pub mirror_tid: u64,
    /// Transaction id of the last modification.
    pub modify_tid: u64,
    /// Check value computed at flush time.
    pub check: u32,
}

impl BlockRef {
    /// Creates an unplaced block reference.
    pub fn new(bref_type: BrefType, key: Key, keybits: u8) -> Self {
        Self {
            bref_type,
            key,
            keybits,
            ..Default::default()
        }
    }

    /// Last key covered by this reference.
    pub fn key_end(&self) -> Key {
        if self.keybits >= 64 {
            KEY_MAX
        } else {
            self.key | ((1u64 << self.keybits) - 1)
        }
    }

    /// True when `[key_beg, key_end]` overlaps this reference's key range.
    pub fn overlaps(&self, key_beg: Key, key_end: Key) -> bool {
        self.key <= key_end && self.key_end() >= key_beg
    }

    /// The key following this reference's range, or 0 if the range
    /// extends to `KEY_MAX`.
    pub fn key_after(&self) -> Key {
        self.key_end().wrapping_add(1)
    }

    /// Device offset with the radix stripped.
    pub fn offset(&self) -> u64 {
        self.data_off & !OFF_MASK_RADIX
    }

    /// Allocation radix encoded in `data_off`.
    pub fn radix(&self) -> u8 {
        (self.data_off & OFF_MASK_RADIX) as u8
    }

    /// True once the node has been placed on its device.
    pub fn is_placed(&self) -> bool {
        self.offset() != 0
    }

    /// Current check method.
    pub fn check_method(&self) -> CheckMethod {
        CheckMethod::from_nibble(self.methods >> 4)
    }

    /// Replaces the check method, keeping the compression nibble.
    pub fn set_check_method(&mut self, method: CheckMethod) {
        self.methods = (self.methods & 0x0f) | ((method as u8) << 4);
    }

    /// Encodes into a fixed-size block table slot.
    pub fn encode_into(&self, slot: &mut [u8]) -> ChainResult<()> {
        let raw = bincode::serialize(self)?;
        if raw.len() > slot.len() {
            return Err(ChainError::InvalidArgument {
                reason: format!("bref encoding {} exceeds slot {}", raw.len(), slot.len()),
            });
        }
        slot.fill(0);
        slot[..raw.len()].copy_from_slice(&raw);
        Ok(())
    }

    /// Decodes a fixed-size block table slot.
    pub fn decode_from(slot: &[u8]) -> ChainResult<Self> {
        Ok(bincode::deserialize(slot)?)
    }
}

/// Smallest radix whose power of two holds `bytes`.
pub fn bytes_to_radix(bytes: usize) -> u8 {
    if bytes <= 1 {
        0
    } else {
        bytes.next_power_of_two().trailing_zeros() as u8
    }
}

/// Number of block table entries a buffer of `len` bytes holds.
pub fn table_capacity(len: usize) -> usize {
    len / BREF_ENCODED_SIZE
}

/// Decodes every non-empty entry of a block table, with its slot index.
pub fn decode_table(buf: &[u8]) -> ChainResult<Vec<(usize, BlockRef)>> {
    let mut out = Vec::new();
    for (i, slot) in buf.chunks_exact(BREF_ENCODED_SIZE).enumerate() {
        if slot.iter().all(|b| *b == 0) {
            continue;
        }
        let bref = BlockRef::decode_from(slot)?;
        if bref.bref_type != BrefType::Empty {
            out.push((i, bref));
        }
    }
    Ok(out)
}

/// Rewrites a block table from `brefs`, zeroing unused slots.
pub fn encode_table(brefs: &[BlockRef], buf: &mut [u8], parent_key: Key) -> ChainResult<()> {
    let capacity = table_capacity(buf.len());
    if brefs.len() > capacity {
        return Err(ChainError::BlockTableFull {
            key: parent_key,
            capacity,
        });
    }
    buf.fill(0);
    for (bref, slot) in brefs.iter().zip(buf.chunks_exact_mut(BREF_ENCODED_SIZE)) {
        bref.encode_into(slot)?;
    }
    Ok(())
}

/// Directory hash of a name.
///
/// The high 32 bits hold a crc32 of the name; bit 31 is always set so hashed
/// keys never collide with the small reserved keys, and the low bits are
/// left free for collision iteration.
pub fn dirhash(name: &[u8]) -> Key {
    let crc = crc32fast::hash(name) as u64;
    (crc << 32) | DIRHASH_VISIBLE
}

/// Bit set in every directory hash key.
pub const DIRHASH_VISIBLE: Key = 0x8000_0000;

/// Mask of the collision-iteration bits of a directory hash key.
pub const DIRHASH_LOMASK: Key = 0x0000_7fff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_end_and_after() {
        let b = BlockRef::new(BrefType::Data, 0x100, 8);
        assert_eq!(b.key_end(), 0x1ff);
        assert_eq!(b.key_after(), 0x200);

        let all = BlockRef::new(BrefType::Indirect, 0, 64);
        assert_eq!(all.key_end(), KEY_MAX);
        assert_eq!(all.key_after(), 0);
    }

    #[test]
    fn test_overlaps() {
        let b = BlockRef::new(BrefType::Data, 16, 4);
        assert!(b.overlaps(0, 16));
        assert!(b.overlaps(31, 40));
        assert!(!b.overlaps(32, 40));
        assert!(!b.overlaps(0, 15));
    }

    #[test]
    fn test_offset_and_radix() {
        let mut b = BlockRef::new(BrefType::Data, 0, 0);
        assert!(!b.is_placed());
        b.data_off = 0x10000 | 10;
        assert_eq!(b.offset(), 0x10000);
        assert_eq!(b.radix(), 10);
        assert!(b.is_placed());
    }

    #[test]
    fn test_check_method_keeps_comp_nibble() {
        let mut b = BlockRef::new(BrefType::Data, 0, 0);
        b.methods = 0x03;
        b.set_check_method(CheckMethod::Crc32);
        assert_eq!(b.check_method(), CheckMethod::Crc32);
        assert_eq!(b.methods & 0x0f, 0x03);
        b.set_check_method(CheckMethod::None);
        assert_eq!(b.methods, 0x03);
    }

    #[test]
    fn test_bytes_to_radix() {
        assert_eq!(bytes_to_radix(0), 0);
        assert_eq!(bytes_to_radix(1), 0);
        assert_eq!(bytes_to_radix(3), 2);
        assert_eq!(bytes_to_radix(1024), 10);
        assert_eq!(bytes_to_radix(1025), 11);
    }

    #[test]
    fn test_table_encode_decode_skips_empty() {
        let mut buf = vec![0u8; BREF_ENCODED_SIZE * 4];
        let mut a = BlockRef::new(BrefType::Data, 5, 0);
        a.data_off = 0x400 | 10;
        let b = BlockRef::new(BrefType::Inode, 9, 0);
        encode_table(&[a, b], &mut buf, 0).unwrap();

        let decoded = decode_table(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], (0, a));
        assert_eq!(decoded[1], (1, b));
    }

    #[test]
    fn test_table_overflow() {
        let mut buf = vec![0u8; BREF_ENCODED_SIZE * 2];
        let brefs = vec![BlockRef::new(BrefType::Data, 1, 0); 3];
        match encode_table(&brefs, &mut buf, 0x42) {
            Err(ChainError::BlockTableFull { key, capacity }) => {
                assert_eq!(key, 0x42);
                assert_eq!(capacity, 2);
            }
            other => panic!("expected BlockTableFull, got {:?}", other),
        }
    }

    #[test]
    fn test_dirhash_visible_and_stable() {
        let a = dirhash(b"snap1");
        assert_eq!(a, dirhash(b"snap1"));
        assert_ne!(a, dirhash(b"snap2"));
        assert_eq!(a & DIRHASH_VISIBLE, DIRHASH_VISIBLE);
        assert_eq!(a & DIRHASH_LOMASK, 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", BrefType::FreemapLeaf), "freemap_leaf");
        assert!(BrefType::Inode.has_block_table());
        assert!(!BrefType::Data.has_block_table());
    }
}
