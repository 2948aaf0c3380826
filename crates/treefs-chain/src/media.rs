//! Media payload layouts.
//!
//! Every chain's payload is a raw byte buffer of exactly `bytes` bytes. Inode
//! payloads have a fixed layout: a bincode-encoded metadata area followed by a
//! union that holds either the embedded blockset (a small block table) or
//! file data stored directly in the inode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChainError, ChainResult};

/// Size of an inode payload.
pub const INODE_BYTES: usize = 1024;

/// Offset of the union area within an inode payload.
pub const INODE_UNION_OFFSET: usize = 512;

/// Size of the union area.
pub const INODE_UNION_BYTES: usize = INODE_BYTES - INODE_UNION_OFFSET;

/// Longest filename stored in an inode.
pub const INODE_MAXNAME: usize = 255;

/// The union holds file data rather than a blockset.
pub const OPFLAG_DIRECTDATA: u8 = 0x01;
/// The inode is the root of a PFS.
pub const OPFLAG_PFSROOT: u8 = 0x02;

/// Object type recorded in an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObjType {
    /// Not yet initialized.
    #[default]
    Unknown,
    /// Directory.
    Directory,
    /// Regular file.
    Regular,
    /// Symbolic link.
    Softlink,
}

/// Role of a PFS root inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PfsType {
    /// Not a PFS root.
    #[default]
    None,
    /// Writable master replica.
    Master,
    /// Read-only slave replica.
    Slave,
    /// Local cache.
    Cache,
    /// Frozen snapshot.
    Snapshot,
    /// The per-device super-root.
    SuperRoot,
}

/// Decoded inode metadata (the area before the union).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InodeData {
    /// Layout version.
    pub version: u16,
    /// Object type.
    pub obj_type: ObjType,
    /// `OPFLAG_*` bits.
    pub op_flags: u8,
    /// Permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Inode number.
    pub inum: u64,
    /// File size in bytes.
    pub size: u64,
    /// Link count.
    pub nlinks: u64,
    /// Inode number of the parent directory.
    pub iparent: u64,
    /// Directory hash key of `filename`.
    pub name_key: u64,
    /// Creation time (seconds since epoch).
    pub ctime: u64,
    /// Modification time (seconds since epoch).
    pub mtime: u64,
    /// Entry name.
    pub filename: String,
    /// PFS role when this inode is a PFS root.
    pub pfs_type: PfsType,
    /// PFS inode number allocator seed.
    pub pfs_inum: u64,
    /// Cluster id shared by all replicas of one PFS.
    pub pfs_clid: Uuid,
    /// Unique filesystem id of this PFS.
    pub pfs_fsid: Uuid,
}

/// Current inode layout version.
pub const INODE_VERSION: u16 = 1;

impl InodeData {
    /// Creates inode metadata with the given name.
    pub fn new(obj_type: ObjType, filename: &str, name_key: u64) -> Self {
        Self {
            version: INODE_VERSION,
            obj_type,
            filename: filename.to_string(),
            name_key,
            nlinks: 1,
            ..Default::default()
        }
    }

    /// True when the union holds direct data.
    pub fn has_direct_data(&self) -> bool {
        self.op_flags & OPFLAG_DIRECTDATA != 0
    }

    /// Decodes the metadata area of an inode payload.
    pub fn decode(buf: &[u8]) -> ChainResult<Self> {
        if buf.len() < INODE_BYTES {
            return Err(ChainError::InvalidArgument {
                reason: format!("inode payload is {} bytes, need {}", buf.len(), INODE_BYTES),
            });
        }
        Ok(bincode::deserialize(&buf[..INODE_UNION_OFFSET])?)
    }

    /// Encodes into the metadata area of an inode payload, leaving the
    /// union untouched.
    pub fn encode_into(&self, buf: &mut [u8]) -> ChainResult<()> {
        if buf.len() < INODE_BYTES {
            return Err(ChainError::InvalidArgument {
                reason: format!("inode payload is {} bytes, need {}", buf.len(), INODE_BYTES),
            });
        }
        if self.filename.len() > INODE_MAXNAME {
            return Err(ChainError::InvalidArgument {
                reason: format!("filename too long: {}", self.filename.len()),
            });
        }
        let raw = bincode::serialize(self)?;
        if raw.len() > INODE_UNION_OFFSET {
            return Err(ChainError::InvalidArgument {
                reason: format!("inode metadata encodes to {} bytes", raw.len()),
            });
        }
        buf[..INODE_UNION_OFFSET].fill(0);
        buf[..raw.len()].copy_from_slice(&raw);
        Ok(())
    }
}

/// Union area of an inode payload.
pub fn inode_union(buf: &[u8]) -> &[u8] {
    &buf[INODE_UNION_OFFSET..INODE_BYTES]
}

/// Mutable union area of an inode payload.
pub fn inode_union_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[INODE_UNION_OFFSET..INODE_BYTES]
}

/// The part of a payload that holds the block table, if the type has one.
pub fn block_table(bref_type: crate::bref::BrefType, buf: &[u8]) -> Option<&[u8]> {
    use crate::bref::BrefType;
    match bref_type {
        BrefType::Inode if buf.len() >= INODE_BYTES => {
            if InodeData::decode(buf).map(|ip| ip.has_direct_data()).unwrap_or(false) {
                None
            } else {
                Some(inode_union(buf))
            }
        }
        BrefType::Inode | BrefType::Data | BrefType::Empty => None,
        _ => Some(buf),
    }
}

/// Mutable counterpart of [`block_table`].
pub fn block_table_mut(bref_type: crate::bref::BrefType, buf: &mut [u8]) -> Option<&mut [u8]> {
    use crate::bref::BrefType;
    match bref_type {
        BrefType::Inode if buf.len() >= INODE_BYTES => {
            if InodeData::decode(buf).map(|ip| ip.has_direct_data()).unwrap_or(false) {
                None
            } else {
                Some(inode_union_mut(buf))
            }
        }
        BrefType::Inode | BrefType::Data | BrefType::Empty => None,
        _ => Some(buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bref::BrefType;

    #[test]
    fn test_inode_encode_preserves_union() {
        let mut buf = vec![0u8; INODE_BYTES];
        inode_union_mut(&mut buf).fill(0xab);

        let mut ip = InodeData::new(ObjType::Directory, "pfs0", 0x8000_0000);
        ip.pfs_clid = Uuid::new_v4();
        ip.encode_into(&mut buf).unwrap();

        assert!(inode_union(&buf).iter().all(|b| *b == 0xab));
        let back = InodeData::decode(&buf).unwrap();
        assert_eq!(back, ip);
    }

    #[test]
    fn test_max_name_fits_meta_area() {
        let mut buf = vec![0u8; INODE_BYTES];
        let name = "n".repeat(INODE_MAXNAME);
        let mut ip = InodeData::new(ObjType::Regular, &name, 1);
        ip.pfs_fsid = Uuid::new_v4();
        ip.pfs_clid = Uuid::new_v4();
        ip.encode_into(&mut buf).unwrap();
    }

    #[test]
    fn test_name_too_long() {
        let mut buf = vec![0u8; INODE_BYTES];
        let ip = InodeData::new(ObjType::Regular, &"x".repeat(INODE_MAXNAME + 1), 1);
        assert!(matches!(
            ip.encode_into(&mut buf),
            Err(ChainError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(InodeData::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_block_table_selection() {
        let mut buf = vec![0u8; INODE_BYTES];
        let mut ip = InodeData::new(ObjType::Regular, "f", 1);
        ip.encode_into(&mut buf).unwrap();
        assert_eq!(
            block_table(BrefType::Inode, &buf).map(|t| t.len()),
            Some(INODE_UNION_BYTES)
        );

        ip.op_flags |= OPFLAG_DIRECTDATA;
        ip.encode_into(&mut buf).unwrap();
        assert!(block_table(BrefType::Inode, &buf).is_none());

        assert!(block_table(BrefType::Data, &buf).is_none());
        assert_eq!(block_table(BrefType::Indirect, &buf).map(|t| t.len()), Some(INODE_BYTES));
    }
}
