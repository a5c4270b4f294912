#![forbid(unsafe_code)]
//! On-disk formats for cbfs: tree-node pages, extent records, reference
//! entries, root records.
//!
//! Byte layouts are fixed and little-endian throughout. Parsing returns
//! `ParseError`; nothing in this crate performs I/O.
//!
//! # Node page layout
//!
//! ```text
//! +--------------------+--------+
//! | csum               | 32     | CRC32C of [0x20..] in first 4 bytes
//! | fsid               | 16     |
//! | bytenr             | 8      | node's own logical address
//! | flags              | 8      |
//! | chunk_tree_uuid    | 16     |
//! | generation         | 8      |
//! | owner              | 8      | owning tree id
//! | nritems            | 4      |
//! | level              | 1      | 0 = leaf
//! +--------------------+--------+  = 101 bytes
//! ```
//!
//! An internal node follows the header with `nritems` key-pointers
//! (17-byte key + child address u64 + generation u64 = 33 bytes); a leaf
//! follows it with item descriptors. Either way the node's first key sits
//! at byte 101.

use cbfs_types::{
    read_fixed, read_le_u32, read_le_u64, ItemKey, LogicalAddress, ParseError, TreeId,
    MAX_LEVEL, TYPE_SHARED_PARENT_REF, TYPE_TREE_OWNED_REF,
};
use serde::{Deserialize, Serialize};

pub const NODE_HEADER_SIZE: usize = 101;
pub const NODE_CSUM_SIZE: usize = 32;
/// Size of a disk key (objectid:u64 + type:u8 + offset:u64).
pub const DISK_KEY_SIZE: usize = 17;
/// Size of an internal key-pointer (key:17 + child:u64 + generation:u64).
pub const KEY_PTR_SIZE: usize = 33;
/// Extent record header (refcount:u64 + generation:u64 + flags:u64).
pub const EXTENT_RECORD_SIZE: usize = 24;
/// Legacy trailer after the header (first-key block + level), reserved.
pub const EXTENT_RECORD_TRAILER_SIZE: usize = 18;
/// One inline reference entry: type tag + 8-byte payload.
pub const INLINE_REF_SIZE: usize = 9;

const OFF_BYTENR: usize = 0x30;
const OFF_GENERATION: usize = 0x50;
const OFF_OWNER: usize = 0x58;
const OFF_NRITEMS: usize = 0x60;
const OFF_LEVEL: usize = 0x64;

// ── Node header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < NODE_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: NODE_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, OFF_BYTENR)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, OFF_GENERATION)?,
            owner: read_le_u64(block, OFF_OWNER)?,
            nritems: read_le_u32(block, OFF_NRITEMS)?,
            level: block[OFF_LEVEL],
        })
    }

    /// Bounds checks after parsing: level range, key-pointer capacity,
    /// and (when known) that the header records its own address.
    pub fn validate(
        &self,
        block_len: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }
        if let Some(bytenr) = expected_bytenr {
            if self.bytenr != bytenr {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "does not match node's logical address",
                });
            }
        }
        if self.level > 0 {
            let capacity = (block_len.saturating_sub(NODE_HEADER_SIZE)) / KEY_PTR_SIZE;
            if self.nritems as usize > capacity {
                return Err(ParseError::InvalidField {
                    field: "nritems",
                    reason: "exceeds key-pointer capacity of block",
                });
            }
        }
        Ok(())
    }
}

/// Read the node's first key, valid for leaves and internal nodes alike.
pub fn node_first_key(block: &[u8]) -> Result<ItemKey, ParseError> {
    Ok(ItemKey {
        objectid: read_le_u64(block, NODE_HEADER_SIZE)?,
        item_type: *block
            .get(NODE_HEADER_SIZE + 8)
            .ok_or(ParseError::InsufficientData {
                needed: DISK_KEY_SIZE,
                offset: NODE_HEADER_SIZE,
                actual: block.len().saturating_sub(NODE_HEADER_SIZE),
            })?,
        offset: read_le_u64(block, NODE_HEADER_SIZE + 9)?,
    })
}

/// Overwrite the header's self-address field.
pub fn set_node_address(block: &mut [u8], address: LogicalAddress) -> Result<(), ParseError> {
    if block.len() < NODE_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: NODE_HEADER_SIZE,
            offset: OFF_BYTENR,
            actual: block.len(),
        });
    }
    block[OFF_BYTENR..OFF_BYTENR + 8].copy_from_slice(&address.0.to_le_bytes());
    Ok(())
}

/// Rewrite the key-pointer slot of an internal node whose child address is
/// `old` to point at `new`. Returns whether a slot matched; at most one
/// slot is rewritten.
pub fn patch_child_pointer(
    block: &mut [u8],
    old: LogicalAddress,
    new: LogicalAddress,
) -> Result<bool, ParseError> {
    let nritems = read_le_u32(block, OFF_NRITEMS)? as usize;
    for i in 0..nritems {
        let off = NODE_HEADER_SIZE + i * KEY_PTR_SIZE + DISK_KEY_SIZE;
        if read_le_u64(block, off)? == old.0 {
            block[off..off + 8].copy_from_slice(&new.0.to_le_bytes());
            return Ok(true);
        }
    }
    Ok(false)
}

/// Recompute the node checksum over every byte after the checksum field
/// and store it in the first four checksum bytes.
pub fn refresh_node_checksum(block: &mut [u8]) {
    let crc = crc32c::crc32c(&block[NODE_CSUM_SIZE..]);
    block[..4].copy_from_slice(&crc.to_le_bytes());
}

/// Whether the stored checksum matches the node content.
#[must_use]
pub fn node_checksum_ok(block: &[u8]) -> bool {
    if block.len() < NODE_CSUM_SIZE {
        return false;
    }
    let stored = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    stored == crc32c::crc32c(&block[NODE_CSUM_SIZE..])
}

// ── Extent records ──────────────────────────────────────────────────────────

/// Fixed header of an extent record. The inline reference section (and,
/// for the legacy shape, the reserved trailer) follows it in the item
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRecordHeader {
    pub refcount: u64,
    pub generation: u64,
    pub flags: u64,
}

impl ExtentRecordHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            refcount: read_le_u64(data, 0)?,
            generation: read_le_u64(data, 8)?,
            flags: read_le_u64(data, 16)?,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.refcount.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    #[must_use]
    pub fn is_tree_node(&self) -> bool {
        self.flags & cbfs_types::EXTENT_FLAG_TREE_NODE != 0
    }
}

// ── References ──────────────────────────────────────────────────────────────

/// One reference held by an extent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRef {
    /// The node belongs directly to the named tree.
    TreeOwned { tree: TreeId },
    /// The node is additionally reachable through a shared parent node.
    SharedByParent { parent: LogicalAddress },
}

impl NodeRef {
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::TreeOwned { .. } => TYPE_TREE_OWNED_REF,
            Self::SharedByParent { .. } => TYPE_SHARED_PARENT_REF,
        }
    }

    /// The 8-byte payload as stored on disk.
    #[must_use]
    pub fn payload(&self) -> u64 {
        match self {
            Self::TreeOwned { tree } => tree.0,
            Self::SharedByParent { parent } => parent.0,
        }
    }

    pub fn from_tag_payload(tag: u8, payload: u64) -> Result<Self, ParseError> {
        match tag {
            TYPE_TREE_OWNED_REF => Ok(Self::TreeOwned {
                tree: TreeId(payload),
            }),
            TYPE_SHARED_PARENT_REF => Ok(Self::SharedByParent {
                parent: LogicalAddress(payload),
            }),
            _ => Err(ParseError::UnknownRefTag { tag }),
        }
    }
}

/// Decode the inline reference section of an extent record: repeated
/// `tag:u8 + payload:u64` entries until the section is exhausted. An
/// unknown tag or a truncated trailing payload is a format error.
pub fn decode_inline_refs(section: &[u8]) -> Result<Vec<NodeRef>, ParseError> {
    let mut refs = Vec::new();
    let mut cur = 0_usize;
    while cur < section.len() {
        let tag = section[cur];
        let payload = read_le_u64(section, cur + 1)?;
        refs.push(NodeRef::from_tag_payload(tag, payload)?);
        cur += INLINE_REF_SIZE;
    }
    Ok(refs)
}

/// Append one `tag + payload` reference entry.
pub fn encode_ref_into(out: &mut Vec<u8>, tag: u8, payload: u64) {
    out.push(tag);
    out.extend_from_slice(&payload.to_le_bytes());
}

// ── Root records ────────────────────────────────────────────────────────────

/// Persisted root pointer of a named tree, stored as an item in the
/// root-of-roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    pub generation: u64,
    pub block_number: u64,
    pub level: u8,
}

pub const ROOT_RECORD_SIZE: usize = 17;

impl RootRecord {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            generation: read_le_u64(data, 0)?,
            block_number: read_le_u64(data, 8)?,
            level: *data.get(16).ok_or(ParseError::InsufficientData {
                needed: ROOT_RECORD_SIZE,
                offset: 0,
                actual: data.len(),
            })?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ROOT_RECORD_SIZE);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.block_number.to_le_bytes());
        out.push(self.level);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbfs_types::{TYPE_SHARED_PARENT_REF, TYPE_TREE_OWNED_REF};

    const NODESIZE: usize = 4096;

    fn write_header(block: &mut [u8], bytenr: u64, nritems: u32, level: u8, owner: u64) {
        block[OFF_BYTENR..OFF_BYTENR + 8].copy_from_slice(&bytenr.to_le_bytes());
        block[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&7_u64.to_le_bytes());
        block[OFF_OWNER..OFF_OWNER + 8].copy_from_slice(&owner.to_le_bytes());
        block[OFF_NRITEMS..OFF_NRITEMS + 4].copy_from_slice(&nritems.to_le_bytes());
        block[OFF_LEVEL] = level;
    }

    fn write_key_ptr(block: &mut [u8], idx: usize, objectid: u64, child: u64) {
        let base = NODE_HEADER_SIZE + idx * KEY_PTR_SIZE;
        block[base..base + 8].copy_from_slice(&objectid.to_le_bytes());
        block[base + 8] = 1;
        block[base + 9..base + 17].copy_from_slice(&0_u64.to_le_bytes());
        block[base + 17..base + 25].copy_from_slice(&child.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&7_u64.to_le_bytes());
    }

    #[test]
    fn header_roundtrip_and_validate() {
        let mut block = vec![0_u8; NODESIZE];
        write_header(&mut block, 0x4000, 2, 1, 5);
        write_key_ptr(&mut block, 0, 256, 0x8000);
        write_key_ptr(&mut block, 1, 512, 0xC000);

        let header = NodeHeader::parse_from_block(&block).expect("parse");
        assert_eq!(header.bytenr, 0x4000);
        assert_eq!(header.nritems, 2);
        assert_eq!(header.level, 1);
        assert_eq!(header.owner, 5);
        header.validate(block.len(), Some(0x4000)).expect("validate");
        assert!(header.validate(block.len(), Some(0x5000)).is_err());
    }

    #[test]
    fn validate_rejects_bogus_level_and_nritems() {
        let mut block = vec![0_u8; NODESIZE];
        write_header(&mut block, 0x4000, 1, 9, 5);
        let header = NodeHeader::parse_from_block(&block).expect("parse");
        assert!(header.validate(block.len(), None).is_err());

        let mut block = vec![0_u8; NODESIZE];
        write_header(&mut block, 0x4000, 10_000, 1, 5);
        let header = NodeHeader::parse_from_block(&block).expect("parse");
        assert!(header.validate(block.len(), None).is_err());
    }

    #[test]
    fn first_key_reads_byte_101() {
        let mut block = vec![0_u8; NODESIZE];
        write_header(&mut block, 0x4000, 1, 1, 5);
        write_key_ptr(&mut block, 0, 256, 0x8000);
        let key = node_first_key(&block).expect("first key");
        assert_eq!(key.objectid, 256);
        assert_eq!(key.item_type, 1);
        assert_eq!(key.offset, 0);
    }

    #[test]
    fn patch_rewrites_matching_slot_only() {
        let mut block = vec![0_u8; NODESIZE];
        write_header(&mut block, 0x4000, 2, 1, 5);
        write_key_ptr(&mut block, 0, 256, 0x8000);
        write_key_ptr(&mut block, 1, 512, 0xC000);

        let patched =
            patch_child_pointer(&mut block, LogicalAddress(0xC000), LogicalAddress(0x1_0000))
                .expect("patch");
        assert!(patched);
        let off0 = NODE_HEADER_SIZE + DISK_KEY_SIZE;
        let off1 = NODE_HEADER_SIZE + KEY_PTR_SIZE + DISK_KEY_SIZE;
        assert_eq!(read_le_u64(&block, off0).unwrap(), 0x8000);
        assert_eq!(read_le_u64(&block, off1).unwrap(), 0x1_0000);

        let patched =
            patch_child_pointer(&mut block, LogicalAddress(0xDEAD), LogicalAddress(0x2_0000))
                .expect("patch");
        assert!(!patched);
    }

    #[test]
    fn checksum_covers_everything_after_csum_field() {
        let mut block = vec![0_u8; NODESIZE];
        write_header(&mut block, 0x4000, 0, 0, 5);
        refresh_node_checksum(&mut block);
        assert!(node_checksum_ok(&block));

        // Flip a byte outside the checksum field: must invalidate.
        block[200] ^= 0xFF;
        assert!(!node_checksum_ok(&block));
        refresh_node_checksum(&mut block);
        assert!(node_checksum_ok(&block));
    }

    #[test]
    fn extent_record_header_roundtrip() {
        let header = ExtentRecordHeader {
            refcount: 3,
            generation: 42,
            flags: cbfs_types::EXTENT_FLAG_TREE_NODE,
        };
        let mut out = Vec::new();
        header.encode_into(&mut out);
        assert_eq!(out.len(), EXTENT_RECORD_SIZE);
        let parsed = ExtentRecordHeader::parse(&out).expect("parse");
        assert_eq!(parsed, header);
        assert!(parsed.is_tree_node());
    }

    #[test]
    fn inline_refs_decode() {
        let mut section = Vec::new();
        encode_ref_into(&mut section, TYPE_TREE_OWNED_REF, 5);
        encode_ref_into(&mut section, TYPE_SHARED_PARENT_REF, 0x9000);

        let refs = decode_inline_refs(&section).expect("decode");
        assert_eq!(
            refs,
            vec![
                NodeRef::TreeOwned { tree: TreeId(5) },
                NodeRef::SharedByParent {
                    parent: LogicalAddress(0x9000)
                },
            ]
        );
    }

    #[test]
    fn inline_refs_reject_unknown_tag() {
        let mut section = Vec::new();
        encode_ref_into(&mut section, 0x7, 5);
        assert_eq!(
            decode_inline_refs(&section),
            Err(ParseError::UnknownRefTag { tag: 0x7 })
        );
    }

    #[test]
    fn inline_refs_reject_truncated_payload() {
        let mut section = Vec::new();
        encode_ref_into(&mut section, TYPE_TREE_OWNED_REF, 5);
        section.truncate(section.len() - 3);
        assert!(matches!(
            decode_inline_refs(&section),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn root_record_roundtrip() {
        let record = RootRecord {
            generation: 9,
            block_number: 0x4_0000,
            level: 2,
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), ROOT_RECORD_SIZE);
        assert_eq!(RootRecord::parse(&bytes).expect("parse"), record);
    }
}
