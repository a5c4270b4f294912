#![forbid(unsafe_code)]
//! Shared types for cbfs: addresses, tree ids, item keys, on-disk
//! constants, and little-endian parse helpers.
//!
//! Everything here is plain data. Parsing failures are reported as
//! [`ParseError`]; the runtime error type lives in `cbfs-error` and the
//! conversion happens at the consuming crate's boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Well-known trees ────────────────────────────────────────────────────────

/// The root-of-roots: holds a `RootRecord` item for every other tree.
pub const ROOT_TREE_ID: TreeId = TreeId(1);
/// The extent tree: holds one extent record per allocated node.
pub const EXTENT_TREE_ID: TreeId = TreeId(2);
/// The chunk tree: describes regions of the logical address space.
pub const CHUNK_TREE_ID: TreeId = TreeId(3);

// ── Item type tags ──────────────────────────────────────────────────────────

pub const TYPE_ROOT_RECORD: u8 = 132;
pub const TYPE_EXTENT_RECORD: u8 = 168;
pub const TYPE_METADATA_RECORD: u8 = 169;
pub const TYPE_TREE_OWNED_REF: u8 = 176;
pub const TYPE_SHARED_PARENT_REF: u8 = 182;

// ── Extent record flags ─────────────────────────────────────────────────────

/// Bit in `ExtentRecordHeader::flags` marking a tree node (vs. a data span).
pub const EXTENT_FLAG_TREE_NODE: u64 = 0x2;

// ── Feature flags ───────────────────────────────────────────────────────────

/// Incompat feature bit: extent records use the padding-free skinny shape.
pub const FEATURE_SKINNY_RECORDS: u64 = 0x100;

// ── Region kind flags ───────────────────────────────────────────────────────

pub const REGION_DATA: u64 = 0x1;
pub const REGION_SYSTEM: u64 = 0x2;
pub const REGION_METADATA: u64 = 0x4;
pub const REGION_DUP: u64 = 0x20;

/// Maximum tree depth (levels 0..=7, leaf is level 0).
pub const MAX_LEVEL: u8 = 7;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Logical byte address of a tree node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogicalAddress(pub u64);

impl LogicalAddress {
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a named tree (subvolume, extent tree, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated node size (power of two in 4096..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeSize(u32);

impl NodeSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(4096..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Inline budget for an encoded extent record: one quarter of the node.
    #[must_use]
    pub fn inline_budget(self) -> usize {
        self.as_usize() / 4
    }
}

// ── Item keys ───────────────────────────────────────────────────────────────

/// Key of one tree item. Items sort by `(objectid, item_type, offset)`,
/// which the derived `Ord` provides via field order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ItemKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl ItemKey {
    #[must_use]
    pub fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Smallest key with the given objectid; anchor for at-or-above search.
    #[must_use]
    pub fn first_for_object(objectid: u64) -> Self {
        Self::new(objectid, 0, 0)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:#x},{},{:#x})",
            self.objectid, self.item_type, self.offset
        )
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unknown reference type tag {tag:#x}")]
    UnknownRefTag { tag: u8 },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Parse helpers ───────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::IntegerConversion { field: "offset" });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
