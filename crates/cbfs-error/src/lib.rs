#![forbid(unsafe_code)]
//! Error types for cbfs.
//!
//! `BalanceError` is the single user-facing error type returned by the
//! relocation engine and the driver. Crate-internal errors (`ParseError`
//! from `cbfs-types`) convert into `BalanceError` at the crate boundary
//! that observes them; this crate intentionally depends on nothing else to
//! keep the dependency graph acyclic.
//!
//! Any failure inside a relocation pass aborts the whole pass: the staged
//! tree mutations are discarded, the side-effect log is replayed in
//! reverse, and the error propagates to the driver. There is no partial
//! success and no silent degradation: a malformed on-disk structure is
//! always fatal to the pass, never skipped.

use thiserror::Error;

/// Unified error type for relocation operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    /// A collaborator could not allocate memory for a buffer or record.
    #[error("out of memory")]
    OutOfMemory,

    /// An extent record, its inline reference section, or one of its
    /// overflow items does not decode, or the reconstructed reference
    /// count disagrees with the header.
    #[error("malformed extent record at {address:#x}: {detail}")]
    MalformedExtentRecord { address: u64, detail: String },

    /// An item the engine relies on (extent record, root record, owning
    /// root) is missing from the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// No destination space could be secured for a relocated node, even
    /// after trying to provision a fresh region.
    #[error("no destination space available")]
    DiskFull,

    /// Underlying storage failure: node read/write, item insert/delete.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A balance worker is already active on this volume.
    #[error("balance already running")]
    AlreadyRunning,

    /// The volume is mounted read-only.
    #[error("volume is read-only")]
    ReadOnly,
}

impl BalanceError {
    pub fn storage(detail: impl Into<String>) -> Self {
        Self::Storage(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }
}

pub type Result<T> = std::result::Result<T, BalanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_address() {
        let err = BalanceError::MalformedExtentRecord {
            address: 0x4000,
            detail: "unknown reference type tag 0x7".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "malformed extent record at 0x4000: unknown reference type tag 0x7"
        );
    }
}
