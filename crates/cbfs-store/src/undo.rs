//! Inverse-operation log for side effects that cannot sit in the tree
//! overlay.
//!
//! Region counters, free-span changes, root-holder patches, superblock
//! pointers, and in-memory cache patches must be visible mid-pass (the
//! destination search consumes spans the same pass freed), so they are
//! applied eagerly and recorded here. On failure the log replays in
//! reverse; on success it is simply dropped.

use crate::cache::CachedNode;
use crate::region::Region;
use crate::{RootEntry, SuperblockState};
use cbfs_ondisk::RootRecord;
use cbfs_types::LogicalAddress;
use std::sync::Arc;

/// One applied side effect, described so it can be inverted.
pub enum UndoOp {
    /// `adjust_used(delta)` was applied to the region.
    RegionUsage { region: Arc<Region>, delta: i64 },
    /// `[start, start+len)` was added to the region's free index.
    RegionSpanPut {
        region: Arc<Region>,
        start: u64,
        len: u64,
    },
    /// `[start, start+len)` was removed from the region's free index.
    RegionSpanTake {
        region: Arc<Region>,
        start: u64,
        len: u64,
    },
    /// The root's in-memory holder address was overwritten.
    RootAddress {
        root: Arc<RootEntry>,
        previous: LogicalAddress,
    },
    /// The root's in-memory persisted record copy was overwritten.
    RootRecordSet {
        root: Arc<RootEntry>,
        previous: RootRecord,
    },
    /// The superblock's root-of-roots pointer was overwritten.
    SuperRootAddr { previous: LogicalAddress },
    /// The superblock's chunk-tree pointer was overwritten.
    SuperChunkAddr { previous: LogicalAddress },
    /// A cached node's address was overwritten.
    CacheAddress {
        node: Arc<CachedNode>,
        previous: LogicalAddress,
    },
    /// A cached node's child slot was repointed.
    CacheChild {
        node: Arc<CachedNode>,
        slot: usize,
        previous: LogicalAddress,
    },
}

#[derive(Default)]
pub struct UndoLog {
    ops: Vec<UndoOp>,
}

impl UndoLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, op: UndoOp) {
        self.ops.push(op);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Replay every recorded operation's inverse, newest first.
    pub fn rollback(self, sb: &mut SuperblockState) {
        for op in self.ops.into_iter().rev() {
            match op {
                UndoOp::RegionUsage { region, delta } => {
                    region.lock().adjust_used(-delta);
                }
                UndoOp::RegionSpanPut { region, start, len } => {
                    region.lock().take_span(start, len);
                }
                UndoOp::RegionSpanTake { region, start, len } => {
                    region.lock().put_span(start, len);
                }
                UndoOp::RootAddress { root, previous } => {
                    root.lock().root_address = previous;
                }
                UndoOp::RootRecordSet { root, previous } => {
                    root.lock().record = previous;
                }
                UndoOp::SuperRootAddr { previous } => {
                    sb.root_tree_addr = previous;
                }
                UndoOp::SuperChunkAddr { previous } => {
                    sb.chunk_tree_addr = previous;
                }
                UndoOp::CacheAddress { node, previous } => {
                    node.set_address(previous);
                }
                UndoOp::CacheChild {
                    node,
                    slot,
                    previous,
                } => {
                    node.set_child_address(slot, previous);
                }
            }
        }
    }
}
