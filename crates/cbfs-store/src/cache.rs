//! In-memory tree-node cache.
//!
//! The cache records which nodes are currently materialized in memory and,
//! for internal nodes, their uncommitted child-pointer slots. The parent
//! resolver descends it from a tree's root to find the cached ancestor one
//! level above a relocated node; the orchestrator patches child slots and
//! node addresses through it.
//!
//! Lookup is a linear walk: the cache holds at most the working set of a
//! single relocation pass plus whatever the mount left behind.

use cbfs_types::{ItemKey, LogicalAddress};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// One child pointer held by a cached internal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    pub key: ItemKey,
    pub address: LogicalAddress,
    /// Slots inserted by an uncommitted tree mutation keep their address;
    /// only slots that mirror the on-disk node are repointed.
    pub inserted: bool,
}

/// A node currently materialized in memory.
#[derive(Debug)]
pub struct CachedNode {
    pub level: u8,
    inner: Mutex<CachedNodeState>,
}

#[derive(Debug)]
pub struct CachedNodeState {
    pub address: LogicalAddress,
    /// Child slots in key order. Empty for leaves.
    pub children: Vec<ChildSlot>,
}

impl CachedNode {
    #[must_use]
    pub fn new(level: u8, address: LogicalAddress, children: Vec<ChildSlot>) -> Arc<Self> {
        Arc::new(Self {
            level,
            inner: Mutex::new(CachedNodeState { address, children }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, CachedNodeState> {
        self.inner.lock()
    }

    #[must_use]
    pub fn address(&self) -> LogicalAddress {
        self.inner.lock().address
    }

    pub fn set_address(&self, address: LogicalAddress) {
        self.inner.lock().address = address;
    }

    /// Child slot to descend into for `key`: the last slot whose key is at
    /// or below it, or the first slot when `key` sorts before all of them.
    fn descend_slot(&self, key: &ItemKey) -> Option<LogicalAddress> {
        let state = self.inner.lock();
        let mut chosen = state.children.first()?;
        for slot in &state.children {
            if slot.key <= *key {
                chosen = slot;
            } else {
                break;
            }
        }
        Some(chosen.address)
    }

    /// Repoint every non-inserted slot whose address equals `old`.
    /// Returns the indices of the patched slots.
    pub fn patch_children(&self, old: LogicalAddress, new: LogicalAddress) -> Vec<usize> {
        let mut state = self.inner.lock();
        let mut patched = Vec::new();
        for (idx, slot) in state.children.iter_mut().enumerate() {
            if !slot.inserted && slot.address == old {
                slot.address = new;
                patched.push(idx);
            }
        }
        patched
    }

    pub fn set_child_address(&self, slot: usize, address: LogicalAddress) {
        let mut state = self.inner.lock();
        if let Some(child) = state.children.get_mut(slot) {
            child.address = address;
        }
    }
}

/// Registry of cached nodes.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: Vec<Arc<CachedNode>>,
}

impl NodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Arc<CachedNode>) {
        self.nodes.push(node);
    }

    #[must_use]
    pub fn lookup(&self, address: LogicalAddress) -> Option<Arc<CachedNode>> {
        self.nodes
            .iter()
            .find(|node| node.address() == address)
            .cloned()
    }

    /// Walk the cached path from `root_address` toward `key`, stopping at
    /// the node one level above `child_level`. Returns `None` when the
    /// chain is broken before that level; the caller then treats the
    /// child as the top of its tree.
    #[must_use]
    pub fn ancestor_above(
        &self,
        root_address: LogicalAddress,
        key: &ItemKey,
        child_level: u8,
    ) -> Option<Arc<CachedNode>> {
        let target = child_level.checked_add(1)?;
        let mut cur = self.lookup(root_address)?;
        if cur.level < target {
            return None;
        }
        while cur.level > target {
            let next = cur.descend_slot(key)?;
            cur = self.lookup(next)?;
        }
        Some(cur)
    }
}
