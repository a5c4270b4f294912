#![forbid(unsafe_code)]
//! Storage collaborators and shared volume state for cbfs.
//!
//! This crate hosts the surfaces the relocation engine drives (the
//! logical tree store, raw node I/O, region provisioning) together with
//! the process-wide registries for regions, roots, and cached nodes, and
//! the [`Volume`] aggregate that owns them.
//!
//! # Lock hierarchy
//!
//! Three lock levels, acquired strictly outermost-first:
//!
//! 1. **Tree-wide lock** (`Volume::lock_tree`): exclusive for the whole
//!    of one relocation pass; guards the tree store, node cache, roots.
//! 2. **Region-list lock** (`Volume::lock_regions`): held only while
//!    scanning for or registering destination regions.
//! 3. **Per-region lock** (`Region::lock`): guards one region's usage
//!    counters and free-space index for the specific read/modify/release.
//!
//! A region lock is never held across an acquisition of the region-list
//! lock. The superblock and balance-slot locks are leaf locks taken for
//! single field accesses.

pub mod cache;
pub mod overlay;
pub mod region;
pub mod undo;

pub use cache::{CachedNode, ChildSlot, NodeCache};
pub use overlay::TreeOverlay;
pub use region::{Region, RegionState};
pub use undo::{UndoLog, UndoOp};

use cbfs_error::{BalanceError, Result};
use cbfs_ondisk::RootRecord;
use cbfs_types::{ItemKey, LogicalAddress, NodeSize, TreeId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::thread::JoinHandle;

// ── Tree store ──────────────────────────────────────────────────────────────

/// One tree item: key plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    pub key: ItemKey,
    pub data: Vec<u8>,
}

/// Point access to the on-disk B-tree's logical item space.
///
/// `insert` has replace semantics at this layer; the no-duplicate
/// discipline is enforced by [`TreeOverlay`], which is the only writer
/// during a relocation pass.
pub trait TreeStore: Send {
    /// First item with key at or above `key` in `tree`.
    fn find(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>>;

    /// First item with key strictly above `key` in `tree`.
    fn next(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>>;

    /// Insert or replace the item at `key`.
    fn insert(&mut self, tree: TreeId, key: ItemKey, data: Vec<u8>) -> Result<()>;

    /// Delete the item at `key`; `NotFound` if absent.
    fn delete(&mut self, tree: TreeId, key: ItemKey) -> Result<()>;
}

// ── Raw node I/O ────────────────────────────────────────────────────────────

/// One scheduled node write. Kept in address order by the orchestrator so
/// physical writes never race or overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub address: LogicalAddress,
    pub data: Vec<u8>,
}

/// Raw node-granular I/O.
pub trait NodeIo: Send {
    fn read_node(&self, address: LogicalAddress, len: u32) -> Result<Vec<u8>>;

    /// Durably write a batch. `writes` is non-decreasing in address; the
    /// buffers are consumed.
    fn write_nodes(&mut self, writes: Vec<PendingWrite>) -> Result<()>;
}

// ── Region provisioning ─────────────────────────────────────────────────────

/// Allocates brand-new regions when no existing one has destination space.
pub trait RegionProvisioner: Send {
    fn provision(&mut self, kind: u64) -> Result<Arc<Region>>;
}

// ── In-memory implementations ───────────────────────────────────────────────

/// Sorted in-memory tree store. Reference implementation for tests and
/// harnesses; cloneable so callers can snapshot and diff whole stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTreeStore {
    items: BTreeMap<(TreeId, ItemKey), Vec<u8>>,
}

impl MemoryTreeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items of one tree, in key order.
    #[must_use]
    pub fn items_of(&self, tree: TreeId) -> Vec<TreeItem> {
        self.items
            .range((tree, ItemKey::new(0, 0, 0))..)
            .take_while(|((t, _), _)| *t == tree)
            .map(|((_, key), data)| TreeItem {
                key: *key,
                data: data.clone(),
            })
            .collect()
    }
}

impl TreeStore for MemoryTreeStore {
    fn find(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>> {
        Ok(self
            .items
            .range((tree, key)..)
            .next()
            .filter(|((t, _), _)| *t == tree)
            .map(|((_, k), data)| TreeItem {
                key: *k,
                data: data.clone(),
            }))
    }

    fn next(&self, tree: TreeId, key: ItemKey) -> Result<Option<TreeItem>> {
        Ok(self
            .items
            .range((Bound::Excluded((tree, key)), Bound::Unbounded))
            .next()
            .filter(|((t, _), _)| *t == tree)
            .map(|((_, k), data)| TreeItem {
                key: *k,
                data: data.clone(),
            }))
    }

    fn insert(&mut self, tree: TreeId, key: ItemKey, data: Vec<u8>) -> Result<()> {
        self.items.insert((tree, key), data);
        Ok(())
    }

    fn delete(&mut self, tree: TreeId, key: ItemKey) -> Result<()> {
        self.items
            .remove(&(tree, key))
            .map(|_| ())
            .ok_or_else(|| BalanceError::not_found(format!("item {key} in tree {tree}")))
    }
}

/// In-memory node store keyed by logical address. Records the address
/// order of every write batch for inspection.
#[derive(Debug, Default)]
pub struct MemoryNodeIo {
    nodes: HashMap<u64, Vec<u8>>,
    write_batches: Vec<Vec<u64>>,
}

impl MemoryNodeIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, address: LogicalAddress, data: Vec<u8>) {
        self.nodes.insert(address.0, data);
    }

    #[must_use]
    pub fn get(&self, address: LogicalAddress) -> Option<&Vec<u8>> {
        self.nodes.get(&address.0)
    }

    /// Addresses of each committed batch, in the order they were written.
    #[must_use]
    pub fn write_batches(&self) -> &[Vec<u64>] {
        &self.write_batches
    }
}

impl NodeIo for MemoryNodeIo {
    fn read_node(&self, address: LogicalAddress, len: u32) -> Result<Vec<u8>> {
        let node = self
            .nodes
            .get(&address.0)
            .ok_or_else(|| BalanceError::storage(format!("no node at {address}")))?;
        if node.len() != len as usize {
            return Err(BalanceError::storage(format!(
                "node at {address} has length {}, expected {len}",
                node.len()
            )));
        }
        Ok(node.clone())
    }

    fn write_nodes(&mut self, writes: Vec<PendingWrite>) -> Result<()> {
        let batch: Vec<u64> = writes.iter().map(|w| w.address.0).collect();
        for write in writes {
            self.nodes.insert(write.address.0, write.data);
        }
        self.write_batches.push(batch);
        Ok(())
    }
}

/// Provisioner handing out fixed-size regions from a bump address.
#[derive(Debug)]
pub struct MemoryProvisioner {
    next_start: u64,
    region_length: u64,
}

impl MemoryProvisioner {
    #[must_use]
    pub fn new(next_start: u64, region_length: u64) -> Self {
        Self {
            next_start,
            region_length,
        }
    }
}

impl RegionProvisioner for MemoryProvisioner {
    fn provision(&mut self, kind: u64) -> Result<Arc<Region>> {
        let start = self.next_start;
        self.next_start = start
            .checked_add(self.region_length)
            .ok_or_else(|| BalanceError::storage("logical address space exhausted"))?;
        Ok(Arc::new(Region::new(
            LogicalAddress(start),
            self.region_length,
            kind,
        )))
    }
}

// ── Roots ───────────────────────────────────────────────────────────────────

/// A named tree: id, live root-node address, and the in-memory copy of
/// its persisted root record.
#[derive(Debug)]
pub struct RootEntry {
    pub id: TreeId,
    state: Mutex<RootState>,
}

#[derive(Debug)]
pub struct RootState {
    pub root_address: LogicalAddress,
    pub record: RootRecord,
}

impl RootEntry {
    #[must_use]
    pub fn new(id: TreeId, root_address: LogicalAddress, record: RootRecord) -> Self {
        Self {
            id,
            state: Mutex::new(RootState {
                root_address,
                record,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RootState> {
        self.state.lock()
    }
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// Superblock fields this engine reads or patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockState {
    pub root_tree_addr: LogicalAddress,
    pub chunk_tree_addr: LogicalAddress,
    pub generation: u64,
    /// Set when committed relocations require a superblock write.
    pub need_write: bool,
    pub readonly: bool,
}

/// Everything guarded by the tree-wide exclusive lock.
pub struct TreeState {
    pub store: Box<dyn TreeStore>,
    pub io: Box<dyn NodeIo>,
    pub provisioner: Box<dyn RegionProvisioner>,
    pub cache: NodeCache,
    pub roots: Vec<Arc<RootEntry>>,
}

impl TreeState {
    #[must_use]
    pub fn root_by_id(&self, id: TreeId) -> Option<Arc<RootEntry>> {
        self.roots.iter().find(|root| root.id == id).cloned()
    }
}

/// Balance worker slot: at most one drain runs per volume, enforced by
/// the presence of the handle.
#[derive(Default)]
pub struct BalanceSlot {
    pub worker: Option<JoinHandle<()>>,
    pub last_error: Option<BalanceError>,
}

/// Snapshot of the balance worker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceStatus {
    pub running: bool,
    pub last_error: Option<BalanceError>,
}

/// The mounted volume: immutable geometry plus the locked registries.
pub struct Volume {
    pub node_size: NodeSize,
    /// Extent records use the padding-free skinny shape.
    pub skinny_records: bool,
    sb: Mutex<SuperblockState>,
    tree: Mutex<TreeState>,
    regions: Mutex<Vec<Arc<Region>>>,
    balance: Mutex<BalanceSlot>,
}

impl Volume {
    #[must_use]
    pub fn new(
        node_size: NodeSize,
        skinny_records: bool,
        sb: SuperblockState,
        tree: TreeState,
    ) -> Self {
        Self {
            node_size,
            skinny_records,
            sb: Mutex::new(sb),
            tree: Mutex::new(tree),
            regions: Mutex::new(Vec::new()),
            balance: Mutex::new(BalanceSlot::default()),
        }
    }

    pub fn lock_tree(&self) -> MutexGuard<'_, TreeState> {
        self.tree.lock()
    }

    pub fn lock_superblock(&self) -> MutexGuard<'_, SuperblockState> {
        self.sb.lock()
    }

    pub fn lock_regions(&self) -> MutexGuard<'_, Vec<Arc<Region>>> {
        self.regions.lock()
    }

    pub fn lock_balance(&self) -> MutexGuard<'_, BalanceSlot> {
        self.balance.lock()
    }

    pub fn register_region(&self, region: Arc<Region>) {
        self.regions.lock().push(region);
    }

    /// Region covering `address`, if any.
    #[must_use]
    pub fn region_of(&self, address: LogicalAddress) -> Option<Arc<Region>> {
        self.regions
            .lock()
            .iter()
            .find(|region| region.contains(address))
            .cloned()
    }

    /// Snapshot of the region list.
    #[must_use]
    pub fn regions_snapshot(&self) -> Vec<Arc<Region>> {
        self.regions.lock().clone()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.sb.lock().readonly
    }

    #[must_use]
    pub fn balance_status(&self) -> BalanceStatus {
        let slot = self.balance.lock();
        BalanceStatus {
            running: slot.worker.as_ref().is_some_and(|w| !w.is_finished()),
            last_error: slot.last_error.clone(),
        }
    }
}
