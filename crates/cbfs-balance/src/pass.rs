//! The relocation orchestrator: one exclusive pass over one region.
//!
//! A pass scans the region for tree-node extent records (bounded batch),
//! loads and resolves every queued node, rewrites nodes level 0 upward
//! (securing destination space, patching parents and roots, refreshing
//! checksums), persists replacement extent records, and flushes the
//! address-ordered write queue. The pass either commits every staged tree
//! mutation together or unwinds completely.
//!
//! Rewrites must ascend levels: a child's pointer patch lands in its
//! parent's still-unflushed staging buffer, which is finalized and
//! checksummed later in the same sweep.

use crate::encode::encode_extent_record;
use crate::graph::{discover_record, malformed, Batch, GraphCtx, RecordIdx};
use crate::resolve::resolve_record;
use cbfs_error::{BalanceError, Result};
use cbfs_ondisk::{
    patch_child_pointer, refresh_node_checksum, set_node_address, ExtentRecordHeader,
    NodeHeader, NodeRef, EXTENT_RECORD_SIZE,
};
use cbfs_store::{
    NodeCache, NodeIo, PendingWrite, Region, RegionProvisioner, RootEntry, TreeItem,
    TreeOverlay, TreeState, UndoLog, UndoOp, Volume,
};
use cbfs_types::{
    ItemKey, LogicalAddress, NodeSize, CHUNK_TREE_ID, EXTENT_TREE_ID, ROOT_TREE_ID,
    TYPE_EXTENT_RECORD, TYPE_METADATA_RECORD, TYPE_ROOT_RECORD,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on nodes discovered by one region scan.
const MAX_BATCH_NODES: u32 = 64;

/// Relocate up to [`MAX_BATCH_NODES`] tree nodes out of `region`.
///
/// Returns `Ok(false)` when the scan found nothing to move, meaning the
/// region is drained. Holds the volume's tree-wide lock for the entire call; on
/// any failure the staged tree mutations are discarded and every applied
/// side effect is rolled back before the error propagates.
pub fn balance_chunk(volume: &Volume, region: &Arc<Region>) -> Result<bool> {
    trace!(region = region.start.0, "balance pass starting");

    let mut tree = volume.lock_tree();
    let TreeState {
        store,
        io,
        provisioner,
        cache,
        roots,
    } = &mut *tree;

    let mut overlay = TreeOverlay::new(store.as_mut());
    let mut undo = UndoLog::new();
    let mut batch = Batch::new();

    let outcome = run_pass(
        volume,
        region,
        &mut overlay,
        &mut undo,
        &mut batch,
        cache,
        roots,
        io.as_mut(),
        provisioner.as_mut(),
    );

    match outcome {
        Ok(false) => Ok(false),
        Ok(true) => match overlay.commit() {
            Ok(()) => {
                volume.lock_superblock().need_write = true;
                Ok(true)
            }
            Err(err) => {
                undo.rollback(&mut volume.lock_superblock());
                Err(err)
            }
        },
        Err(err) => {
            undo.rollback(&mut volume.lock_superblock());
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_pass(
    volume: &Volume,
    region: &Arc<Region>,
    overlay: &mut TreeOverlay<'_>,
    undo: &mut UndoLog,
    batch: &mut Batch,
    cache: &NodeCache,
    roots: &[Arc<RootEntry>],
    io: &mut dyn NodeIo,
    provisioner: &mut dyn RegionProvisioner,
) -> Result<bool> {
    let node_size = volume.node_size;
    let skinny = volume.skinny_records;

    // Phase 1: scan the region's address range for tree-node records.
    let mut discovered = 0_u32;
    {
        let mut ctx = GraphCtx {
            overlay: &mut *overlay,
            undo: &mut *undo,
            volume,
            batch: &mut *batch,
            node_size,
        };
        let region_end = region.end();
        let mut cursor = ctx
            .overlay
            .find(EXTENT_TREE_ID, ItemKey::first_for_object(region.start.0))?;
        while let Some(item) = cursor {
            if item.key.objectid >= region_end {
                break;
            }
            if scan_item(&mut ctx, &item)? {
                discovered += 1;
                if discovered >= MAX_BATCH_NODES {
                    break;
                }
            }
            cursor = ctx.overlay.next(EXTENT_TREE_ID, item.key)?;
        }
    }
    if discovered == 0 {
        trace!(region = region.start.0, "no tree nodes left in region");
        return Ok(false);
    }
    debug!(region = region.start.0, discovered, "relocating tree nodes");

    // Phases 2+3: load node bytes and resolve references. Resolution may
    // transitively queue parent records; they are appended and visited by
    // this same sweep, so one forward pass reaches the fixed point.
    let mut max_level = 0_u8;
    let mut i = 0;
    while i < batch.len() {
        let idx = RecordIdx(i);
        let address = batch.get(idx).old_address;
        let block = io.read_node(address, node_size.get())?;
        let header = NodeHeader::parse_from_block(&block)
            .map_err(|err| BalanceError::storage(format!("node at {address}: {err}")))?;
        header
            .validate(block.len(), Some(address.0))
            .map_err(|err| BalanceError::storage(format!("node at {address}: {err}")))?;
        max_level = max_level.max(header.level);
        {
            let record = batch.get_mut(idx);
            record.node = block;
            record.level = header.level;
        }
        {
            let mut ctx = GraphCtx {
                overlay: &mut *overlay,
                undo: &mut *undo,
                volume,
                batch: &mut *batch,
                node_size,
            };
            resolve_record(&mut ctx, cache, roots, idx)?;
        }
        i += 1;
    }

    // Phase 4: attach live in-memory nodes for pointer patching.
    for i in 0..batch.len() {
        let idx = RecordIdx(i);
        let address = batch.get(idx).old_address;
        batch.get_mut(idx).cached = cache.lookup(address);
    }

    // Phase 5: rewrite, level 0 upward.
    let mut pending: Vec<PendingWrite> = Vec::new();
    let mut rolling: Option<Arc<Region>> = None;
    for level in 0..=max_level {
        for i in 0..batch.len() {
            let idx = RecordIdx(i);
            if batch.get(idx).level != level {
                continue;
            }
            let new_address = select_destination(
                volume,
                region.kind,
                node_size,
                &mut rolling,
                undo,
                provisioner,
            )?;
            batch.get_mut(idx).new_address = Some(new_address);
            patch_parents(batch, idx, new_address, undo)?;
            patch_roots(volume, overlay, roots, batch, idx, new_address, undo)?;
            finalize_node(batch, idx, new_address, undo, &mut pending)?;
        }
    }

    // Phase 6: persist replacement extent records and overflow items.
    for i in 0..batch.len() {
        let encoded = encode_extent_record(batch, RecordIdx(i), node_size, skinny)?;
        overlay.insert(EXTENT_TREE_ID, encoded.key, encoded.data)?;
        for (key, data) in encoded.overflow {
            overlay.insert(EXTENT_TREE_ID, key, data)?;
        }
    }

    // Phase 7: flush in non-decreasing address order.
    io.write_nodes(pending)?;

    Ok(true)
}

/// Queue `item` for relocation when it is a tree-node extent record:
/// metadata-record form, or legacy form with the tree-node flag set.
fn scan_item(ctx: &mut GraphCtx<'_, '_>, item: &TreeItem) -> Result<bool> {
    match item.key.item_type {
        TYPE_METADATA_RECORD if item.data.len() >= EXTENT_RECORD_SIZE => {
            discover_record(ctx, item, true)?;
            Ok(true)
        }
        TYPE_EXTENT_RECORD
            if item.key.offset == ctx.node_size.as_u64()
                && item.data.len() >= EXTENT_RECORD_SIZE =>
        {
            let header = ExtentRecordHeader::parse(&item.data)
                .map_err(|err| malformed(LogicalAddress(item.key.objectid), err))?;
            if header.is_tree_node() {
                discover_record(ctx, item, false)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        _ => Ok(false),
    }
}

/// Secure one node of destination space: the rolling destination region
/// first, then any writable non-relocating region of the same kind, then
/// a freshly provisioned region. Failure to secure space is `DiskFull`.
fn select_destination(
    volume: &Volume,
    kind: u64,
    node_size: NodeSize,
    rolling: &mut Option<Arc<Region>>,
    undo: &mut UndoLog,
    provisioner: &mut dyn RegionProvisioner,
) -> Result<LogicalAddress> {
    if let Some(current) = rolling.as_ref() {
        if let Some(address) = take_node_span(current, node_size, undo) {
            return Ok(address);
        }
    }

    let mut regions = volume.lock_regions();
    for candidate in regions.iter() {
        if rolling
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, candidate))
        {
            continue;
        }
        if candidate.kind != kind {
            continue;
        }
        {
            let state = candidate.lock();
            if state.readonly || state.relocating {
                continue;
            }
            if candidate.length.saturating_sub(state.used) < node_size.as_u64() {
                continue;
            }
        }
        if let Some(address) = take_node_span(candidate, node_size, undo) {
            *rolling = Some(Arc::clone(candidate));
            return Ok(address);
        }
    }

    let fresh = provisioner.provision(kind).map_err(|_| BalanceError::DiskFull)?;
    debug!(region = fresh.start.0, kind, "provisioned destination region");
    regions.push(Arc::clone(&fresh));
    drop(regions);

    let address = take_node_span(&fresh, node_size, undo).ok_or(BalanceError::DiskFull)?;
    *rolling = Some(fresh);
    Ok(address)
}

/// Claim one node-sized span from `region` under its lock, adjusting the
/// usage counter and recording the inverse operations.
fn take_node_span(
    region: &Arc<Region>,
    node_size: NodeSize,
    undo: &mut UndoLog,
) -> Option<LogicalAddress> {
    let len = node_size.as_u64();
    let start = {
        let mut state = region.lock();
        let start = state.find_span(len)?;
        state.take_span(start, len);
        state.adjust_used(len as i64);
        start
    };
    undo.record(UndoOp::RegionSpanTake {
        region: Arc::clone(region),
        start,
        len,
    });
    undo.record(UndoOp::RegionUsage {
        region: Arc::clone(region),
        delta: len as i64,
    });
    Some(LogicalAddress(start))
}

/// Repoint every resolved parent's child slot from the record's old
/// address to `new_address`, in both the parent's staging buffer and its
/// live in-memory node.
fn patch_parents(
    batch: &mut Batch,
    idx: RecordIdx,
    new_address: LogicalAddress,
    undo: &mut UndoLog,
) -> Result<()> {
    let old_address = batch.get(idx).old_address;
    let nrefs = batch.get(idx).refs.len();
    for ref_idx in 0..nrefs {
        let Some(parent_idx) = batch.get(idx).refs[ref_idx].parent else {
            continue;
        };
        {
            let parent = batch.get_mut(parent_idx);
            patch_child_pointer(&mut parent.node, old_address, new_address).map_err(|err| {
                BalanceError::storage(format!(
                    "patching parent of node {old_address}: {err}"
                ))
            })?;
        }
        if let Some(node) = batch.get(parent_idx).cached.clone() {
            for slot in node.patch_children(old_address, new_address) {
                undo.record(UndoOp::CacheChild {
                    node: Arc::clone(&node),
                    slot,
                    previous: old_address,
                });
            }
        }
    }
    Ok(())
}

/// Propagate `new_address` into the root pointer of every tree for which
/// this record is the top: the in-memory holder always, the superblock
/// for the two distinguished trees, and the persisted root record when it
/// still references the old address.
fn patch_roots(
    volume: &Volume,
    overlay: &mut TreeOverlay<'_>,
    roots: &[Arc<RootEntry>],
    batch: &Batch,
    idx: RecordIdx,
    new_address: LogicalAddress,
    undo: &mut UndoLog,
) -> Result<()> {
    let record = batch.get(idx);
    let old_address = record.old_address;
    for slot in &record.refs {
        if !slot.top {
            continue;
        }
        let NodeRef::TreeOwned { tree } = slot.target else {
            continue;
        };
        let root = roots
            .iter()
            .find(|root| root.id == tree)
            .cloned()
            .ok_or_else(|| BalanceError::not_found(format!("owning tree {tree} has no root")))?;

        let previous = {
            let mut state = root.lock();
            let previous = state.root_address;
            state.root_address = new_address;
            previous
        };
        undo.record(UndoOp::RootAddress {
            root: Arc::clone(&root),
            previous,
        });

        if root.id == ROOT_TREE_ID {
            let mut sb = volume.lock_superblock();
            undo.record(UndoOp::SuperRootAddr {
                previous: sb.root_tree_addr,
            });
            sb.root_tree_addr = new_address;
        } else if root.id == CHUNK_TREE_ID {
            let mut sb = volume.lock_superblock();
            undo.record(UndoOp::SuperChunkAddr {
                previous: sb.chunk_tree_addr,
            });
            sb.chunk_tree_addr = new_address;
        } else {
            let record_copy = root.lock().record;
            if record_copy.block_number == old_address.0 {
                let mut updated = record_copy;
                updated.block_number = new_address.0;
                root.lock().record = updated;
                undo.record(UndoOp::RootRecordSet {
                    root: Arc::clone(&root),
                    previous: record_copy,
                });

                let anchor = ItemKey::new(tree.0, TYPE_ROOT_RECORD, 0);
                let item = overlay
                    .find(ROOT_TREE_ID, anchor)?
                    .filter(|item| {
                        item.key.objectid == tree.0 && item.key.item_type == TYPE_ROOT_RECORD
                    })
                    .ok_or_else(|| {
                        BalanceError::not_found(format!("root record for tree {tree}"))
                    })?;
                overlay.delete(ROOT_TREE_ID, item.key)?;
                overlay.insert(ROOT_TREE_ID, item.key, updated.encode())?;
            }
        }
    }
    Ok(())
}

/// Stamp the node's own address, refresh its checksum over everything
/// after the checksum field, and hand the buffer to the address-ordered
/// write queue.
fn finalize_node(
    batch: &mut Batch,
    idx: RecordIdx,
    new_address: LogicalAddress,
    undo: &mut UndoLog,
    pending: &mut Vec<PendingWrite>,
) -> Result<()> {
    let record = batch.get_mut(idx);
    set_node_address(&mut record.node, new_address).map_err(|err| {
        BalanceError::storage(format!("finalizing node {}: {err}", record.old_address))
    })?;
    if let Some(cached) = record.cached.clone() {
        let previous = cached.address();
        cached.set_address(new_address);
        undo.record(UndoOp::CacheAddress {
            node: cached,
            previous,
        });
    }
    refresh_node_checksum(&mut record.node);

    let data = std::mem::take(&mut record.node);
    let position = match pending.binary_search_by_key(&new_address, |write| write.address) {
        Ok(position) | Err(position) => position,
    };
    pending.insert(
        position,
        PendingWrite {
            address: new_address,
            data,
        },
    );
    Ok(())
}
