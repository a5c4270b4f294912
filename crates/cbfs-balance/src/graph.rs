//! Reference graph construction: discovering extent records and
//! reconstructing their reference lists.
//!
//! Records live in an arena owned by the batch; references point at their
//! parent record through an index, never through the record itself, so
//! the record graph stays acyclic from the borrow checker's point of
//! view.

use cbfs_error::{BalanceError, Result};
use cbfs_ondisk::{
    decode_inline_refs, ExtentRecordHeader, NodeRef, EXTENT_RECORD_SIZE,
    EXTENT_RECORD_TRAILER_SIZE,
};
use cbfs_store::{CachedNode, TreeItem, TreeOverlay, UndoLog, UndoOp, Volume};
use cbfs_types::{
    read_le_u64, ItemKey, LogicalAddress, NodeSize, EXTENT_TREE_ID, TYPE_EXTENT_RECORD,
    TYPE_METADATA_RECORD, TYPE_SHARED_PARENT_REF, TYPE_TREE_OWNED_REF,
};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

/// Stable handle of a record within its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordIdx(pub usize);

/// One reference of a record, plus its resolution state.
#[derive(Debug)]
pub(crate) struct RefSlot {
    pub target: NodeRef,
    /// Record of the resolved parent node, once known.
    pub parent: Option<RecordIdx>,
    /// The node is the top of its tree for this reference: its new
    /// address goes into a root pointer, not a parent slot.
    pub top: bool,
}

/// Unit of work for one node being moved.
pub(crate) struct RelocationRecord {
    pub old_address: LogicalAddress,
    /// Assigned once destination space is secured.
    pub new_address: Option<LogicalAddress>,
    /// Raw node bytes; loaded lazily, handed to the write scheduler at
    /// finalization.
    pub node: Vec<u8>,
    pub extent: ExtentRecordHeader,
    pub level: u8,
    pub refs: Vec<RefSlot>,
    /// Live in-memory node, when the cache holds one.
    pub cached: Option<Arc<CachedNode>>,
}

/// Arena of relocation records, deduplicated by address.
#[derive(Default)]
pub(crate) struct Batch {
    records: Vec<RelocationRecord>,
    by_address: HashMap<u64, RecordIdx>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, idx: RecordIdx) -> &RelocationRecord {
        &self.records[idx.0]
    }

    pub fn get_mut(&mut self, idx: RecordIdx) -> &mut RelocationRecord {
        &mut self.records[idx.0]
    }

    pub fn lookup(&self, address: LogicalAddress) -> Option<RecordIdx> {
        self.by_address.get(&address.0).copied()
    }

    fn push(&mut self, record: RelocationRecord) -> RecordIdx {
        let idx = RecordIdx(self.records.len());
        self.by_address.insert(record.old_address.0, idx);
        self.records.push(record);
        idx
    }
}

/// Borrowed context threaded through discovery and resolution.
pub(crate) struct GraphCtx<'g, 'a> {
    pub overlay: &'g mut TreeOverlay<'a>,
    pub undo: &'g mut UndoLog,
    pub volume: &'g Volume,
    pub batch: &'g mut Batch,
    pub node_size: NodeSize,
}

pub(crate) fn malformed(address: LogicalAddress, detail: impl Display) -> BalanceError {
    BalanceError::MalformedExtentRecord {
        address: address.0,
        detail: detail.to_string(),
    }
}

/// Discover the node described by `item`, an extent record located in the
/// extent tree: delete the item, release its span back to the owning
/// region, reconstruct the full reference list (inline + overflow), and
/// queue a new relocation record.
///
/// The caller is responsible for address deduplication (see
/// [`ensure_queued`]); `item` must not describe an already-queued node.
pub(crate) fn discover_record(
    ctx: &mut GraphCtx<'_, '_>,
    item: &TreeItem,
    skinny: bool,
) -> Result<RecordIdx> {
    let address = LogicalAddress(item.key.objectid);
    let header =
        ExtentRecordHeader::parse(&item.data).map_err(|err| malformed(address, err))?;

    let inline_start = if skinny {
        EXTENT_RECORD_SIZE
    } else {
        EXTENT_RECORD_SIZE + EXTENT_RECORD_TRAILER_SIZE
    };
    if item.data.len() < inline_start {
        return Err(malformed(address, "inline section shorter than header"));
    }
    let mut refs =
        decode_inline_refs(&item.data[inline_start..]).map_err(|err| malformed(address, err))?;

    ctx.overlay.delete(EXTENT_TREE_ID, item.key)?;
    release_node_span(ctx, address);

    if (refs.len() as u64) < header.refcount {
        collect_overflow_refs(ctx, item.key, &mut refs)?;
    }

    if refs.len() as u64 != header.refcount {
        return Err(malformed(
            address,
            format!(
                "reference count mismatch: decoded {}, header says {}",
                refs.len(),
                header.refcount
            ),
        ));
    }

    let record = RelocationRecord {
        old_address: address,
        new_address: None,
        node: Vec::new(),
        extent: header,
        level: 0,
        refs: refs
            .into_iter()
            .map(|target| RefSlot {
                target,
                parent: None,
                top: false,
            })
            .collect(),
        cached: None,
    };
    Ok(ctx.batch.push(record))
}

/// Return the record for `address`, discovering and queueing it when it
/// is not yet part of the batch. This is how parent nodes enter the batch
/// even though they were outside the original region scan.
pub(crate) fn ensure_queued(
    ctx: &mut GraphCtx<'_, '_>,
    address: LogicalAddress,
) -> Result<RecordIdx> {
    if let Some(idx) = ctx.batch.lookup(address) {
        return Ok(idx);
    }

    let item = ctx
        .overlay
        .find(EXTENT_TREE_ID, ItemKey::first_for_object(address.0))?
        .filter(|item| item.key.objectid == address.0)
        .ok_or_else(|| {
            BalanceError::not_found(format!("extent record for node {address}"))
        })?;

    let skinny = match item.key.item_type {
        TYPE_METADATA_RECORD if item.data.len() >= EXTENT_RECORD_SIZE => true,
        TYPE_EXTENT_RECORD
            if item.key.offset == ctx.node_size.as_u64()
                && item.data.len() >= EXTENT_RECORD_SIZE =>
        {
            let header =
                ExtentRecordHeader::parse(&item.data).map_err(|err| malformed(address, err))?;
            if !header.is_tree_node() {
                return Err(malformed(address, "extent record lacks the tree-node flag"));
            }
            false
        }
        _ => {
            return Err(malformed(
                address,
                format!("no valid extent record shape at key {}", item.key),
            ));
        }
    };

    discover_record(ctx, &item, skinny)
}

/// Decrement the owning region's usage by one node and record the freed
/// span in its free-space index. Addresses outside every known region are
/// tolerated; the allocator owns those.
fn release_node_span(ctx: &mut GraphCtx<'_, '_>, address: LogicalAddress) {
    let Some(region) = ctx.volume.region_of(address) else {
        return;
    };
    let len = ctx.node_size.as_u64();
    {
        let mut state = region.lock();
        state.adjust_used(-(len as i64));
        state.put_span(address.0, len);
    }
    ctx.undo.record(UndoOp::RegionUsage {
        region: Arc::clone(&region),
        delta: -(len as i64),
    });
    ctx.undo.record(UndoOp::RegionSpanPut {
        region,
        start: address.0,
        len,
    });
}

/// Consume overflow reference items: subsequent tree items with the same
/// object id whose type matches either reference kind, in key order, until
/// the object id changes. Each is decoded and deleted.
fn collect_overflow_refs(
    ctx: &mut GraphCtx<'_, '_>,
    record_key: ItemKey,
    refs: &mut Vec<NodeRef>,
) -> Result<()> {
    let address = LogicalAddress(record_key.objectid);
    let mut cursor = record_key;
    while let Some(item) = ctx.overlay.next(EXTENT_TREE_ID, cursor)? {
        if item.key.objectid != record_key.objectid {
            break;
        }
        cursor = item.key;
        if item.key.item_type != TYPE_TREE_OWNED_REF
            && item.key.item_type != TYPE_SHARED_PARENT_REF
        {
            continue;
        }
        if item.data.len() < 8 {
            return Err(malformed(address, "overflow reference payload truncated"));
        }
        let payload = read_le_u64(&item.data, 0).map_err(|err| malformed(address, err))?;
        let node_ref = NodeRef::from_tag_payload(item.key.item_type, payload)
            .map_err(|err| malformed(address, err))?;
        refs.push(node_ref);
        ctx.overlay.delete(EXTENT_TREE_ID, item.key)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    //! Batch construction helpers shared by the engine's test modules.
    use super::*;

    pub(crate) fn push_record(
        batch: &mut Batch,
        old_address: LogicalAddress,
        refs: Vec<NodeRef>,
        new_address: Option<LogicalAddress>,
    ) -> RecordIdx {
        batch.push(RelocationRecord {
            old_address,
            new_address,
            node: Vec::new(),
            extent: ExtentRecordHeader {
                refcount: refs.len() as u64,
                generation: 7,
                flags: cbfs_types::EXTENT_FLAG_TREE_NODE,
            },
            level: 0,
            refs: refs
                .into_iter()
                .map(|target| RefSlot {
                    target,
                    parent: None,
                    top: false,
                })
                .collect(),
            cached: None,
        })
    }

    pub(crate) fn batch_with_record(
        refs: Vec<NodeRef>,
        new_address: Option<LogicalAddress>,
    ) -> (Batch, RecordIdx) {
        let mut batch = Batch::new();
        let idx = push_record(&mut batch, LogicalAddress(0x1000), refs, new_address);
        (batch, idx)
    }

    pub(crate) fn set_ref_parent(
        batch: &mut Batch,
        idx: RecordIdx,
        ref_idx: usize,
        parent: RecordIdx,
    ) {
        batch.get_mut(idx).refs[ref_idx].parent = Some(parent);
    }

    #[test]
    fn batch_deduplicates_by_address() {
        let mut batch = Batch::new();
        let a = push_record(&mut batch, LogicalAddress(0x1000), Vec::new(), None);
        let b = push_record(&mut batch, LogicalAddress(0x2000), Vec::new(), None);
        assert_eq!(batch.lookup(LogicalAddress(0x1000)), Some(a));
        assert_eq!(batch.lookup(LogicalAddress(0x2000)), Some(b));
        assert_eq!(batch.lookup(LogicalAddress(0x3000)), None);
        assert_eq!(batch.len(), 2);
    }
}
