//! Parent resolution: connecting each tree-owned reference to the cached
//! ancestor node that must be patched, or classifying the node as the top
//! of its tree.

use crate::graph::{ensure_queued, GraphCtx, RecordIdx};
use cbfs_error::{BalanceError, Result};
use cbfs_ondisk::{node_first_key, NodeRef};
use cbfs_store::{NodeCache, RootEntry};
use cbfs_types::LogicalAddress;
use std::sync::Arc;
use tracing::warn;

/// Resolve every reference of the record at `idx`.
///
/// For a tree-owned reference, the owning tree is looked up by id, the
/// cached path from its root toward the child's first key is walked down
/// to one level above the child, and the ancestor found there is queued
/// as a dependency, transitively growing the batch. When the cached
/// chain does not reach that level the node is the top of its tree.
///
/// Shared-parent references are recognized but their parent patch is not
/// resolved here; they are reported and left without a parent.
pub(crate) fn resolve_record(
    ctx: &mut GraphCtx<'_, '_>,
    cache: &NodeCache,
    roots: &[Arc<RootEntry>],
    idx: RecordIdx,
) -> Result<()> {
    let (child_level, first_key) = {
        let record = ctx.batch.get(idx);
        let key = node_first_key(&record.node).map_err(|err| {
            BalanceError::storage(format!(
                "node at {} has no readable first key: {err}",
                record.old_address
            ))
        })?;
        (record.level, key)
    };

    let nrefs = ctx.batch.get(idx).refs.len();
    for ref_idx in 0..nrefs {
        match ctx.batch.get(idx).refs[ref_idx].target {
            NodeRef::TreeOwned { tree } => {
                let root = roots
                    .iter()
                    .find(|root| root.id == tree)
                    .cloned()
                    .ok_or_else(|| {
                        BalanceError::not_found(format!("owning tree {tree} has no root"))
                    })?;
                let root_address = root.lock().root_address;
                match cache.ancestor_above(root_address, &first_key, child_level) {
                    Some(ancestor) => {
                        let parent_idx = ensure_queued(ctx, ancestor.address())?;
                        ctx.batch.get_mut(idx).refs[ref_idx].parent = Some(parent_idx);
                    }
                    None => {
                        ctx.batch.get_mut(idx).refs[ref_idx].top = true;
                    }
                }
            }
            NodeRef::SharedByParent { parent } => {
                // Parent patching for shared references is a known gap:
                // no parent is registered and processing continues.
                shared_ref_unresolved(ctx.batch.get(idx).old_address, parent);
            }
        }
    }
    Ok(())
}

fn shared_ref_unresolved(node: LogicalAddress, parent: LogicalAddress) {
    warn!(
        node = node.0,
        parent = parent.0,
        "shared reference left unresolved; parent slot will not be patched"
    );
}
