#![forbid(unsafe_code)]
//! Online metadata relocation for cbfs.
//!
//! Moves whole tree nodes out of a chosen region while the volume stays
//! mounted, so the region can be freed, shrunk, or reclassified. One pass
//! ([`balance_chunk`]) discovers every node and reference living in the
//! region, reconstructs the reference graph connecting each node to its
//! parent or owning tree, secures destination space, rewrites the nodes
//! and their parent/root pointers level 0 upward, and commits or fully
//! unwinds the batch. The driver ([`start_balance`]) drains each eligible
//! metadata region by repeating the pass until it reports no further
//! candidates.
//!
//! Module map: `graph` builds the reference graph (discovery, overflow
//! reference reconstruction, batch arena), `resolve` connects references
//! to cached ancestors or classifies tops of trees, `encode` serializes
//! replacement extent records under the inline budget, `pass` is the
//! orchestrator.

mod encode;
mod graph;
mod pass;
mod resolve;

pub use pass::balance_chunk;

use cbfs_error::{BalanceError, Result};
use cbfs_store::Volume;
use cbfs_types::REGION_METADATA;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Spawn the balance worker for `volume`.
///
/// Rejects `AlreadyRunning` while a drain worker is active and `ReadOnly`
/// on a read-only volume; otherwise returns immediately with the worker
/// running in the background. A finished worker's handle is reaped here,
/// so a later call can start a new drain.
pub fn start_balance(volume: &Arc<Volume>) -> Result<()> {
    let mut slot = volume.lock_balance();
    if let Some(worker) = slot.worker.take() {
        if worker.is_finished() {
            let _ = worker.join();
        } else {
            slot.worker = Some(worker);
            return Err(BalanceError::AlreadyRunning);
        }
    }
    if volume.is_readonly() {
        return Err(BalanceError::ReadOnly);
    }

    slot.last_error = None;
    let worker_volume = Arc::clone(volume);
    let worker = thread::Builder::new()
        .name("cbfs-balance".to_owned())
        .spawn(move || drain_eligible(&worker_volume))
        .map_err(|err| BalanceError::storage(format!("spawning balance worker: {err}")))?;
    slot.worker = Some(worker);
    Ok(())
}

/// Drain every eligible region: metadata kind, writable, not already
/// relocating.
///
/// All selected regions are marked `relocating` before any drain starts,
/// so none of them is picked as a destination and relocated nodes only
/// flow into regions outside the selection (or freshly provisioned
/// ones). Regions are then drained one at a time; a failing pass aborts
/// that region's drain and is recorded in the balance slot, but later
/// regions still run.
pub fn drain_eligible(volume: &Volume) {
    let mut selected = Vec::new();
    for region in volume.regions_snapshot() {
        let claimed = {
            let mut state = region.lock();
            let eligible =
                region.kind & REGION_METADATA != 0 && !state.readonly && !state.relocating;
            if eligible {
                state.relocating = true;
            }
            eligible
        };
        if claimed {
            selected.push(region);
        }
    }

    for region in selected {
        loop {
            match balance_chunk(volume, &region) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(region = region.start.0, "region fully drained");
                    break;
                }
                Err(err) => {
                    warn!(region = region.start.0, error = %err, "drain aborted for region");
                    volume.lock_balance().last_error = Some(err);
                    break;
                }
            }
        }

        region.lock().relocating = false;
    }
}
