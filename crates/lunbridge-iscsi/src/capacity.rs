//! Capacity change detection and refresh
//!
//! A target that grows a LUN reports it as a unit attention on the next
//! command. The session re-reads the capacity and retries the command; the
//! refreshed block count is pushed to the block device here.

use crate::client::{IscsiContext, ScsiCommand, TaskCompletion, TaskData, TaskTag};

use lunbridge_bdev::Bdev;
use lunbridge_common::{
    ASCQ_CAPACITY_DATA_HAS_CHANGED, Error, Result, ScsiStatus, Sense, SenseKey,
};
use tracing::{error, info, warn};

/// Check for CHECK CONDITION / UNIT ATTENTION / "capacity data has changed"
#[must_use]
pub fn is_capacity_changed(status: ScsiStatus, sense: Sense) -> bool {
    status == ScsiStatus::CheckCondition
        && sense.key == SenseKey::UnitAttention
        && sense.ascq == ASCQ_CAPACITY_DATA_HAS_CHANGED
}

/// Issue READ CAPACITY16. A submit failure is logged and yields `None`.
pub fn request_refresh(conn: &mut dyn IscsiContext, lun: u32) -> Option<TaskTag> {
    match conn.submit(lun, ScsiCommand::ReadCapacity16) {
        Ok(tag) => Some(tag),
        Err(e) => {
            error!("failed to send READ CAPACITY16 for LUN {lun}: {}", e.error);
            None
        }
    }
}

/// Apply a READ CAPACITY16 result. The block count only grows.
pub fn apply(bdev: &Bdev, returned_lba: u64) -> Result<u64> {
    let current = bdev.num_blocks();
    let requested = returned_lba.saturating_add(1);
    if requested <= current {
        error!(
            "{}: refusing capacity change from {current} to {requested} blocks",
            bdev.name()
        );
        return Err(Error::CannotShrink { current, requested });
    }
    bdev.notify_blockcnt_change(requested)?;
    info!("{}: capacity grew to {requested} blocks", bdev.name());
    Ok(requested)
}

/// Handle the completion of a refresh issued by [`request_refresh`]
pub fn on_refresh_complete(bdev: &Bdev, completion: &TaskCompletion) {
    if !completion.is_good() {
        error!(
            "{}: READ CAPACITY16 failed: {} (sense {:?})",
            bdev.name(),
            completion.status,
            completion.sense
        );
        return;
    }
    match completion.data {
        TaskData::Capacity { returned_lba, .. } => {
            // Rejections are logged by apply
            let _ = apply(bdev, returned_lba);
        }
        ref other => warn!("{}: READ CAPACITY16 returned {other:?}", bdev.name()),
    }
}
