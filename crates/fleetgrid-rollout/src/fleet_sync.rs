//! Fleet sync — propagates a successful rollout to its devices.

use tracing::{debug, info};

use fleetgrid_state::{ImageId, RolloutId, RolloutStatus, StateStore};

use crate::error::{RolloutError, RolloutResult};

/// What a fleet sync wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSyncOutcome {
    /// Image the devices now point at.
    pub image_id: ImageId,
    /// Whether a newer successful image exists in the same image set.
    pub update_available: bool,
    /// Devices actually written (same account, known ids).
    pub devices_updated: u32,
}

/// Points a successful rollout's devices at their new image.
#[derive(Clone)]
pub struct FleetSync {
    store: StateStore,
}

impl FleetSync {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Sync the fleet fields of every device targeted by `rollout_id`.
    ///
    /// Returns `None` when the rollout is not in `Success`. A successful
    /// rollout without a commit is an integrity defect and fails with
    /// `MissingCommit`.
    pub fn sync_rollout(&self, rollout_id: RolloutId) -> RolloutResult<Option<FleetSyncOutcome>> {
        let rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))?;

        if rollout.status != RolloutStatus::Success {
            debug!(rollout_id, status = ?rollout.status, "rollout not successful, fleet sync skipped");
            return Ok(None);
        }

        let commit = rollout
            .commit
            .as_ref()
            .ok_or(RolloutError::MissingCommit(rollout_id))?;

        let image = self
            .store
            .find_image_by_commit(&rollout.account, &commit.os_tree_commit)?
            .ok_or_else(|| {
                RolloutError::NotFound(format!(
                    "image for commit {} of rollout {rollout_id}",
                    commit.id
                ))
            })?;

        let update_available = !self
            .store
            .newer_successful_images(&rollout.account, image.image_set_id, image.created_at)?
            .is_empty();

        let devices_updated = self.store.update_device_fleet_fields(
            &rollout.account,
            &rollout.device_ids,
            image.id,
            update_available,
        )?;

        info!(
            rollout_id,
            image_id = image.id,
            update_available,
            devices_updated,
            "fleet synced"
        );
        Ok(Some(FleetSyncOutcome {
            image_id: image.id,
            update_available,
            devices_updated,
        }))
    }
}
