//! Update orchestrator — plans rollouts and fans them out to devices.
//!
//! `create_update` drives one rollout from `Created` through artifact build,
//! script publication and per-device dispatch. Completion of each device is
//! reported later through the [`DispatchEventProcessor`](crate::processor).

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use fleetgrid_state::{
    DeviceId, DispatchStatus, ImageId, NewDispatchRecord, Rollout, RolloutId, RolloutStatus,
    StateStore,
};

use crate::aggregator;
use crate::collaborators::{
    DispatchRequest, DispatchResponse, Dispatcher, RemoteInfo, RepoBuilder, ScriptPublisher,
};
use crate::error::{Collaborator, RolloutError, RolloutResult};
use crate::fleet_sync::FleetSync;
use crate::notify::Notifier;
use crate::processor::settle;
use crate::supervisor::{self, RolloutSupervisor};

/// A request to update devices of one account to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub account: String,
    pub image_id: ImageId,
    pub device_ids: Vec<DeviceId>,
}

/// The external services a rollout is carried out with.
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn RepoBuilder>,
    pub publisher: Arc<dyn ScriptPublisher>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

/// Creates rollouts and fans them out.
pub struct UpdateOrchestrator {
    store: StateStore,
    collaborators: Collaborators,
    fleet: FleetSync,
    notifier: Notifier,
    supervisor: Arc<RolloutSupervisor>,
    remote_name: String,
}

impl UpdateOrchestrator {
    pub fn new(
        store: StateStore,
        collaborators: Collaborators,
        notifier: Notifier,
        supervisor: Arc<RolloutSupervisor>,
        remote_name: impl Into<String>,
    ) -> Self {
        Self {
            fleet: FleetSync::new(store.clone()),
            store,
            collaborators,
            notifier,
            supervisor,
            remote_name: remote_name.into(),
        }
    }

    pub fn supervisor(&self) -> &Arc<RolloutSupervisor> {
        &self.supervisor
    }

    /// Record a new rollout in `Created` targeting the image's commit.
    ///
    /// The image and every device must exist and belong to the account.
    /// Duplicate device ids are collapsed, keeping request order.
    pub fn plan_update(&self, request: UpdateRequest) -> RolloutResult<Rollout> {
        if request.device_ids.is_empty() {
            return Err(RolloutError::Validation(
                "an update needs at least one device".to_string(),
            ));
        }

        let image = self
            .store
            .get_image(request.image_id)?
            .filter(|img| img.account == request.account)
            .ok_or_else(|| RolloutError::NotFound(format!("image {}", request.image_id)))?;

        let mut seen = HashSet::new();
        let mut device_ids = Vec::with_capacity(request.device_ids.len());
        for device_id in request.device_ids {
            if !seen.insert(device_id) {
                continue;
            }
            let device = self
                .store
                .get_device(device_id)?
                .ok_or_else(|| RolloutError::NotFound(format!("device {device_id}")))?;
            if device.account != request.account {
                return Err(RolloutError::Validation(format!(
                    "device {device_id} does not belong to account {}",
                    request.account
                )));
            }
            device_ids.push(device_id);
        }

        let rollout = self
            .store
            .create_rollout(&request.account, Some(image.commit), device_ids)?;
        info!(
            rollout_id = rollout.id,
            account = %rollout.account,
            image_id = image.id,
            devices = rollout.device_ids.len(),
            "rollout planned"
        );
        Ok(rollout)
    }

    /// Whether every given image belongs to one image set of the account.
    pub fn validate_update_selection(
        &self,
        account: &str,
        image_ids: &[ImageId],
    ) -> RolloutResult<bool> {
        let sets = self.store.count_image_sets(account, image_ids)?;
        debug!(%account, images = image_ids.len(), sets, "update selection checked");
        Ok(sets == 1)
    }

    /// Build, publish, and dispatch a planned rollout.
    ///
    /// Once the rollout is `Building`, any failure leaves it `Error` with the
    /// reason recorded.
    pub async fn create_update(&self, rollout_id: RolloutId) -> RolloutResult<Rollout> {
        let (rollout, started) = self.store.modify_rollout(rollout_id, |rollout| {
            if rollout.status != RolloutStatus::Created {
                return false;
            }
            rollout.status = RolloutStatus::Building;
            true
        })?;
        if !started {
            return Err(RolloutError::Validation(format!(
                "rollout {rollout_id} is {:?}, only created rollouts can be dispatched",
                rollout.status
            )));
        }
        info!(rollout_id, devices = rollout.device_ids.len(), "rollout building");

        let _fan_out = self.supervisor.track(rollout_id);
        let (previous, rollout) = match self.fan_out(rollout).await {
            Ok(dispatched) => dispatched,
            Err(RolloutError::Interrupted(id)) => {
                self.interrupt(id);
                return Err(RolloutError::Interrupted(id));
            }
            Err(e) => return Err(self.fail(rollout_id, e).await),
        };
        info!(rollout_id, status = ?rollout.status, "rollout dispatched");
        settle(&self.fleet, &self.notifier, &self.supervisor, previous, &rollout).await?;
        Ok(rollout)
    }

    /// Build the artifact, publish the script, dispatch every device, then
    /// recompute the rollout's status.
    async fn fan_out(&self, rollout: Rollout) -> RolloutResult<(RolloutStatus, Rollout)> {
        let rollout_id = rollout.id;
        let repo_url = self
            .collaborators
            .builder
            .build(rollout_id)
            .await
            .map_err(|e| RolloutError::collaborator(Collaborator::RepoBuilder, e))?;
        let (rollout, _) = self.store.modify_rollout(rollout_id, |rollout| {
            rollout.repo_url = Some(repo_url.clone());
            true
        })?;
        debug!(rollout_id, %repo_url, "repository built");

        let remote = RemoteInfo {
            remote_name: self.remote_name.clone(),
            remote_url: repo_url.clone(),
            content_url: repo_url,
            gpg_verify: false,
            rollout_id,
        };
        let script_url = self
            .collaborators
            .publisher
            .publish(&remote, &rollout.account)
            .await
            .map_err(|e| RolloutError::collaborator(Collaborator::ScriptPublisher, e))?;
        debug!(rollout_id, %script_url, "update script published");

        for &device_id in &rollout.device_ids {
            if self.supervisor.shutdown_token().is_cancelled() {
                warn!(rollout_id, device_id, "shutdown requested, fan-out stopped");
                return Err(RolloutError::Interrupted(rollout_id));
            }
            self.dispatch_device(&rollout, device_id, &script_url).await?;
        }

        Ok(self
            .store
            .refresh_rollout_status(rollout_id, aggregator::resolve)?)
    }

    /// Send one device its execution request and record the outcome.
    async fn dispatch_device(
        &self,
        rollout: &Rollout,
        device_id: DeviceId,
        script_url: &str,
    ) -> RolloutResult<()> {
        let Some(device) = self.store.get_device(device_id)? else {
            warn!(rollout_id = rollout.id, device_id, "targeted device no longer exists");
            self.store.append_dispatch_record(
                rollout.id,
                NewDispatchRecord {
                    device_id,
                    correlation_id: None,
                    script_url: script_url.to_string(),
                    status: DispatchStatus::Error,
                },
            )?;
            return Ok(());
        };

        // Each request owns its values; nothing is shared with the loop.
        let request = DispatchRequest {
            recipient: device.remote_client_id.clone(),
            script_url: script_url.to_string(),
            account: rollout.account.clone(),
        };
        let mut responses = self
            .collaborators
            .dispatcher
            .execute(&request)
            .await
            .map_err(|e| RolloutError::collaborator(Collaborator::Dispatcher, e))?;
        if responses.is_empty() {
            warn!(rollout_id = rollout.id, device_id, "dispatcher returned no response");
            responses.push(DispatchResponse {
                status_code: 0,
                correlation_id: None,
            });
        }

        for response in responses {
            let accepted = response.is_created();
            let status = if accepted {
                DispatchStatus::Created
            } else {
                DispatchStatus::Error
            };
            let record = self.store.append_dispatch_record(
                rollout.id,
                NewDispatchRecord {
                    device_id,
                    correlation_id: response.correlation_id,
                    script_url: request.script_url.clone(),
                    status,
                },
            )?;
            self.store.set_device_connected(device_id, accepted)?;
            if accepted {
                debug!(rollout_id = rollout.id, device_id, record_id = record.id, "device dispatched");
            } else {
                warn!(
                    rollout_id = rollout.id,
                    device_id,
                    status_code = response.status_code,
                    "dispatcher refused execution request"
                );
            }
        }
        Ok(())
    }

    /// Force the rollout to `Error`, recording `err` as the failure reason.
    ///
    /// If the failure cannot be persisted the rollout stays watched, so
    /// shutdown still marks it.
    async fn fail(&self, rollout_id: RolloutId, err: RolloutError) -> RolloutError {
        error!(rollout_id, error = %err, "rollout failed");

        let reason = err.to_string();
        let mut previous = RolloutStatus::Building;
        match self.store.modify_rollout(rollout_id, |r| {
            previous = r.status;
            r.status = RolloutStatus::Error;
            r.failure = Some(reason);
            true
        }) {
            Ok((failed, _)) => {
                self.supervisor.release(rollout_id);
                if previous != RolloutStatus::Error {
                    let _ = self.notifier.emit(&failed).await;
                }
            }
            Err(e) => error!(rollout_id, error = %e, "failed to persist rollout failure"),
        }
        err
    }

    /// Fail a rollout whose fan-out stopped for shutdown.
    fn interrupt(&self, rollout_id: RolloutId) {
        match supervisor::mark_interrupted(&self.store, rollout_id) {
            Ok(_) => self.supervisor.release(rollout_id),
            Err(e) => error!(rollout_id, error = %e, "failed to mark interrupted rollout"),
        }
    }

    /// Every rollout that targeted a device, ordered by id.
    pub fn updates_for_device(&self, device_id: DeviceId) -> RolloutResult<Vec<Rollout>> {
        if self.store.get_device(device_id)?.is_none() {
            return Err(RolloutError::NotFound(format!("device {device_id}")));
        }
        Ok(self.store.list_rollouts_for_device(device_id)?)
    }

    /// The published script of a rollout.
    pub async fn update_script(&self, rollout_id: RolloutId) -> RolloutResult<Vec<u8>> {
        let rollout = self
            .store
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))?;
        self.collaborators
            .publisher
            .fetch(&rollout.account, rollout_id)
            .await
            .map_err(|e| RolloutError::collaborator(Collaborator::ScriptPublisher, e))
    }

    /// Fail every rollout left `Building` by an unclean exit.
    pub fn recover_interrupted_rollouts(&self) -> RolloutResult<Vec<RolloutId>> {
        Ok(supervisor::recover_interrupted_rollouts(&self.store)?)
    }
}
