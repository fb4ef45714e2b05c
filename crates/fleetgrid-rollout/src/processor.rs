//! Dispatch event processor — applies one completion event at a time.
//!
//! An event is matched to its dispatch record by correlation id, mapped to
//! a record status, and persisted. The owning rollout's status is then
//! recomputed in the store and, when it reaches `Success`, the fleet is
//! synced.
//!
//! # Ordering
//!
//! A `success` event is only committed after the reboot grace window. The
//! window is an async sleep taken *before* the record lock, and the record's
//! persisted status is re-read when the completion is finally written. An
//! `Error` committed while the completion waited therefore wins: failure
//! dominates regardless of arrival order.
//!
//! Shutdown cuts the window short: the completion is committed at once, and
//! the supervisor's interruption watchers wait for it before failing
//! rollouts that are still `Building`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use fleetgrid_state::{
    DispatchRecord, DispatchRecordId, DispatchStatus, Rollout, RolloutStatus, StateStore,
};

use crate::aggregator;
use crate::error::{RolloutError, RolloutResult};
use crate::event::{self, CompletionEvent, RemoteStatus};
use crate::fleet_sync::FleetSync;
use crate::notify::Notifier;
use crate::supervisor::RolloutSupervisor;

/// Result of applying one completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    /// The dispatch record as persisted after the event.
    pub record: DispatchRecord,
    /// Whether the event changed the record's status.
    pub applied: bool,
    /// Rollout status after recompute; `None` when no recompute ran.
    pub rollout_status: Option<RolloutStatus>,
}

/// Consumes dispatcher completion events.
pub struct DispatchEventProcessor {
    store: StateStore,
    fleet: FleetSync,
    notifier: Notifier,
    supervisor: Arc<RolloutSupervisor>,
    reboot_grace: Duration,
    locks: RecordLocks,
}

impl DispatchEventProcessor {
    pub fn new(
        store: StateStore,
        notifier: Notifier,
        supervisor: Arc<RolloutSupervisor>,
        reboot_grace: Duration,
    ) -> Self {
        Self {
            fleet: FleetSync::new(store.clone()),
            store,
            notifier,
            supervisor,
            reboot_grace,
            locks: RecordLocks::default(),
        }
    }

    /// Decode raw transport bytes and apply the event.
    pub async fn process_completion_event(&self, raw: &[u8]) -> RolloutResult<EventOutcome> {
        let event = event::decode(raw)?;
        self.handle_event(event).await
    }

    /// Apply an already decoded completion event.
    pub async fn handle_event(&self, event: CompletionEvent) -> RolloutResult<EventOutcome> {
        let Some(record) = self.store.find_dispatch_record(&event.correlation_id)? else {
            warn!(
                correlation_id = %event.correlation_id,
                status = ?event.status,
                "no dispatch record for completion event, dropping"
            );
            return Err(RolloutError::NotFound(format!(
                "dispatch record for correlation id {}",
                event.correlation_id
            )));
        };
        debug!(
            record_id = record.id,
            rollout_id = record.rollout_id,
            status = ?event.status,
            timestamp = %event.timestamp,
            "completion event received"
        );

        let mut hold = None;
        let next = match &event.status {
            RemoteStatus::Running => {
                let _lock = self.locks.acquire(record.id).await;
                let transition = self.store.transition_dispatch_record(record.id, |current| {
                    matches!(current, DispatchStatus::Created | DispatchStatus::Running)
                        .then_some(DispatchStatus::Running)
                })?;
                return Ok(EventOutcome {
                    record: transition.record,
                    applied: transition.applied,
                    rollout_status: None,
                });
            }
            RemoteStatus::Success => {
                hold = Some(self.supervisor.hold_completion());
                debug!(
                    record_id = record.id,
                    grace = ?self.reboot_grace,
                    "waiting for device reboot before committing completion"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.reboot_grace) => {}
                    _ = self.supervisor.shutdown_token().cancelled() => {
                        warn!(
                            record_id = record.id,
                            correlation_id = %event.correlation_id,
                            "shutting down, committing completion before reboot grace elapsed"
                        );
                    }
                }
                DispatchStatus::Complete
            }
            RemoteStatus::Failure | RemoteStatus::Timeout => DispatchStatus::Error,
            RemoteStatus::Unrecognized(status) => {
                error!(
                    record_id = record.id,
                    correlation_id = %event.correlation_id,
                    %status,
                    "completion event status outside dispatcher schema"
                );
                DispatchStatus::Error
            }
        };

        let (transition, previous, rollout) = {
            let _lock = self.locks.acquire(record.id).await;
            let transition = self.store.transition_dispatch_record(record.id, |current| {
                match (next, current) {
                    (DispatchStatus::Complete, DispatchStatus::Error) => None,
                    _ => Some(next),
                }
            })?;
            let (previous, rollout) = self
                .store
                .refresh_rollout_status(record.rollout_id, aggregator::resolve)?;
            (transition, previous, rollout)
        };
        drop(hold);

        if !transition.applied && transition.previous == DispatchStatus::Error {
            info!(
                record_id = record.id,
                "dispatch record already failed, completion discarded"
            );
        }

        let rollout_status = rollout.status;
        settle(&self.fleet, &self.notifier, &self.supervisor, previous, &rollout).await?;
        Ok(EventOutcome {
            record: transition.record,
            applied: transition.applied,
            rollout_status: Some(rollout_status),
        })
    }
}

/// Run the side effects of a rollout entering a terminal status: release of
/// its interruption watcher, fleet sync on success, then a best-effort
/// notification.
pub(crate) async fn settle(
    fleet: &FleetSync,
    notifier: &Notifier,
    supervisor: &RolloutSupervisor,
    previous: RolloutStatus,
    rollout: &Rollout,
) -> RolloutResult<()> {
    if !rollout.status.is_terminal() {
        return Ok(());
    }
    supervisor.release(rollout.id);
    if previous == rollout.status {
        return Ok(());
    }
    info!(rollout_id = rollout.id, status = ?rollout.status, "rollout settled");

    let synced = match rollout.status {
        RolloutStatus::Success => fleet.sync_rollout(rollout.id).map(|_| ()),
        _ => Ok(()),
    };
    if let Err(e) = &synced {
        error!(rollout_id = rollout.id, error = %e, "fleet sync failed");
    }

    // Already logged by the notifier; the rollout's status stands.
    let _ = notifier.emit(rollout).await;
    synced
}

/// Per-record async locks, pruned once nobody holds or waits on them.
#[derive(Default)]
struct RecordLocks {
    inner: Arc<Mutex<HashMap<DispatchRecordId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RecordLocks {
    async fn acquire(&self, record_id: DispatchRecordId) -> RecordLockGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(record_id).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        RecordLockGuard {
            record_id,
            map: Arc::clone(&self.inner),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct RecordLockGuard {
    record_id: DispatchRecordId,
    map: Arc<Mutex<HashMap<DispatchRecordId, Arc<tokio::sync::Mutex<()>>>>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: no other holder or waiter.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.record_id);
        }
    }
}
