//! Status aggregation — maps per-device outcomes to one rollout status.

use std::collections::HashSet;

use fleetgrid_state::{DispatchRecord, DispatchStatus, Rollout, RolloutStatus};

/// Compute a rollout's status from its dispatch record statuses.
///
/// Any `Error` makes the rollout `Error`. A non-empty set where every record
/// is `Complete` makes it `Success`. Anything else is still `Building`.
pub fn aggregate(statuses: &[DispatchStatus]) -> RolloutStatus {
    if statuses.contains(&DispatchStatus::Error) {
        return RolloutStatus::Error;
    }
    if !statuses.is_empty() && statuses.iter().all(|s| *s == DispatchStatus::Complete) {
        return RolloutStatus::Success;
    }
    RolloutStatus::Building
}

/// Resolve the status to persist for a rollout given its current records.
///
/// A rollout carrying a recorded failure stays `Error`. Success is held back
/// while some targeted device has no record yet, since fan-out is then still
/// in progress.
pub fn resolve(rollout: &Rollout, records: &[DispatchRecord]) -> RolloutStatus {
    if rollout.failure.is_some() {
        return RolloutStatus::Error;
    }
    let statuses: Vec<DispatchStatus> = records.iter().map(|r| r.status).collect();
    match aggregate(&statuses) {
        RolloutStatus::Success => {
            let covered: HashSet<_> = records.iter().map(|r| r.device_id).collect();
            if rollout.device_ids.iter().all(|id| covered.contains(id)) {
                RolloutStatus::Success
            } else {
                RolloutStatus::Building
            }
        }
        status => status,
    }
}
