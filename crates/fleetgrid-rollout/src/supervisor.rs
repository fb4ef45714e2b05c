//! Rollout supervisor — in-flight accounting and interruption watchers.
//!
//! Every rollout being fanned out is registered with the supervisor. The
//! registration bumps an in-flight counter (so a supervised shutdown can
//! wait for fan-out to drain) and spawns a watcher task. The watcher lives
//! until the rollout reaches a terminal status and is released, or until
//! shutdown. On shutdown it waits for completions cut short in their reboot
//! grace window to commit, then marks a still-`Building` rollout `Error` so
//! no rollout is left ambiguous after the process exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use fleetgrid_state::{RolloutId, RolloutStatus, StateStore};

/// Failure reason recorded on rollouts cut short by shutdown.
pub const INTERRUPTED_REASON: &str = "interrupted by process shutdown";

/// Tracks in-flight rollouts and guards them against interruption.
pub struct RolloutSupervisor {
    state: StateStore,
    shutdown: CancellationToken,
    in_flight: Arc<watch::Sender<usize>>,
    /// Success completions waiting out (or cut short of) their grace window.
    pending: Arc<watch::Sender<usize>>,
    watchers: Mutex<HashMap<RolloutId, CancellationToken>>,
    tasks: TaskTracker,
}

impl RolloutSupervisor {
    /// Create a supervisor listening on the given shutdown token.
    pub fn new(state: StateStore, shutdown: CancellationToken) -> Self {
        let (in_flight, _) = watch::channel(0);
        let (pending, _) = watch::channel(0);
        Self {
            state,
            shutdown,
            in_flight: Arc::new(in_flight),
            pending: Arc::new(pending),
            watchers: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// The token whose cancellation means the process is shutting down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Number of rollouts currently being fanned out.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Number of rollouts with a live interruption watcher.
    pub fn watching(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a rollout for fan-out and spawn its interruption watcher.
    ///
    /// Dropping the returned guard ends the fan-out accounting only; the
    /// watcher stays until [`release`](Self::release) or shutdown.
    pub fn track(&self, rollout_id: RolloutId) -> RolloutGuard {
        self.in_flight.send_modify(|n| *n += 1);

        let released = CancellationToken::new();
        let previous = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rollout_id, released.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.tasks.spawn(watch_rollout(
            rollout_id,
            self.state.clone(),
            self.shutdown.clone(),
            released,
            self.pending.subscribe(),
        ));
        debug!(rollout_id, in_flight = self.in_flight(), "rollout registered");

        RolloutGuard {
            rollout_id,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Stop watching a rollout that no longer needs interruption handling.
    pub fn release(&self, rollout_id: RolloutId) {
        let watcher = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&rollout_id);
        if let Some(watcher) = watcher {
            watcher.cancel();
            debug!(rollout_id, "rollout watcher released");
        }
    }

    /// Mark a success completion as pending commit.
    ///
    /// Watchers hold off marking rollouts interrupted until every hold is
    /// dropped.
    pub fn hold_completion(&self) -> CompletionHold {
        self.pending.send_modify(|n| *n += 1);
        CompletionHold {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Wait until no rollout is in flight, up to `timeout`.
    ///
    /// Returns `true` if the count drained in time.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                info!(remaining = self.in_flight(), "rollouts still in flight at shutdown deadline");
                false
            }
        }
    }

    /// Wait for every watcher to exit, up to `timeout`.
    ///
    /// Call after the shutdown token fired; returns `true` once every
    /// interrupted rollout has been persisted.
    pub async fn wait_watchers(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let done = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        if !done {
            info!(remaining = self.tasks.len(), "rollout watchers still running at shutdown deadline");
        }
        done
    }
}

/// Fan-out registration of one rollout.
pub struct RolloutGuard {
    rollout_id: RolloutId,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for RolloutGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        debug!(rollout_id = self.rollout_id, "rollout fan-out finished");
    }
}

/// A success completion not yet committed.
pub struct CompletionHold {
    pending: Arc<watch::Sender<usize>>,
}

impl Drop for CompletionHold {
    fn drop(&mut self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Wait for release or shutdown; on shutdown, fail a `Building` rollout.
async fn watch_rollout(
    rollout_id: RolloutId,
    state: StateStore,
    shutdown: CancellationToken,
    released: CancellationToken,
    mut pending: watch::Receiver<usize>,
) {
    tokio::select! {
        biased;
        _ = released.cancelled() => {}
        _ = shutdown.cancelled() => {
            let flushed = pending.wait_for(|n| *n == 0).await.is_ok();
            if !flushed {
                debug!(rollout_id, "completion holds dropped with the supervisor");
            }
            match mark_interrupted(&state, rollout_id) {
                Ok(true) => info!(rollout_id, "shutdown captured, rollout marked as error"),
                Ok(false) => debug!(rollout_id, "shutdown captured, rollout already settled"),
                Err(e) => error!(rollout_id, error = %e, "failed to mark interrupted rollout"),
            }
        }
    }
}

/// Mark a rollout `Error` if it is still `Building`. Returns whether it changed.
pub(crate) fn mark_interrupted(
    state: &StateStore,
    rollout_id: RolloutId,
) -> Result<bool, fleetgrid_state::StateError> {
    let (_, changed) = state.modify_rollout(rollout_id, |rollout| {
        if rollout.status != RolloutStatus::Building {
            return false;
        }
        rollout.status = RolloutStatus::Error;
        rollout.failure = Some(INTERRUPTED_REASON.to_string());
        true
    })?;
    Ok(changed)
}

/// Fail every rollout left `Building` by an unclean exit.
///
/// Run at startup before any rollout is tracked, and once more after a
/// supervised shutdown has drained.
pub fn recover_interrupted_rollouts(
    state: &StateStore,
) -> Result<Vec<RolloutId>, fleetgrid_state::StateError> {
    let mut recovered = Vec::new();
    for rollout in state.list_rollouts_by_status(RolloutStatus::Building)? {
        if mark_interrupted(state, rollout.id)? {
            info!(rollout_id = rollout.id, "stale building rollout marked as error");
            recovered.push(rollout.id);
        }
    }
    Ok(recovered)
}
