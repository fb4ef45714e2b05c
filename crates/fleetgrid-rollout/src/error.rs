//! Rollout engine error types.

use std::fmt;

use thiserror::Error;

use fleetgrid_state::RolloutId;

/// The external service a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    RepoBuilder,
    ScriptPublisher,
    Dispatcher,
    EventBus,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RepoBuilder => "repo builder",
            Self::ScriptPublisher => "script publisher",
            Self::Dispatcher => "dispatcher",
            Self::EventBus => "event bus",
        };
        f.write_str(name)
    }
}

/// Errors produced by the rollout engine.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A rollout reached success without a resolvable commit.
    #[error("rollout {0} has no commit defined")]
    MissingCommit(RolloutId),

    #[error("{kind} failed: {source}")]
    Collaborator {
        kind: Collaborator,
        source: anyhow::Error,
    },

    /// Fan-out stopped because the process is shutting down.
    #[error("rollout {0} interrupted by shutdown")]
    Interrupted(RolloutId),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

impl RolloutError {
    pub(crate) fn collaborator(kind: Collaborator, source: anyhow::Error) -> Self {
        Self::Collaborator { kind, source }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
