//! Contracts of the external services a rollout depends on.
//!
//! Implementations live outside this crate (see `fleetgrid-clients`). Each
//! call is bounded by the implementation's own timeout; a timeout surfaces
//! as an ordinary error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetgrid_state::RolloutId;

/// Values rendered into the device execution script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub remote_name: String,
    pub remote_url: String,
    pub content_url: String,
    pub gpg_verify: bool,
    pub rollout_id: RolloutId,
}

/// One execution request for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Remote-client identity of the device.
    pub recipient: String,
    pub script_url: String,
    pub account: String,
}

/// Dispatcher's answer for one recipient of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    /// HTTP-level status of the acceptance; 201 means the run was created.
    pub status_code: u16,
    /// Run id to correlate completion events with.
    pub correlation_id: Option<String>,
}

impl DispatchResponse {
    /// Whether the dispatcher took ownership of the run.
    pub fn is_created(&self) -> bool {
        self.status_code == 201
    }
}

/// Builds the distributable repository for a rollout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepoBuilder: Send + Sync {
    /// Build the artifact and return its location.
    async fn build(&self, rollout_id: RolloutId) -> anyhow::Result<String>;
}

/// Renders and publishes the device execution script.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptPublisher: Send + Sync {
    /// Publish the script and return the URL devices should fetch it from.
    async fn publish(&self, remote: &RemoteInfo, account: &str) -> anyhow::Result<String>;

    /// Read back a previously published script.
    async fn fetch(&self, account: &str, rollout_id: RolloutId) -> anyhow::Result<Vec<u8>>;
}

/// Asks the remote dispatcher to run a script on a device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn execute(&self, request: &DispatchRequest) -> anyhow::Result<Vec<DispatchResponse>>;
}

/// Publishes rollout lifecycle notifications to an external bus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, notification: &crate::notify::RolloutNotification) -> anyhow::Result<()>;
}
