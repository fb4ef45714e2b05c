//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of rollouts, the per-device
//! dispatch records they own, and the fleet's devices and images. All types
//! are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a rollout (update transaction).
pub type RolloutId = u64;

/// Unique identifier for a dispatch record.
pub type DispatchRecordId = u64;

/// Unique identifier for a device.
pub type DeviceId = u64;

/// Unique identifier for an image.
pub type ImageId = u64;

/// Unique identifier for an image set (lineage).
pub type ImageSetId = u64;

// ── Rollout ───────────────────────────────────────────────────────

/// Aggregate status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Created,
    Building,
    Success,
    Error,
}

impl RolloutStatus {
    /// Whether this status is final for the rollout.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// OSTree commit an update targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    pub id: u64,
    pub os_tree_commit: String,
}

/// One logical request to update a set of devices to a target image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub account: String,
    /// Target commit. A rollout without one cannot be synced to the fleet.
    pub commit: Option<Commit>,
    /// Artifact location returned by the repo builder.
    pub repo_url: Option<String>,
    /// Targeted devices, in request order.
    pub device_ids: Vec<DeviceId>,
    /// Dispatch records owned by this rollout, append-only.
    pub dispatch_record_ids: Vec<DispatchRecordId>,
    pub status: RolloutStatus,
    /// Set when the rollout was forced to `Error` outside the aggregator
    /// (collaborator failure, interruption). Keeps the rollout in `Error`.
    pub failure: Option<String>,
    /// Unix timestamp (seconds) when this rollout was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

// ── Dispatch record ───────────────────────────────────────────────

/// Status of one device's remote execution within a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Created,
    Running,
    Complete,
    Error,
}

/// Per-device outcome record for one fan-out attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRecord {
    pub id: DispatchRecordId,
    pub rollout_id: RolloutId,
    pub device_id: DeviceId,
    /// Run id issued by the dispatcher. Absent when the dispatch was refused.
    pub correlation_id: Option<String>,
    /// URL of the script the device was asked to execute.
    pub script_url: String,
    pub status: DispatchStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// A dispatch record that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDispatchRecord {
    pub device_id: DeviceId,
    pub correlation_id: Option<String>,
    pub script_url: String,
    pub status: DispatchStatus,
}

// ── Device ────────────────────────────────────────────────────────

/// An edge device in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub account: String,
    pub uuid: String,
    /// Identity of the device at the remote dispatcher.
    pub remote_client_id: String,
    /// Image the device is running, as last synced from a rollout.
    pub image_id: Option<ImageId>,
    /// A newer successful image exists in the device image's lineage.
    pub update_available: bool,
    /// Whether the dispatcher accepted the last execution request.
    pub connected: bool,
    pub current_hash: String,
    pub available_hash: String,
    pub updated_at: u64,
}

// ── Image ─────────────────────────────────────────────────────────

/// Build status of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Created,
    Building,
    Success,
    Error,
}

/// An OS image build belonging to an image set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub id: ImageId,
    pub account: String,
    pub name: String,
    pub image_set_id: ImageSetId,
    pub commit: Commit,
    pub status: ImageStatus,
    pub created_at: u64,
}
