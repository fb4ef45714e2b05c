//! Notification emitter — best-effort rollout lifecycle events.
//!
//! Publishing only happens when an event bus is configured. A failed
//! publish is logged and reported to the caller; it never touches the
//! rollout's persisted status.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetgrid_state::Rollout;

use crate::collaborators::EventBus;
use crate::error::{Collaborator, RolloutError, RolloutResult};

/// Static fields stamped on every notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub version: String,
    pub bundle: String,
    pub application: String,
    pub event_type: String,
    /// Users the notification is addressed to.
    pub users: Vec<String>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            version: "v1.1.0".to_string(),
            bundle: "rhel".to_string(),
            application: "edge-management".to_string(),
            event_type: "update-devices".to_string(),
            users: vec!["admin".to_string()],
        }
    }
}

/// One event entry of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// JSON document `{"UpdateID": "<id>"}`.
    pub payload: String,
}

/// Who receives a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecipient {
    pub only_admins: bool,
    pub ignore_user_preferences: bool,
    pub users: Vec<String>,
}

/// Message published to the event bus when a rollout settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutNotification {
    pub version: String,
    pub bundle: String,
    pub application: String,
    pub event_type: String,
    /// RFC 3339 time the notification was built.
    pub timestamp: String,
    pub account: String,
    /// JSON document `{"CommitID": "<id>"}`.
    pub context: String,
    pub events: Vec<NotificationEvent>,
    pub recipients: Vec<NotificationRecipient>,
}

/// Publishes rollout notifications when a bus is configured.
#[derive(Clone)]
pub struct Notifier {
    bus: Option<Arc<dyn EventBus>>,
    settings: NotificationSettings,
}

impl Notifier {
    /// A notifier that publishes to `bus`.
    pub fn new(bus: Arc<dyn EventBus>, settings: NotificationSettings) -> Self {
        Self {
            bus: Some(bus),
            settings,
        }
    }

    /// A notifier with no bus; every emit is a no-op.
    pub fn disabled() -> Self {
        Self {
            bus: None,
            settings: NotificationSettings::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bus.is_some()
    }

    /// Build the bus message for a rollout.
    pub fn build(&self, rollout: &Rollout) -> RolloutNotification {
        let commit_id = rollout
            .commit
            .as_ref()
            .map(|c| c.id.to_string())
            .unwrap_or_default();
        RolloutNotification {
            version: self.settings.version.clone(),
            bundle: self.settings.bundle.clone(),
            application: self.settings.application.clone(),
            event_type: self.settings.event_type.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            account: rollout.account.clone(),
            context: serde_json::json!({ "CommitID": commit_id }).to_string(),
            events: vec![NotificationEvent {
                metadata: serde_json::Map::new(),
                payload: serde_json::json!({ "UpdateID": rollout.id.to_string() }).to_string(),
            }],
            recipients: vec![NotificationRecipient {
                only_admins: false,
                ignore_user_preferences: false,
                users: self.settings.users.clone(),
            }],
        }
    }

    /// Publish a notification for a rollout that reached a terminal status.
    pub async fn emit(&self, rollout: &Rollout) -> RolloutResult<()> {
        let Some(bus) = &self.bus else {
            debug!(rollout_id = rollout.id, "notifications disabled, skipping");
            return Ok(());
        };
        let notification = self.build(rollout);
        match bus.publish(&notification).await {
            Ok(()) => {
                info!(rollout_id = rollout.id, status = ?rollout.status, "rollout notification published");
                Ok(())
            }
            Err(e) => {
                warn!(rollout_id = rollout.id, error = %e, "failed to publish rollout notification");
                Err(RolloutError::collaborator(Collaborator::EventBus, e))
            }
        }
    }
}
