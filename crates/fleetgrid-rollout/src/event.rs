//! Completion events emitted by the remote dispatcher.
//!
//! The transport hands over opaque bytes; they carry a JSON run event whose
//! payload identifies the run (the correlation id issued at dispatch time)
//! and its remote status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

/// Remote run status as reported by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteStatus {
    Running,
    Success,
    Failure,
    Timeout,
    /// Any value outside the dispatcher's event schema.
    Unrecognized(String),
}

impl From<String> for RemoteStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => Self::Running,
            "success" => Self::Success,
            "failure" => Self::Failure,
            "timeout" => Self::Timeout,
            _ => Self::Unrecognized(s),
        }
    }
}

impl From<RemoteStatus> for String {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Running => "running".to_string(),
            RemoteStatus::Success => "success".to_string(),
            RemoteStatus::Failure => "failure".to_string(),
            RemoteStatus::Timeout => "timeout".to_string(),
            RemoteStatus::Unrecognized(s) => s,
        }
    }
}

/// Labels attached to a run at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLabels {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state_id: String,
}

/// Payload of a dispatcher run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventPayload {
    /// Run id; this is the correlation id returned when the run was created.
    pub id: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub labels: RunLabels,
    pub status: RemoteStatus,
    #[serde(default)]
    pub timeout: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A dispatcher run event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: String,
    pub payload: RunEventPayload,
}

/// Decoded shape of a completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub correlation_id: String,
    pub status: RemoteStatus,
    pub timestamp: DateTime<Utc>,
}

impl From<RunEvent> for CompletionEvent {
    fn from(event: RunEvent) -> Self {
        let payload = event.payload;
        Self {
            correlation_id: payload.id,
            status: payload.status,
            timestamp: payload
                .updated_at
                .or(payload.created_at)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Decode raw transport bytes into a completion event.
pub fn decode(raw: &[u8]) -> RolloutResult<CompletionEvent> {
    let event: RunEvent = serde_json::from_slice(raw)
        .map_err(|e| RolloutError::Validation(format!("malformed completion event: {e}")))?;
    if event.payload.id.is_empty() {
        return Err(RolloutError::Validation(
            "completion event has an empty run id".to_string(),
        ));
    }
    Ok(event.into())
}
