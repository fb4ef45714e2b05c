//! Ingestion of dispatcher completion events.
//!
//! The body is decoded before answering so a malformed event is rejected
//! with 400. Applying it runs on a tracked background task: a `success`
//! event waits out the reboot grace window, which must not hold the
//! delivery open.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, warn};

use fleetgrid_rollout::{RolloutError, event};

use crate::ApiState;
use crate::handlers::{ApiResponse, rollout_error};

/// POST /api/v1/events/dispatcher
pub async fn ingest_dispatcher_event(
    State(state): State<ApiState>,
    body: Bytes,
) -> impl IntoResponse {
    let event = match event::decode(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejected dispatcher event");
            return rollout_error(&e);
        }
    };
    let correlation_id = event.correlation_id.clone();

    let processor = state.processor.clone();
    state.tasks.spawn(async move {
        let correlation_id = event.correlation_id.clone();
        match processor.handle_event(event).await {
            Ok(outcome) => debug!(
                %correlation_id,
                record_id = outcome.record.id,
                applied = outcome.applied,
                "dispatcher event applied"
            ),
            // Logged by the processor when it drops the event.
            Err(RolloutError::NotFound(_)) => {}
            Err(e) => warn!(%correlation_id, error = %e, "dispatcher event failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "correlation_id": correlation_id })),
    )
        .into_response()
}
