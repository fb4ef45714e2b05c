//! REST API handlers for rollouts and devices.
//!
//! Each handler goes through the orchestrator or the store and answers with
//! the `{success, data?, error?}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, info};

use fleetgrid_rollout::{RolloutError, UpdateRequest};
use fleetgrid_state::{DeviceId, ImageId, RolloutId, RolloutStatus};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for an engine error.
pub(crate) fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::Validation(_) => StatusCode::BAD_REQUEST,
        RolloutError::NotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::MissingCommit(_) | RolloutError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        RolloutError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
        RolloutError::Interrupted(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub(crate) fn rollout_error(err: &RolloutError) -> Response {
    error_response(&err.to_string(), status_for(err))
}

// ── Updates ────────────────────────────────────────────────────

/// GET /api/v1/updates
pub async fn list_updates(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_rollouts() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/updates/:id
pub async fn get_update(
    State(state): State<ApiState>,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    match state.store.get_rollout(id) {
        Ok(Some(rollout)) => ApiResponse::ok(rollout).into_response(),
        Ok(None) => error_response("update not found", StatusCode::NOT_FOUND),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/updates/:id/dispatch-records
pub async fn list_dispatch_records(
    State(state): State<ApiState>,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    match state.store.list_dispatch_records(id) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(fleetgrid_state::StateError::NotFound(_)) => {
            error_response("update not found", StatusCode::NOT_FOUND)
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Plan request body.
#[derive(serde::Deserialize)]
pub struct PlanUpdateRequest {
    pub account: String,
    pub image_id: ImageId,
    pub device_ids: Vec<DeviceId>,
}

/// POST /api/v1/updates
pub async fn plan_update(
    State(state): State<ApiState>,
    Json(req): Json<PlanUpdateRequest>,
) -> impl IntoResponse {
    let request = UpdateRequest {
        account: req.account,
        image_id: req.image_id,
        device_ids: req.device_ids,
    };
    match state.orchestrator.plan_update(request) {
        Ok(rollout) => (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// Selection check request body.
#[derive(serde::Deserialize)]
pub struct ValidateSelectionRequest {
    pub account: String,
    pub image_ids: Vec<ImageId>,
}

/// POST /api/v1/updates/validate
pub async fn validate_selection(
    State(state): State<ApiState>,
    Json(req): Json<ValidateSelectionRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .validate_update_selection(&req.account, &req.image_ids)
    {
        Ok(valid) => ApiResponse::ok(serde_json::json!({ "valid": valid })).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/updates/:id/dispatch
///
/// Answers once the rollout is accepted; fan-out continues in the background.
pub async fn dispatch_update(
    State(state): State<ApiState>,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    let rollout = match state.store.get_rollout(id) {
        Ok(Some(rollout)) => rollout,
        Ok(None) => return error_response("update not found", StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };
    if rollout.status != RolloutStatus::Created {
        return error_response(
            &format!("update {id} is {:?}, only created updates can be dispatched", rollout.status),
            StatusCode::CONFLICT,
        );
    }
    if state.orchestrator.supervisor().shutdown_token().is_cancelled() {
        return error_response("shutting down", StatusCode::SERVICE_UNAVAILABLE);
    }

    let orchestrator = state.orchestrator.clone();
    state.tasks.spawn(async move {
        match orchestrator.create_update(id).await {
            Ok(rollout) => info!(rollout_id = id, status = ?rollout.status, "update dispatched"),
            Err(e) => error!(rollout_id = id, error = %e, "update dispatch failed"),
        }
    });
    (StatusCode::ACCEPTED, ApiResponse::ok(rollout)).into_response()
}

/// GET /api/v1/updates/:id/update-playbook.yml
pub async fn update_playbook(
    State(state): State<ApiState>,
    Path(id): Path<RolloutId>,
) -> impl IntoResponse {
    match state.orchestrator.update_script(id).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/x-yaml")], bytes).into_response(),
        Err(e) => rollout_error(&e),
    }
}

// ── Devices ────────────────────────────────────────────────────

/// GET /api/v1/devices/:id/updates
pub async fn updates_for_device(
    State(state): State<ApiState>,
    Path(id): Path<DeviceId>,
) -> impl IntoResponse {
    match state.orchestrator.updates_for_device(id) {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => rollout_error(&e),
    }
}
