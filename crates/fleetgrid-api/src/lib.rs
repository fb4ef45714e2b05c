//! fleetgrid-api — REST API for FleetGrid.
//!
//! Exposes rollout planning, dispatch, and queries, plus the ingestion
//! endpoint the remote dispatcher posts completion events to.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/updates` | List rollouts |
//! | POST | `/api/v1/updates` | Plan a rollout |
//! | POST | `/api/v1/updates/validate` | Check an image selection shares one image set |
//! | GET | `/api/v1/updates/{id}` | Get a rollout |
//! | GET | `/api/v1/updates/{id}/dispatch-records` | List a rollout's dispatch records |
//! | POST | `/api/v1/updates/{id}/dispatch` | Start fan-out (runs in the background) |
//! | GET | `/api/v1/updates/{id}/update-playbook.yml` | Device playbook |
//! | GET | `/api/v1/devices/{id}/updates` | Rollouts that targeted a device |
//! | POST | `/api/v1/events/dispatcher` | Ingest a dispatcher completion event |

pub mod event_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::task::TaskTracker;

use fleetgrid_rollout::{DispatchEventProcessor, UpdateOrchestrator};
use fleetgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub processor: Arc<DispatchEventProcessor>,
    /// Background fan-outs and event processing spawned by handlers.
    pub tasks: TaskTracker,
}

impl ApiState {
    pub fn new(
        store: StateStore,
        orchestrator: Arc<UpdateOrchestrator>,
        processor: Arc<DispatchEventProcessor>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            processor,
            tasks: TaskTracker::new(),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/updates", get(handlers::list_updates).post(handlers::plan_update))
        .route("/updates/validate", post(handlers::validate_selection))
        .route("/updates/{id}", get(handlers::get_update))
        .route("/updates/{id}/dispatch-records", get(handlers::list_dispatch_records))
        .route("/updates/{id}/dispatch", post(handlers::dispatch_update))
        .route("/updates/{id}/update-playbook.yml", get(handlers::update_playbook))
        .route("/devices/{id}/updates", get(handlers::updates_for_device))
        .route("/events/dispatcher", post(event_handlers::ingest_dispatcher_event))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
