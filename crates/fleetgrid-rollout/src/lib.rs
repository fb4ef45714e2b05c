//! fleetgrid-rollout — OS image update rollout engine.
//!
//! Fans one logical update out to many edge devices through a remote
//! dispatcher, ingests the dispatcher's asynchronous completion events, and
//! keeps one consistent status per rollout.
//!
//! # Architecture
//!
//! ```text
//! UpdateOrchestrator ──build──▶ RepoBuilder
//!        │          ──publish─▶ ScriptPublisher
//!        │          ──execute─▶ Dispatcher ···(async)···┐
//!        ▼                                               ▼
//!   StateStore ◀──── DispatchEventProcessor ◀── completion events
//!        ▲                   │
//!        │                   ├──▶ aggregator::resolve (pure)
//!        │                   ├──▶ FleetSync (on Success)
//!        │                   └──▶ Notifier ──▶ EventBus
//!        │
//!   RolloutSupervisor (in-flight count, shutdown watchers)
//! ```
//!
//! A rollout's status is always recomputed from its dispatch records inside
//! one store transaction. The only paths that force `Error` around the
//! aggregator are collaborator failures during fan-out and process
//! interruption; both record a failure reason that keeps the rollout failed.

pub mod aggregator;
pub mod collaborators;
pub mod error;
pub mod event;
pub mod fleet_sync;
pub mod notify;
pub mod orchestrator;
pub mod processor;
pub mod supervisor;

pub use collaborators::{
    DispatchRequest, DispatchResponse, Dispatcher, EventBus, RemoteInfo, RepoBuilder,
    ScriptPublisher,
};
pub use error::{Collaborator, RolloutError, RolloutResult};
pub use event::{CompletionEvent, RemoteStatus};
pub use fleet_sync::{FleetSync, FleetSyncOutcome};
pub use notify::{NotificationSettings, Notifier, RolloutNotification};
pub use orchestrator::{Collaborators, UpdateOrchestrator, UpdateRequest};
pub use processor::{DispatchEventProcessor, EventOutcome};
pub use supervisor::{
    CompletionHold, INTERRUPTED_REASON, RolloutGuard, RolloutSupervisor,
    recover_interrupted_rollouts,
};
