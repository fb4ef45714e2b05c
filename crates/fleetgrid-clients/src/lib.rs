//! fleetgrid-clients — concrete collaborators for the rollout engine.
//!
//! HTTP clients for the remote dispatcher, the repo builder, and a webhook
//! event bus, plus a publisher that writes device playbooks to disk.

pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod publisher;
pub mod repo_builder;
mod transport;

pub use dispatcher::HttpDispatcher;
pub use error::{ClientError, ClientResult};
pub use event_bus::HttpEventBus;
pub use publisher::FilePublisher;
pub use repo_builder::HttpRepoBuilder;
