//! fleetgrid-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for rollouts, dispatch records, devices, and images.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by `u64` identifiers allocated from a per-table sequence. A
//! secondary index maps dispatcher correlation ids to dispatch records.
//!
//! Operations that read and then write several records (appending a
//! dispatch record to its rollout, recomputing a rollout's status, the
//! fleet bulk update) run inside a single redb write transaction. redb
//! serializes write transactions, so these are atomic with respect to each
//! other.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DispatchTransition, StateStore};
pub use types::*;
