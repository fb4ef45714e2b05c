//! redb table definitions for the FleetGrid state store.
//!
//! Entity tables use `u64` keys and `&[u8]` values (JSON-serialized domain
//! types). Identifiers are allocated from the `sequences` table.

use redb::TableDefinition;

/// Rollouts (update transactions) keyed by rollout id.
pub const ROLLOUTS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollouts");

/// Dispatch records keyed by record id.
pub const DISPATCH_RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("dispatch_records");

/// Dispatcher correlation id → dispatch record id.
pub const CORRELATIONS: TableDefinition<&str, u64> = TableDefinition::new("correlations");

/// Devices keyed by device id.
pub const DEVICES: TableDefinition<u64, &[u8]> = TableDefinition::new("devices");

/// Images keyed by image id.
pub const IMAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("images");

/// Last allocated id per entity table, keyed by table name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
