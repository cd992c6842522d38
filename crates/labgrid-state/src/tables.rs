//! redb table definitions for the labgrid state store.
//!
//! Each table uses `&str` keys (the record name) and `&[u8]` values
//! (JSON-serialized records).

use redb::TableDefinition;

/// Test machines keyed by machine name.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Sites keyed by site name.
pub const SITES: TableDefinition<&str, &[u8]> = TableDefinition::new("sites");

/// Pooled global resources keyed by resource name.
pub const GLOBAL_RESOURCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("global_resources");
