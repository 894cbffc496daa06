//! redb table definitions for the WarpGrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Allocations keyed by `{alloc_id}`.
pub const ALLOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocations");

/// Node info keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Store-wide counters (currently only the modify index).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the latest modify index in [`META`].
pub const INDEX_KEY: &str = "index";
