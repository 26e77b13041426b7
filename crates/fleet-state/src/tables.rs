//! redb table definitions for the fleet coordination store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Store-assigned ids come from the `counters` table.

use redb::TableDefinition;

/// Node records keyed by store-assigned `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Node requests keyed by `{request_id}`.
pub const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");

/// Monotonic id sequences keyed by record kind (`node`, `request`).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
