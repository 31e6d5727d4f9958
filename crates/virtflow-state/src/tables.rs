//! redb table definitions for the virtflow state store.

use redb::TableDefinition;

/// Task status records keyed by `task_id`, JSON-serialized `StatusRecord` values.
pub const TASK_STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("task_status");
