//! redb table definitions for the Stowage state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Migration records keyed by `{migration_id}`.
pub const MIGRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("migrations");

/// In-flight `pre-migrating` record IDs keyed by `{workload_id}:{migration_type}`.
pub const PENDING_MIGRATIONS: TableDefinition<&str, &str> =
    TableDefinition::new("pending_migrations");

/// Workloads keyed by `{workload_id}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Instance groups keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
