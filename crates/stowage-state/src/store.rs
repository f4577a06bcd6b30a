//! StateStore — redb-backed persistence for migrations, workloads and
//! instance groups.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). redb serializes write transactions, which is what makes
//! [`StateStore::create_or_adopt_pre_migrating`] first-writer-wins.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Load/save access to migration records.
pub trait MigrationStore: Send + Sync {
    fn load_migration(&self, id: &str) -> StateResult<Option<Migration>>;

    fn save_migration(&self, migration: &Migration) -> StateResult<()>;

    /// Return the in-flight `pre-migrating` record for the same workload and
    /// type if one exists, otherwise store `candidate`. The boolean is true
    /// when `candidate` was stored.
    fn create_or_adopt_pre_migrating(&self, candidate: &Migration) -> StateResult<(Migration, bool)>;

    /// Unfinished migrations with `host` as source or destination.
    fn active_migrations_on_host(&self, host: &str) -> StateResult<Vec<Migration>>;
}

/// Read access to workloads.
pub trait WorkloadStore: Send + Sync {
    fn load_workload(&self, id: &str) -> StateResult<Option<Workload>>;

    fn workloads_on_host(&self, host: &str) -> StateResult<Vec<Workload>>;
}

/// Read access to instance groups.
pub trait GroupStore: Send + Sync {
    fn load_group(&self, id: &str) -> StateResult<Option<InstanceGroup>>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
        txn.open_table(PENDING_MIGRATIONS).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Migrations ─────────────────────────────────────────────────

    /// Insert or update a migration record.
    ///
    /// The pending index is kept in step: a record leaving `pre-migrating`
    /// no longer blocks a fresh record for the same workload and type.
    pub fn put_migration(&self, migration: &Migration) -> StateResult<()> {
        let value = serde_json::to_vec(migration).map_err(map_err!(Serialize))?;
        let dedup = migration.dedup_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            table
                .insert(migration.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut pending = txn.open_table(PENDING_MIGRATIONS).map_err(map_err!(Table))?;
            let indexed = pending
                .get(dedup.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            let is_pending = migration.status == MigrationStatus::PreMigrating;
            match indexed {
                Some(id) if id == migration.id && !is_pending => {
                    pending.remove(dedup.as_str()).map_err(map_err!(Write))?;
                }
                None if is_pending => {
                    pending
                        .insert(dedup.as_str(), migration.id.as_str())
                        .map_err(map_err!(Write))?;
                }
                _ => {}
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(migration = %migration.id, status = %migration.status, "migration stored");
        Ok(())
    }

    /// Get a migration by ID.
    pub fn get_migration(&self, id: &str) -> StateResult<Option<Migration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let migration: Migration =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(migration))
            }
            None => Ok(None),
        }
    }

    /// List all migrations of one workload.
    pub fn list_migrations_for_workload(&self, workload_id: &str) -> StateResult<Vec<Migration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let migration: Migration =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if migration.workload_id == workload_id {
                results.push(migration);
            }
        }
        Ok(results)
    }

    /// List `pre-migrating` and `running` migrations touching `host`.
    pub fn list_active_migrations_on_host(&self, host: &str) -> StateResult<Vec<Migration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let migration: Migration =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let active = matches!(
                migration.status,
                MigrationStatus::PreMigrating | MigrationStatus::Running
            );
            let touches = migration.source_host == host || migration.dest_host.as_deref() == Some(host);
            if active && touches {
                results.push(migration);
            }
        }
        Ok(results)
    }

    /// Atomically adopt an in-flight `pre-migrating` record or store `candidate`.
    pub fn create_or_adopt_pre_migrating(
        &self,
        candidate: &Migration,
    ) -> StateResult<(Migration, bool)> {
        let dedup = candidate.dedup_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let adopted = {
            let mut pending = txn.open_table(PENDING_MIGRATIONS).map_err(map_err!(Table))?;
            let mut table = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;

            let indexed = pending
                .get(dedup.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            let existing = match indexed {
                Some(id) => table
                    .get(id.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| serde_json::from_slice::<Migration>(guard.value()))
                    .transpose()
                    .map_err(map_err!(Deserialize))?
                    .filter(|m| m.status == MigrationStatus::PreMigrating),
                None => None,
            };

            match existing {
                Some(migration) => Some(migration),
                None => {
                    let mut fresh = candidate.clone();
                    fresh.status = MigrationStatus::PreMigrating;
                    let value = serde_json::to_vec(&fresh).map_err(map_err!(Serialize))?;
                    table
                        .insert(fresh.id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    pending
                        .insert(dedup.as_str(), fresh.id.as_str())
                        .map_err(map_err!(Write))?;
                    None
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        match adopted {
            Some(migration) => {
                debug!(migration = %migration.id, key = %dedup, "adopted pre-migrating record");
                Ok((migration, false))
            }
            None => {
                debug!(migration = %candidate.id, key = %dedup, "created pre-migrating record");
                let mut fresh = candidate.clone();
                fresh.status = MigrationStatus::PreMigrating;
                Ok((fresh, true))
            }
        }
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload.
    pub fn put_workload(&self, workload: &Workload) -> StateResult<()> {
        let value = serde_json::to_vec(workload).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            table
                .insert(workload.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a workload by ID.
    pub fn get_workload(&self, id: &str) -> StateResult<Option<Workload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let workload: Workload =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// List workloads placed on a host.
    pub fn list_workloads_on_host(&self, host: &str) -> StateResult<Vec<Workload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let workload: Workload =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if workload.host == host {
                results.push(workload);
            }
        }
        Ok(results)
    }

    /// Delete a workload by ID. Returns true if it existed.
    pub fn delete_workload(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Instance groups ────────────────────────────────────────────

    /// Insert or update an instance group.
    pub fn put_group(&self, group: &InstanceGroup) -> StateResult<()> {
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(group.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance group by ID.
    pub fn get_group(&self, id: &str) -> StateResult<Option<InstanceGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let group: InstanceGroup =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// Delete an instance group by ID. Returns true if it existed.
    pub fn delete_group(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

impl MigrationStore for StateStore {
    fn load_migration(&self, id: &str) -> StateResult<Option<Migration>> {
        self.get_migration(id)
    }

    fn save_migration(&self, migration: &Migration) -> StateResult<()> {
        self.put_migration(migration)
    }

    fn create_or_adopt_pre_migrating(&self, candidate: &Migration) -> StateResult<(Migration, bool)> {
        StateStore::create_or_adopt_pre_migrating(self, candidate)
    }

    fn active_migrations_on_host(&self, host: &str) -> StateResult<Vec<Migration>> {
        self.list_active_migrations_on_host(host)
    }
}

impl WorkloadStore for StateStore {
    fn load_workload(&self, id: &str) -> StateResult<Option<Workload>> {
        self.get_workload(id)
    }

    fn workloads_on_host(&self, host: &str) -> StateResult<Vec<Workload>> {
        self.list_workloads_on_host(host)
    }
}

impl GroupStore for StateStore {
    fn load_group(&self, id: &str) -> StateResult<Option<InstanceGroup>> {
        self.get_group(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn test_migration(id: &str, workload: &str) -> Migration {
        Migration {
            id: id.to_string(),
            workload_id: workload.to_string(),
            migration_type: MigrationType::Migration,
            status: MigrationStatus::PreMigrating,
            source_host: "host1".to_string(),
            source_node: "node1".to_string(),
            dest_host: None,
            dest_node: None,
            old_flavor_id: "f1".to_string(),
            new_flavor_id: "f1".to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_workload(id: &str, host: &str) -> Workload {
        Workload {
            id: id.to_string(),
            project_id: "p1".to_string(),
            host: host.to_string(),
            node: host.to_string(),
            provider_id: host.to_string(),
            cell: Some("cell1".to_string()),
            flavor: Flavor::default(),
            task_state: None,
            group_id: None,
        }
    }

    #[test]
    fn migration_crud() {
        let store = StateStore::open_in_memory().unwrap();
        let migration = test_migration("m1", "w1");
        store.put_migration(&migration).unwrap();

        let loaded = store.get_migration("m1").unwrap().unwrap();
        assert_eq!(loaded, migration);
        assert!(store.get_migration("missing").unwrap().is_none());
        assert_eq!(store.list_migrations_for_workload("w1").unwrap().len(), 1);
        assert!(store.list_migrations_for_workload("w2").unwrap().is_empty());
    }

    #[test]
    fn second_creator_adopts_pending_record() {
        let store = StateStore::open_in_memory().unwrap();
        let (first, created) = store
            .create_or_adopt_pre_migrating(&test_migration("m1", "w1"))
            .unwrap();
        assert!(created);

        let (second, created) = store
            .create_or_adopt_pre_migrating(&test_migration("m2", "w1"))
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert!(store.get_migration("m2").unwrap().is_none());
    }

    #[test]
    fn finished_record_is_not_adopted() {
        let store = StateStore::open_in_memory().unwrap();
        let (mut first, _) = store
            .create_or_adopt_pre_migrating(&test_migration("m1", "w1"))
            .unwrap();
        first.status = MigrationStatus::Error;
        store.put_migration(&first).unwrap();

        let (second, created) = store
            .create_or_adopt_pre_migrating(&test_migration("m2", "w1"))
            .unwrap();
        assert!(created);
        assert_eq!(second.id, "m2");
    }

    #[test]
    fn different_type_gets_its_own_record() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_or_adopt_pre_migrating(&test_migration("m1", "w1"))
            .unwrap();
        let mut resize = test_migration("m2", "w1");
        resize.migration_type = MigrationType::Resize;
        let (record, created) = store.create_or_adopt_pre_migrating(&resize).unwrap();
        assert!(created);
        assert_eq!(record.id, "m2");
    }

    #[test]
    fn concurrent_creators_share_one_record() {
        let store = StateStore::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .create_or_adopt_pre_migrating(&test_migration(&format!("m{i}"), "w1"))
                        .unwrap()
                        .0
                        .id
                })
            })
            .collect();
        let ids: BTreeSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_migrations_for_workload("w1").unwrap().len(), 1);
    }

    #[test]
    fn active_migrations_by_host() {
        let store = StateStore::open_in_memory().unwrap();
        let outgoing = test_migration("m1", "w1");
        let mut incoming = test_migration("m2", "w2");
        incoming.source_host = "host9".to_string();
        incoming.dest_host = Some("host1".to_string());
        incoming.status = MigrationStatus::Running;
        let mut done = test_migration("m3", "w3");
        done.status = MigrationStatus::Completed;
        for m in [&outgoing, &incoming, &done] {
            store.put_migration(m).unwrap();
        }

        let mut ids: Vec<String> = store
            .active_migrations_on_host("host1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(store.list_active_migrations_on_host("host9").unwrap().len(), 1);
        assert!(store.list_active_migrations_on_host("host2").unwrap().is_empty());
    }

    #[test]
    fn workload_queries() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_workload(&test_workload("w1", "host1")).unwrap();
        store.put_workload(&test_workload("w2", "host1")).unwrap();
        store.put_workload(&test_workload("w3", "host2")).unwrap();

        assert_eq!(store.list_workloads_on_host("host1").unwrap().len(), 2);
        assert_eq!(store.load_workload("w3").unwrap().unwrap().host, "host2");
        assert!(store.delete_workload("w3").unwrap());
        assert!(!store.delete_workload("w3").unwrap());
    }

    #[test]
    fn group_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let group = InstanceGroup {
            id: "g1".to_string(),
            policy: GroupPolicy::Affinity,
            members: ["w1".to_string()].into_iter().collect(),
            hosts: ["host1".to_string()].into_iter().collect(),
        };
        store.put_group(&group).unwrap();
        assert_eq!(store.load_group("g1").unwrap(), Some(group));
        assert!(store.delete_group("g1").unwrap());
        assert!(store.load_group("g1").unwrap().is_none());
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_migration(&test_migration("m1", "w1")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_migration("m1").unwrap().is_some());
        let (adopted, created) = store
            .create_or_adopt_pre_migrating(&test_migration("m9", "w1"))
            .unwrap();
        assert!(!created);
        assert_eq!(adopted.id, "m1");
    }
}
