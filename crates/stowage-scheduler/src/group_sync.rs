//! Server-group placement rule sync.
//!
//! A compute host mirrors each server group's hard policy as a placement
//! rule over the group members it currently runs. Syncs for the same group
//! may be triggered from several places at once, so each one runs inside
//! the named region `server-group-{id}`.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stowage_state::{
    GroupPolicy, GroupStore, MigrationStatus, MigrationStore, StateStore, WorkloadId, WorkloadStore,
};
use tracing::{debug, info};

use crate::error::SchedulerResult;
use crate::locks::NamedLocks;

/// Task states whose workloads are leaving or being replaced.
pub const VOLATILE_TASK_STATES: &[&str] = &[
    "deleting",
    "shelving",
    "rebuilding",
    "rebuild-block-device-mapping",
];

/// Placement rule as stored by the hypervisor cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRule {
    pub name: String,
    pub policy: GroupPolicy,
    pub members: BTreeSet<WorkloadId>,
}

/// Boxed future alias for rule backend calls.
pub type RuleFuture<'a, T> = Pin<Box<dyn Future<Output = SchedulerResult<T>> + Send + 'a>>;

/// Where placement rules live — injected for testability.
pub trait GroupRuleBackend: Send + Sync {
    fn get_rule<'a>(&'a self, name: &'a str) -> RuleFuture<'a, Option<PlacementRule>>;

    fn create_rule<'a>(&'a self, rule: &'a PlacementRule) -> RuleFuture<'a, ()>;

    fn update_rule<'a>(&'a self, rule: &'a PlacementRule) -> RuleFuture<'a, ()>;

    fn delete_rule<'a>(&'a self, name: &'a str) -> RuleFuture<'a, ()>;
}

/// What a sync did to the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

pub fn rule_name(group_id: &str) -> String {
    format!("stowage-group-{group_id}")
}

/// Per-host rule sync. Instances built from clones of one [`NamedLocks`]
/// serialize on the same group regions.
pub struct ServerGroupSync {
    host: String,
    groups: Arc<dyn GroupStore>,
    workloads: Arc<dyn WorkloadStore>,
    migrations: Arc<dyn MigrationStore>,
    backend: Arc<dyn GroupRuleBackend>,
    locks: NamedLocks,
}

impl ServerGroupSync {
    pub fn new(
        host: &str,
        groups: Arc<dyn GroupStore>,
        workloads: Arc<dyn WorkloadStore>,
        migrations: Arc<dyn MigrationStore>,
        backend: Arc<dyn GroupRuleBackend>,
        locks: NamedLocks,
    ) -> Self {
        Self {
            host: host.to_string(),
            groups,
            workloads,
            migrations,
            backend,
            locks,
        }
    }

    /// All three stores served by one [`StateStore`].
    pub fn from_store(
        host: &str,
        store: Arc<StateStore>,
        backend: Arc<dyn GroupRuleBackend>,
        locks: NamedLocks,
    ) -> Self {
        Self::new(host, store.clone(), store.clone(), store, backend, locks)
    }

    /// Bring the rule for `group_id` in line with the group's local members.
    pub async fn sync(&self, group_id: &str) -> SchedulerResult<SyncOutcome> {
        let _region = self.locks.lock(&format!("server-group-{group_id}")).await;
        let name = rule_name(group_id);
        let existing = self.backend.get_rule(&name).await?;

        let Some(group) = self.groups.load_group(group_id)? else {
            debug!(group = %group_id, "group gone, dropping orphan rule");
            return self.remove(&name, existing.is_some()).await;
        };
        if group.policy == GroupPolicy::SoftAffinity {
            debug!(group = %group_id, "soft-affinity groups carry no rule");
            return self.remove(&name, existing.is_some()).await;
        }

        let members = self.local_members(&group.members)?;
        if members.len() < 2 {
            debug!(group = %group_id, members = members.len(), "too few local members for a rule");
            return self.remove(&name, existing.is_some()).await;
        }

        let rule = PlacementRule {
            name,
            policy: group.policy,
            members,
        };
        match existing {
            None => {
                self.backend.create_rule(&rule).await?;
                info!(group = %group_id, host = %self.host, members = rule.members.len(), "placement rule created");
                Ok(SyncOutcome::Created)
            }
            Some(current) if current == rule => Ok(SyncOutcome::Unchanged),
            Some(_) => {
                self.backend.update_rule(&rule).await?;
                info!(group = %group_id, host = %self.host, members = rule.members.len(), "placement rule updated");
                Ok(SyncOutcome::Updated)
            }
        }
    }

    async fn remove(&self, name: &str, exists: bool) -> SchedulerResult<SyncOutcome> {
        if !exists {
            return Ok(SyncOutcome::Unchanged);
        }
        self.backend.delete_rule(name).await?;
        info!(rule = %name, host = %self.host, "placement rule deleted");
        Ok(SyncOutcome::Deleted)
    }

    /// Group members running here, minus those about to leave, plus those
    /// arriving through a running migration.
    fn local_members(&self, group_members: &BTreeSet<WorkloadId>) -> SchedulerResult<BTreeSet<WorkloadId>> {
        let active = self.migrations.active_migrations_on_host(&self.host)?;
        let leaving: BTreeSet<&str> = active
            .iter()
            .filter(|m| m.source_host == self.host && m.dest_host.as_deref() != Some(self.host.as_str()))
            .map(|m| m.workload_id.as_str())
            .collect();

        let mut members: BTreeSet<WorkloadId> = self
            .workloads
            .workloads_on_host(&self.host)?
            .into_iter()
            .filter(|w| group_members.contains(&w.id))
            .filter(|w| {
                !w.task_state
                    .as_deref()
                    .is_some_and(|state| VOLATILE_TASK_STATES.contains(&state))
            })
            .filter(|w| !leaving.contains(w.id.as_str()))
            .map(|w| w.id)
            .collect();

        members.extend(
            active
                .into_iter()
                .filter(|m| m.status == MigrationStatus::Running)
                .filter(|m| m.dest_host.as_deref() == Some(self.host.as_str()) && m.source_host != self.host)
                .filter(|m| group_members.contains(&m.workload_id))
                .map(|m| m.workload_id),
        );
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use stowage_state::{Flavor, InstanceGroup, Migration, MigrationType, Workload};

    #[derive(Default)]
    struct MemoryRules {
        rules: Mutex<BTreeMap<String, PlacementRule>>,
        writes: Mutex<usize>,
    }

    impl MemoryRules {
        fn rule(&self, name: &str) -> Option<PlacementRule> {
            self.rules.lock().unwrap().get(name).cloned()
        }

        fn writes(&self) -> usize {
            *self.writes.lock().unwrap()
        }

        fn put(&self, rule: &PlacementRule) {
            *self.writes.lock().unwrap() += 1;
            self.rules.lock().unwrap().insert(rule.name.clone(), rule.clone());
        }
    }

    impl GroupRuleBackend for MemoryRules {
        fn get_rule<'a>(&'a self, name: &'a str) -> RuleFuture<'a, Option<PlacementRule>> {
            let rule = self.rule(name);
            Box::pin(async move { Ok(rule) })
        }

        fn create_rule<'a>(&'a self, rule: &'a PlacementRule) -> RuleFuture<'a, ()> {
            self.put(rule);
            Box::pin(async { Ok(()) })
        }

        fn update_rule<'a>(&'a self, rule: &'a PlacementRule) -> RuleFuture<'a, ()> {
            self.put(rule);
            Box::pin(async { Ok(()) })
        }

        fn delete_rule<'a>(&'a self, name: &'a str) -> RuleFuture<'a, ()> {
            *self.writes.lock().unwrap() += 1;
            self.rules.lock().unwrap().remove(name);
            Box::pin(async { Ok(()) })
        }
    }

    fn workload(id: &str, host: &str, task_state: Option<&str>) -> Workload {
        Workload {
            id: id.to_string(),
            project_id: "p1".to_string(),
            host: host.to_string(),
            node: host.to_string(),
            provider_id: host.to_string(),
            cell: None,
            flavor: Flavor::default(),
            task_state: task_state.map(str::to_string),
            group_id: Some("g1".to_string()),
        }
    }

    fn migration(id: &str, workload: &str, source: &str, dest: &str, status: MigrationStatus) -> Migration {
        Migration {
            id: id.to_string(),
            workload_id: workload.to_string(),
            migration_type: MigrationType::LiveMigration,
            status,
            source_host: source.to_string(),
            source_node: source.to_string(),
            dest_host: Some(dest.to_string()),
            dest_node: Some(dest.to_string()),
            old_flavor_id: "f1".to_string(),
            new_flavor_id: "f1".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn group(policy: GroupPolicy, members: &[&str]) -> InstanceGroup {
        InstanceGroup {
            id: "g1".to_string(),
            policy,
            members: members.iter().map(|m| m.to_string()).collect(),
            hosts: BTreeSet::new(),
        }
    }

    fn setup() -> (Arc<StateStore>, Arc<MemoryRules>, ServerGroupSync) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rules = Arc::new(MemoryRules::default());
        let sync = ServerGroupSync::from_store("h1", store.clone(), rules.clone(), NamedLocks::new());
        (store, rules, sync)
    }

    fn members(rule: &PlacementRule) -> Vec<&str> {
        rule.members.iter().map(String::as_str).collect()
    }

    #[tokio::test]
    async fn rule_tracks_local_members() {
        let (store, rules, sync) = setup();
        store
            .put_group(&group(GroupPolicy::AntiAffinity, &["w1", "w2", "w3", "w4"]))
            .unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store.put_workload(&workload("w2", "h1", None)).unwrap();
        store.put_workload(&workload("w3", "h2", None)).unwrap();
        store.put_workload(&workload("x9", "h1", None)).unwrap();

        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Created);
        let rule = rules.rule(&rule_name("g1")).unwrap();
        assert_eq!(rule.policy, GroupPolicy::AntiAffinity);
        assert_eq!(members(&rule), vec!["w1", "w2"]);

        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Unchanged);
        assert_eq!(rules.writes(), 1);

        store.put_workload(&workload("w4", "h1", None)).unwrap();
        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Updated);
        assert_eq!(members(&rules.rule(&rule_name("g1")).unwrap()), vec!["w1", "w2", "w4"]);
    }

    #[tokio::test]
    async fn volatile_and_departing_members_are_excluded() {
        let (store, rules, sync) = setup();
        store
            .put_group(&group(GroupPolicy::Affinity, &["w1", "w2", "w3", "w4", "w5"]))
            .unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store.put_workload(&workload("w2", "h1", Some("deleting"))).unwrap();
        store.put_workload(&workload("w3", "h1", Some("rebuild-block-device-mapping"))).unwrap();
        store.put_workload(&workload("w4", "h1", None)).unwrap();
        store.put_workload(&workload("w5", "h2", None)).unwrap();
        store
            .put_migration(&migration("m1", "w4", "h1", "h3", MigrationStatus::Running))
            .unwrap();
        store
            .put_migration(&migration("m2", "w5", "h2", "h1", MigrationStatus::Running))
            .unwrap();

        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Created);
        assert_eq!(members(&rules.rule(&rule_name("g1")).unwrap()), vec!["w1", "w5"]);
    }

    #[tokio::test]
    async fn incoming_migration_counts_only_once_running() {
        let (store, rules, sync) = setup();
        store.put_group(&group(GroupPolicy::AntiAffinity, &["w1", "w5"])).unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store
            .put_migration(&migration("m2", "w5", "h2", "h1", MigrationStatus::PreMigrating))
            .unwrap();

        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Unchanged);
        assert!(rules.rule(&rule_name("g1")).is_none());
    }

    #[tokio::test]
    async fn rule_removed_when_it_no_longer_applies() {
        let (store, rules, sync) = setup();
        store.put_group(&group(GroupPolicy::AntiAffinity, &["w1", "w2"])).unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store.put_workload(&workload("w2", "h1", None)).unwrap();
        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Created);

        store.put_workload(&workload("w2", "h1", Some("shelving"))).unwrap();
        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Deleted);
        assert!(rules.rule(&rule_name("g1")).is_none());
        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Unchanged);
    }

    #[tokio::test]
    async fn soft_affinity_and_orphans_have_no_rule() {
        let (store, rules, sync) = setup();
        rules.put(&PlacementRule {
            name: rule_name("g1"),
            policy: GroupPolicy::Affinity,
            members: ["w1".to_string(), "w2".to_string()].into_iter().collect(),
        });
        store.put_group(&group(GroupPolicy::SoftAffinity, &["w1", "w2"])).unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store.put_workload(&workload("w2", "h1", None)).unwrap();
        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Deleted);

        rules.put(&PlacementRule {
            name: rule_name("gone"),
            policy: GroupPolicy::AntiAffinity,
            members: BTreeSet::new(),
        });
        assert_eq!(sync.sync("gone").await.unwrap(), SyncOutcome::Deleted);
        assert!(rules.rule(&rule_name("gone")).is_none());
    }

    #[tokio::test]
    async fn concurrent_syncs_of_one_group_write_once() {
        let (store, rules, sync) = setup();
        store.put_group(&group(GroupPolicy::AntiAffinity, &["w1", "w2"])).unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store.put_workload(&workload("w2", "h1", None)).unwrap();

        let sync = Arc::new(sync);
        let (a, b) = tokio::join!(sync.sync("g1"), sync.sync("g1"));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == SyncOutcome::Created);
        assert_eq!(outcomes, vec![SyncOutcome::Unchanged, SyncOutcome::Created]);
        assert_eq!(rules.writes(), 1);
    }

    #[tokio::test]
    async fn syncs_sharing_locks_wait_for_each_other() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rules = Arc::new(MemoryRules::default());
        let locks = NamedLocks::new();
        store.put_group(&group(GroupPolicy::AntiAffinity, &["w1", "w2"])).unwrap();
        store.put_workload(&workload("w1", "h1", None)).unwrap();
        store.put_workload(&workload("w2", "h1", None)).unwrap();

        let sync = ServerGroupSync::from_store("h1", store.clone(), rules.clone(), locks.clone());
        let held = locks.lock("server-group-g1").await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), sync.sync("g1")).await;
        assert!(blocked.is_err());
        assert_eq!(rules.writes(), 0);

        drop(held);
        assert_eq!(sync.sync("g1").await.unwrap(), SyncOutcome::Created);
    }
}
