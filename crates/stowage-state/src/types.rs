//! Domain types shared by the scheduler, the placement pipelines and the
//! migration orchestrator.
//!
//! Host snapshots and request descriptors are built fresh per scheduling
//! attempt and never persisted. Migrations and workloads are JSON-serialized
//! into redb tables by [`crate::StateStore`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier of a compute host.
pub type HostId = String;

/// Unique identifier of a workload (server instance).
pub type WorkloadId = String;

/// Unique identifier of a migration record.
pub type MigrationId = String;

/// Identifier of an allocation provider (a host's resource pool).
pub type ProviderId = String;

/// Identifier of an allocation consumer: a workload or a migration record.
pub type ConsumerId = String;

/// Scheduler hint carrying the operation kind (`resize`, `rebuild`, `live_migrate`).
pub const HINT_CHECK_TYPE: &str = "check_type";

/// Scheduler hint naming the host a relocation starts from.
pub const HINT_SOURCE_HOST: &str = "source_host";

/// Scheduler hint naming the node a relocation starts from.
pub const HINT_SOURCE_NODE: &str = "source_node";

/// Current wall-clock time as unix seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Resources ──────────────────────────────────────────────────────

/// An amount of reservable capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Resources {
    pub memory_mb: u64,
    pub vcpus: u32,
    pub disk_gb: u64,
}

impl Resources {
    pub fn new(memory_mb: u64, vcpus: u32, disk_gb: u64) -> Self {
        Self {
            memory_mb,
            vcpus,
            disk_gb,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory_mb == 0 && self.vcpus == 0 && self.disk_gb == 0
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            vcpus: self.vcpus.saturating_add(other.vcpus),
            disk_gb: self.disk_gb.saturating_add(other.disk_gb),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            vcpus: self.vcpus.saturating_sub(other.vcpus),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
        }
    }

    /// True when every dimension of `other` fits inside `self`.
    pub fn covers(&self, other: &Resources) -> bool {
        self.memory_mb >= other.memory_mb && self.vcpus >= other.vcpus && self.disk_gb >= other.disk_gb
    }
}

// ── Flavor ─────────────────────────────────────────────────────────

/// Extra spec marking a flavor as bare-metal with a fixed CPU architecture.
pub const EXTRA_SPEC_CPU_ARCH: &str = "capabilities:cpu_arch";

/// Instance type of a workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub root_gb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    pub fn resources(&self) -> Resources {
        Resources::new(self.memory_mb, self.vcpus, self.root_gb)
    }
}

// ── Instance groups ────────────────────────────────────────────────

/// Placement policy of a server group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum GroupPolicy {
    Affinity,
    AntiAffinity,
    SoftAffinity,
    SoftAntiAffinity,
}

impl GroupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupPolicy::Affinity => "affinity",
            GroupPolicy::AntiAffinity => "anti-affinity",
            GroupPolicy::SoftAffinity => "soft-affinity",
            GroupPolicy::SoftAntiAffinity => "soft-anti-affinity",
        }
    }
}

impl fmt::Display for GroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named group of workloads with a shared placement policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceGroup {
    pub id: String,
    pub policy: GroupPolicy,
    /// Member workload IDs.
    pub members: BTreeSet<WorkloadId>,
    /// Hosts currently occupied by members.
    pub hosts: BTreeSet<HostId>,
}

// ── Request descriptor ─────────────────────────────────────────────

/// Operation kind signalled through the `check_type` scheduler hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    Resize,
    Rebuild,
    LiveMigrate,
}

impl CheckType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "resize" => Some(CheckType::Resize),
            "rebuild" => Some(CheckType::Rebuild),
            "live_migrate" => Some(CheckType::LiveMigrate),
            _ => None,
        }
    }
}

/// Destination constraint the orchestrator may narrow between retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestedDestination {
    pub host: Option<HostId>,
    pub node: Option<String>,
    /// Cell (failure-domain boundary) the destination must belong to.
    pub cell: Option<String>,
}

/// Hosts already tried for this request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetryRecord {
    pub num_attempts: u32,
    pub hosts: Vec<HostId>,
}

/// Descriptor of one scheduling attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestSpec {
    pub workload_id: WorkloadId,
    pub project_id: String,
    pub flavor: Flavor,
    #[serde(default = "default_num_instances")]
    pub num_instances: u32,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub instance_group: Option<InstanceGroup>,
    /// Free-form hints; every key may carry several values.
    #[serde(default)]
    pub scheduler_hints: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub requested_destination: Option<RequestedDestination>,
    #[serde(default)]
    pub force_hosts: Vec<HostId>,
    #[serde(default)]
    pub force_nodes: Vec<String>,
    #[serde(default)]
    pub ignore_hosts: Vec<HostId>,
    #[serde(default)]
    pub retry: Option<RetryRecord>,
    /// Tags attached to the workload itself (cluster membership markers).
    #[serde(default)]
    pub workload_tags: BTreeSet<String>,
    #[serde(default)]
    pub workload_metadata: BTreeMap<String, String>,
}

fn default_num_instances() -> u32 {
    1
}

impl RequestSpec {
    /// Minimal request for a workload with the given flavor.
    pub fn new(workload_id: &str, project_id: &str, flavor: Flavor) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            project_id: project_id.to_string(),
            flavor,
            num_instances: 1,
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: InstanceGroup) -> Self {
        self.instance_group = Some(group);
        self
    }

    pub fn with_hint(mut self, key: &str, value: &str) -> Self {
        self.scheduler_hints
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    /// First value of a scheduler hint.
    pub fn hint(&self, key: &str) -> Option<&str> {
        self.scheduler_hints
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn check_type(&self) -> Option<CheckType> {
        self.hint(HINT_CHECK_TYPE).and_then(CheckType::parse)
    }

    pub fn is_resize(&self) -> bool {
        self.check_type() == Some(CheckType::Resize)
    }

    pub fn is_rebuild(&self) -> bool {
        self.check_type() == Some(CheckType::Rebuild)
    }

    pub fn source_host(&self) -> Option<&str> {
        self.hint(HINT_SOURCE_HOST)
    }

    pub fn source_node(&self) -> Option<&str> {
        self.hint(HINT_SOURCE_NODE)
    }

    /// Requested resources for one instance.
    pub fn resources(&self) -> Resources {
        self.flavor.resources()
    }

    /// Drop forced hosts/nodes so retries may pick any eligible host.
    pub fn reset_forced_destinations(&mut self) {
        self.force_hosts.clear();
        self.force_nodes.clear();
    }

    /// Record a host as already tried.
    pub fn record_attempt(&mut self, host: &str) {
        let retry = self.retry.get_or_insert_with(RetryRecord::default);
        retry.num_attempts += 1;
        if !retry.hosts.iter().any(|h| h == host) {
            retry.hosts.push(host.to_string());
        }
    }
}

// ── Host snapshot ──────────────────────────────────────────────────

/// A named host grouping. Shard, hypervisor-size and zone facts live in
/// the name and metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Aggregate {
    pub name: String,
    #[serde(default)]
    pub hosts: BTreeSet<HostId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
}

impl Aggregate {
    pub fn new(name: &str, hosts: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A workload resident on a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResidentWorkload {
    pub flavor_name: String,
}

fn default_ratio() -> f64 {
    1.0
}

/// Read-mostly snapshot of one host, supplied per attempt by inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostState {
    pub host: HostId,
    pub nodename: String,
    #[serde(default)]
    pub cell: Option<String>,
    pub provider_id: ProviderId,
    /// Provider generation; doubles as the claim version token.
    #[serde(default)]
    pub provider_generation: u64,
    pub hypervisor_type: String,
    #[serde(default)]
    pub hypervisor_version: u64,
    pub total_memory_mb: u64,
    pub free_memory_mb: i64,
    pub total_vcpus: u32,
    pub used_vcpus: u32,
    pub total_disk_gb: u64,
    pub free_disk_gb: i64,
    #[serde(default = "default_ratio")]
    pub ram_allocation_ratio: f64,
    #[serde(default = "default_ratio")]
    pub cpu_allocation_ratio: f64,
    #[serde(default = "default_ratio")]
    pub disk_allocation_ratio: f64,
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,
    #[serde(default)]
    pub instances: BTreeMap<WorkloadId, ResidentWorkload>,
    /// Raw CPU description (`{"features": [...]}`).
    #[serde(default)]
    pub cpu_info: Option<String>,
}

impl HostState {
    /// Empty host with the given capacity; provider and node share the host name.
    pub fn new(host: &str, memory_mb: u64, vcpus: u32, disk_gb: u64) -> Self {
        Self {
            host: host.to_string(),
            nodename: host.to_string(),
            cell: None,
            provider_id: host.to_string(),
            provider_generation: 0,
            hypervisor_type: "vmware".to_string(),
            hypervisor_version: 0,
            total_memory_mb: memory_mb,
            free_memory_mb: memory_mb as i64,
            total_vcpus: vcpus,
            used_vcpus: 0,
            total_disk_gb: disk_gb,
            free_disk_gb: disk_gb as i64,
            ram_allocation_ratio: 1.0,
            cpu_allocation_ratio: 1.0,
            disk_allocation_ratio: 1.0,
            aggregates: Vec::new(),
            instances: BTreeMap::new(),
            cpu_info: None,
        }
    }

    pub fn with_aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    pub fn with_instance(mut self, workload_id: &str, flavor_name: &str) -> Self {
        self.instances.insert(
            workload_id.to_string(),
            ResidentWorkload {
                flavor_name: flavor_name.to_string(),
            },
        );
        self
    }

    /// Memory in use, derived from total and free.
    pub fn used_memory_mb(&self) -> i64 {
        self.total_memory_mb as i64 - self.free_memory_mb
    }

    /// Aggregates whose name starts with `prefix`.
    pub fn aggregates_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Aggregate> + 'a {
        self.aggregates
            .iter()
            .filter(move |agg| agg.name.starts_with(prefix))
    }

    /// Values of a metadata key across all aggregates of this host.
    pub fn aggregate_metadata_values(&self, key: &str) -> BTreeSet<String> {
        self.aggregates
            .iter()
            .filter_map(|agg| agg.metadata.get(key).cloned())
            .collect()
    }

    /// Availability zones this host belongs to.
    pub fn availability_zones(&self) -> BTreeSet<String> {
        self.aggregates
            .iter()
            .filter_map(|agg| agg.availability_zone.clone())
            .collect()
    }

    /// Reflect a placement decided earlier in the same attempt.
    pub fn consume(&mut self, workload_id: &str, flavor: &Flavor) {
        self.free_memory_mb -= flavor.memory_mb as i64;
        self.used_vcpus = self.used_vcpus.saturating_add(flavor.vcpus);
        self.free_disk_gb -= flavor.root_gb as i64;
        self.instances.insert(
            workload_id.to_string(),
            ResidentWorkload {
                flavor_name: flavor.name.clone(),
            },
        );
    }
}

// ── Allocation candidates ──────────────────────────────────────────

/// Requested reservation amounts per provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AllocationRequest {
    pub allocations: BTreeMap<ProviderId, Resources>,
}

impl AllocationRequest {
    pub fn single(provider_id: &str, resources: Resources) -> Self {
        let mut allocations = BTreeMap::new();
        allocations.insert(provider_id.to_string(), resources);
        Self { allocations }
    }
}

/// One proposed destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationCandidate {
    pub host: HostId,
    pub nodename: String,
    pub provider_id: ProviderId,
    /// Opaque serialized [`AllocationRequest`]; absent when the scheduler
    /// does not use the allocation ledger.
    pub allocation_request: Option<String>,
    /// Version token required to submit a claim.
    pub version: u64,
}

// ── Migration ──────────────────────────────────────────────────────

/// Durable status of a relocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    PreMigrating,
    Running,
    Error,
    Failed,
    Completed,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStatus::PreMigrating => "pre-migrating",
            MigrationStatus::Running => "running",
            MigrationStatus::Error => "error",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Kind of relocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationType {
    Migration,
    Resize,
    LiveMigration,
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationType::Migration => "migration",
            MigrationType::Resize => "resize",
            MigrationType::LiveMigration => "live-migration",
        };
        f.write_str(s)
    }
}

/// A relocation record; also the consumer of the held source allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Migration {
    pub id: MigrationId,
    pub workload_id: WorkloadId,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub source_host: HostId,
    pub source_node: String,
    pub dest_host: Option<HostId>,
    pub dest_node: Option<String>,
    pub old_flavor_id: String,
    pub new_flavor_id: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Migration {
    /// Key used to find an in-flight record for the same workload and type.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.workload_id, self.migration_type)
    }
}

/// `{workload_id}:{migration_type}`
pub fn dedup_key(workload_id: &str, migration_type: MigrationType) -> String {
    format!("{workload_id}:{migration_type}")
}

// ── Workload ───────────────────────────────────────────────────────

/// Persisted view of a workload as far as scheduling is concerned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    pub id: WorkloadId,
    pub project_id: String,
    pub host: HostId,
    pub node: String,
    /// Provider holding the workload's current allocation.
    pub provider_id: ProviderId,
    pub cell: Option<String>,
    pub flavor: Flavor,
    /// Transient task (`deleting`, `shelving`, `rebuilding`, ...).
    #[serde(default)]
    pub task_state: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}
