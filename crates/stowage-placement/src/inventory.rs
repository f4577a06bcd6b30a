//! Host inventory collaborator and the per-host attribute cache.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use stowage_state::{Aggregate, HostId, HostState};
use tracing::warn;

use crate::cache::{Expiry, TtlCache, TtlCacheConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::{FilterError, FilterResult};

/// Narrows the host list requested from inventory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostQuery {
    pub cell: Option<String>,
    pub hosts: Option<Vec<HostId>>,
}

/// Identifies the members of an existing workload cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSelector {
    /// Workloads carrying this exact tag.
    Tag(String),
    /// Workloads carrying this metadata entry.
    Metadata { key: String, value: String },
}

/// Source of host snapshots and host-level facts.
pub trait InventoryService: Send + Sync {
    fn get_host_states(&self, query: &HostQuery) -> FilterResult<Vec<HostState>>;

    /// Hypervisor memory ceiling in MB, `None` when not reported.
    fn get_hypervisor_capacity_ceiling(&self, host: &str) -> FilterResult<Option<u64>>;

    /// Number of cluster members per host, optionally restricted to one
    /// availability zone.
    fn count_cluster_members(
        &self,
        cluster: &ClusterSelector,
        availability_zone: Option<&str>,
    ) -> FilterResult<BTreeMap<HostId, usize>>;

    /// Every aggregate known to inventory, in a stable order.
    fn list_aggregates(&self) -> FilterResult<Vec<Aggregate>>;
}

/// Per-host hypervisor ceiling cache.
pub struct CeilingCache {
    inventory: Arc<dyn InventoryService>,
    cache: TtlCache<String, u64>,
}

impl CeilingCache {
    pub fn new(inventory: Arc<dyn InventoryService>, config: TtlCacheConfig) -> Self {
        Self::with_clock(inventory, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        inventory: Arc<dyn InventoryService>,
        config: TtlCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = TtlCacheConfig {
            expiry: Expiry::PerEntry,
            ..config
        };
        Self {
            inventory,
            cache: TtlCache::with_clock("hypervisor_ceiling", config, clock),
        }
    }

    /// Ceiling for `host`, `None` when unknown or the lookup failed.
    pub fn ceiling_mb(&self, host: &str) -> Option<u64> {
        let key = host.to_string();
        match self
            .cache
            .get_or_fetch(&key, |h| self.inventory.get_hypervisor_capacity_ceiling(h))
        {
            Ok(value) => value,
            Err(e) => {
                warn!(%host, error = %e, "hypervisor ceiling lookup failed");
                None
            }
        }
    }

    pub fn cache(&self) -> &TtlCache<String, u64> {
        &self.cache
    }
}

/// In-memory inventory, used for dry runs and tests.
#[derive(Default)]
pub struct StaticInventory {
    hosts: RwLock<Vec<HostState>>,
    ceilings: RwLock<BTreeMap<HostId, u64>>,
    /// Placed cluster members.
    members: RwLock<Vec<ClusterMember>>,
    unavailable: RwLock<bool>,
}

#[derive(Debug, Clone)]
struct ClusterMember {
    host: HostId,
    tags: Vec<String>,
    metadata: Vec<(String, String)>,
}

impl StaticInventory {
    pub fn new(hosts: Vec<HostState>) -> Self {
        Self {
            hosts: RwLock::new(hosts),
            ..Default::default()
        }
    }

    pub fn set_hosts(&self, hosts: Vec<HostState>) {
        *self.hosts.write().unwrap_or_else(PoisonError::into_inner) = hosts;
    }

    pub fn set_ceiling(&self, host: &str, ceiling_mb: u64) {
        self.ceilings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), ceiling_mb);
    }

    /// Register a placed cluster member.
    pub fn add_cluster_member(&self, host: &str, tags: &[&str], metadata: &[(&str, &str)]) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ClusterMember {
                host: host.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                metadata: metadata
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
    }

    /// Make every call fail with a remote error.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().unwrap_or_else(PoisonError::into_inner) = unavailable;
    }

    fn check_available(&self) -> FilterResult<()> {
        if *self.unavailable.read().unwrap_or_else(PoisonError::into_inner) {
            return Err(FilterError::Remote("inventory unavailable".to_string()));
        }
        Ok(())
    }
}

impl InventoryService for StaticInventory {
    fn get_host_states(&self, query: &HostQuery) -> FilterResult<Vec<HostState>> {
        self.check_available()?;
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        Ok(hosts
            .iter()
            .filter(|h| match &query.cell {
                Some(cell) => h.cell.as_deref() == Some(cell.as_str()),
                None => true,
            })
            .filter(|h| match &query.hosts {
                Some(names) => names.contains(&h.host),
                None => true,
            })
            .cloned()
            .collect())
    }

    fn get_hypervisor_capacity_ceiling(&self, host: &str) -> FilterResult<Option<u64>> {
        self.check_available()?;
        Ok(self
            .ceilings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .copied())
    }

    fn count_cluster_members(
        &self,
        cluster: &ClusterSelector,
        availability_zone: Option<&str>,
    ) -> FilterResult<BTreeMap<HostId, usize>> {
        self.check_available()?;
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = BTreeMap::new();
        for member in members.iter() {
            let matches = match cluster {
                ClusterSelector::Tag(tag) => member.tags.contains(tag),
                ClusterSelector::Metadata { key, value } => member
                    .metadata
                    .iter()
                    .any(|(k, v)| k == key && v == value),
            };
            if !matches {
                continue;
            }
            let in_scope = hosts
                .iter()
                .find(|h| h.host == member.host)
                .map(|h| availability_zone.is_none_or(|az| h.availability_zones().contains(az)))
                .unwrap_or(availability_zone.is_none());
            if in_scope {
                *counts.entry(member.host.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn list_aggregates(&self) -> FilterResult<Vec<Aggregate>> {
        self.check_available()?;
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_name: BTreeMap<String, Aggregate> = BTreeMap::new();
        for agg in hosts.iter().flat_map(|h| h.aggregates.iter()) {
            by_name
                .entry(agg.name.clone())
                .and_modify(|known| known.hosts.extend(agg.hosts.iter().cloned()))
                .or_insert_with(|| agg.clone());
        }
        Ok(by_name.into_values().collect())
    }
}
