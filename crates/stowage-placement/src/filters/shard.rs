//! Shard admission.
//!
//! A host passes when one of its shard aggregates is among the tenant's
//! shard tags, or the tenant is enabled for every shard. Workloads that
//! belong to a Kubernetes cluster are further restricted to the shard
//! already holding most of the cluster's members.

use std::collections::BTreeSet;
use std::sync::Arc;

use stowage_core::FilterConfig;
use stowage_state::{EXTRA_SPEC_CPU_ARCH, HostState, RequestSpec};
use tracing::{debug, error, info};

use super::{BatchFilter, MetadataReporter, Verdict};
use crate::error::{FilterError, FilterResult};
use crate::inventory::{ClusterSelector, InventoryService};
use crate::tags::TagLookup;

/// Tag prefix identifying a Kubernikus cluster member.
pub const KUBERNIKUS_TAG_PREFIX: &str = "kubernikus:kluster";

/// Metadata key prefix identifying a Gardener cluster member.
pub const GARDENER_METADATA_PREFIX: &str = "kubernetes.io-cluster-";

/// Keeps hosts in the shards the tenant is tagged for, narrowed to the
/// majority shard of the workload's cluster when it has one.
pub struct ShardFilter {
    tags: Arc<dyn TagLookup>,
    inventory: Arc<dyn InventoryService>,
    config: FilterConfig,
    reporter: MetadataReporter,
}

impl ShardFilter {
    pub fn new(
        tags: Arc<dyn TagLookup>,
        inventory: Arc<dyn InventoryService>,
        config: FilterConfig,
        reporter: MetadataReporter,
    ) -> Self {
        Self {
            tags,
            inventory,
            config,
            reporter,
        }
    }

    /// Shard-related tags of the tenant, `None` when unavailable.
    fn tenant_shards(&self, project_id: &str) -> Option<BTreeSet<String>> {
        self.tags.tags(project_id).map(|tags| {
            tags.into_iter()
                .filter(|t| *t == self.config.all_shards_tag || t.starts_with(&self.config.shard_prefix))
                .collect()
        })
    }

    fn cluster_selector(spec: &RequestSpec) -> Option<ClusterSelector> {
        if let Some(tag) = spec
            .workload_tags
            .iter()
            .find(|t| t.starts_with(KUBERNIKUS_TAG_PREFIX))
        {
            return Some(ClusterSelector::Tag(tag.clone()));
        }
        spec.workload_metadata
            .iter()
            .find(|(k, _)| k.starts_with(GARDENER_METADATA_PREFIX))
            .map(|(key, value)| ClusterSelector::Metadata {
                key: key.clone(),
                value: value.clone(),
            })
    }

    /// Shard aggregate holding most members of the workload's cluster.
    ///
    /// Ties go to the lexicographically first shard name.
    pub fn majority_shard(&self, spec: &RequestSpec) -> FilterResult<Option<String>> {
        if spec.flavor.name.starts_with(&self.config.shard_exempt_flavor_prefix)
            || spec.is_resize()
            || spec.is_rebuild()
        {
            return Ok(None);
        }
        let Some(selector) = Self::cluster_selector(spec) else {
            return Ok(None);
        };

        let counts = self
            .inventory
            .count_cluster_members(&selector, spec.availability_zone.as_deref())
            .map_err(|e| match e {
                FilterError::Remote(msg) => FilterError::Remote(format!(
                    "unable to locate cluster members of {}: {msg}",
                    spec.workload_id
                )),
                other => other,
            })?;
        if counts.is_empty() {
            return Ok(None);
        }

        let mut shards: Vec<_> = self
            .inventory
            .list_aggregates()?
            .into_iter()
            .filter(|agg| agg.name.starts_with(&self.config.shard_prefix))
            .collect();
        shards.sort_by(|a, b| a.name.cmp(&b.name));

        let mut best: Option<(String, usize)> = None;
        for agg in shards {
            let members: usize = counts
                .iter()
                .filter(|(host, _)| agg.hosts.contains(*host))
                .map(|(_, n)| n)
                .sum();
            if members > 0 && best.as_ref().is_none_or(|(_, top)| members > *top) {
                best = Some((agg.name, members));
            }
        }
        if let Some((shard, members)) = &best {
            info!(workload = %spec.workload_id, %shard, members, "cluster majority shard");
        }
        Ok(best.map(|(shard, _)| shard))
    }

    fn host_passes(
        &self,
        host: &HostState,
        shards: &BTreeSet<String>,
        k8s_shard: Option<&str>,
    ) -> Verdict {
        let host_shards: BTreeSet<&str> = host
            .aggregates_with_prefix(&self.config.shard_prefix)
            .map(|agg| agg.name.as_str())
            .collect();
        if host_shards.is_empty() {
            return self.reporter.reject(
                self.name(),
                host,
                format!("not in an aggregate starting with {}", self.config.shard_prefix),
            );
        }

        if !shards.contains(&self.config.all_shards_tag)
            && !host_shards.iter().any(|s| shards.contains(*s))
        {
            debug!(host = %host.host, ?host_shards, ?shards, "host shard not in tenant shards");
            return Verdict::reject("host shard not assigned to tenant");
        }

        if let Some(k8s) = k8s_shard {
            if !host_shards.contains(k8s) {
                debug!(host = %host.host, %k8s, "host outside cluster shard");
                return Verdict::reject(format!("not in cluster shard {k8s}"));
            }
        }
        Verdict::Accepted
    }
}

impl BatchFilter for ShardFilter {
    fn name(&self) -> &'static str {
        "ShardFilter"
    }

    fn filter_all(&self, hosts: Vec<HostState>, spec: &RequestSpec) -> FilterResult<Vec<HostState>> {
        if spec.flavor.extra_specs.contains_key(EXTRA_SPEC_CPU_ARCH) {
            debug!("shard filter not applicable to bare-metal requests");
            return Ok(hosts);
        }

        let k8s_shard = self.majority_shard(spec)?;

        let Some(shards) = self.tenant_shards(&spec.project_id) else {
            error!(project = %spec.project_id, "failure retrieving shards");
            return Ok(Vec::new());
        };
        if shards.is_empty() {
            error!(project = %spec.project_id, "project is not assigned to any shard");
            return Ok(Vec::new());
        }

        Ok(hosts
            .into_iter()
            .filter(|host| match self.host_passes(host, &shards, k8s_shard.as_deref()) {
                Verdict::Accepted => true,
                Verdict::Rejected(reason) => {
                    debug!(host = %host.host, %reason, "shard filter rejected host");
                    false
                }
            })
            .collect())
    }
}
