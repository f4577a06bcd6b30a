//! Soft server-group preferences.
//!
//! Both weighers score a host by the number of group members resident on
//! it. The anti-affinity variant inverts the preference through its
//! multiplier, so equal inputs always produce mirrored orderings.

use std::sync::atomic::{AtomicBool, Ordering};

use stowage_state::{GroupPolicy, HostState, InstanceGroup, RequestSpec};
use tracing::warn;

use super::HostWeigher;

/// Score given to an empty host sharing a shard with the group.
pub const SAME_SHARD_FALLBACK: f64 = 0.5;

fn group_with_policy(spec: &RequestSpec, policy: GroupPolicy) -> Option<&InstanceGroup> {
    spec.instance_group.as_ref().filter(|g| g.policy == policy)
}

fn members_on_host(host: &HostState, group: &InstanceGroup) -> usize {
    host.instances
        .keys()
        .filter(|id| group.members.contains(*id))
        .count()
}

/// Prefers hosts already running members of a soft-affinity group.
///
/// A host without members still earns [`SAME_SHARD_FALLBACK`] when its
/// shard also holds the group, which ranks it between colocated and
/// unrelated hosts.
pub struct ServerGroupSoftAffinityWeigher {
    multiplier: f64,
    shard_prefix: String,
    warned: AtomicBool,
}

impl ServerGroupSoftAffinityWeigher {
    pub fn new(multiplier: f64, shard_prefix: impl Into<String>) -> Self {
        Self {
            multiplier,
            shard_prefix: shard_prefix.into(),
            warned: AtomicBool::new(false),
        }
    }

    fn shard_fallback(&self, host: &HostState, group: &InstanceGroup) -> f64 {
        let mut shards = host.aggregates_with_prefix(&self.shard_prefix);
        let Some(shard) = shards.next() else {
            warn!(host = %host.host, "no shard aggregate found for host");
            return 0.0;
        };
        if shards.next().is_some() {
            warn!(host = %host.host, shard = %shard.name, "host is in several shards, using the first");
        }
        if group.hosts.iter().any(|h| shard.hosts.contains(h)) {
            SAME_SHARD_FALLBACK
        } else {
            0.0
        }
    }
}

impl HostWeigher for ServerGroupSoftAffinityWeigher {
    fn name(&self) -> &'static str {
        "ServerGroupSoftAffinityWeigher"
    }

    fn multiplier(&self) -> f64 {
        if self.multiplier < 0.0 && !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                multiplier = self.multiplier,
                "negative soft-affinity multiplier behaves like soft-anti-affinity"
            );
        }
        self.multiplier
    }

    fn raw_weight(&self, host: &HostState, spec: &RequestSpec) -> f64 {
        let Some(group) = group_with_policy(spec, GroupPolicy::SoftAffinity) else {
            return 0.0;
        };
        match members_on_host(host, group) {
            0 => self.shard_fallback(host, group),
            n => n as f64,
        }
    }
}

/// Prefers hosts running the fewest members of a soft-anti-affinity group.
pub struct ServerGroupSoftAntiAffinityWeigher {
    multiplier: f64,
    warned: AtomicBool,
}

impl ServerGroupSoftAntiAffinityWeigher {
    /// `multiplier` is the configured strength; the weigher negates it.
    pub fn new(multiplier: f64) -> Self {
        Self {
            multiplier,
            warned: AtomicBool::new(false),
        }
    }
}

impl HostWeigher for ServerGroupSoftAntiAffinityWeigher {
    fn name(&self) -> &'static str {
        "ServerGroupSoftAntiAffinityWeigher"
    }

    fn multiplier(&self) -> f64 {
        if self.multiplier < 0.0 && !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                multiplier = self.multiplier,
                "negative soft-anti-affinity multiplier behaves like soft-affinity"
            );
        }
        -self.multiplier
    }

    fn raw_weight(&self, host: &HostState, spec: &RequestSpec) -> f64 {
        group_with_policy(spec, GroupPolicy::SoftAntiAffinity)
            .map(|group| members_on_host(host, group) as f64)
            .unwrap_or(0.0)
    }
}
