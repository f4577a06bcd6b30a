//! Keep relocations inside the source shard where possible.

use stowage_state::{CheckType, EXTRA_SPEC_CPU_ARCH, HostState, RequestSpec};

use super::HostWeigher;

/// Scores 1.0 for hosts sharing a shard aggregate with the request's
/// source host, for one kind of relocation.
pub struct PreferSameShardWeigher {
    name: &'static str,
    check_type: CheckType,
    multiplier: f64,
    shard_prefix: String,
}

impl PreferSameShardWeigher {
    pub fn on_resize(multiplier: f64, shard_prefix: impl Into<String>) -> Self {
        Self {
            name: "PreferSameShardOnResizeWeigher",
            check_type: CheckType::Resize,
            multiplier,
            shard_prefix: shard_prefix.into(),
        }
    }

    pub fn on_live_migrate(multiplier: f64, shard_prefix: impl Into<String>) -> Self {
        Self {
            name: "PreferSameShardOnLiveMigrateWeigher",
            check_type: CheckType::LiveMigrate,
            multiplier,
            shard_prefix: shard_prefix.into(),
        }
    }
}

impl HostWeigher for PreferSameShardWeigher {
    fn name(&self) -> &'static str {
        self.name
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn raw_weight(&self, host: &HostState, spec: &RequestSpec) -> f64 {
        if spec.check_type() != Some(self.check_type) {
            return 0.0;
        }
        if spec.flavor.extra_specs.contains_key(EXTRA_SPEC_CPU_ARCH) {
            return 0.0;
        }
        let Some(source) = spec.source_host() else {
            return 0.0;
        };
        let same_shard = host
            .aggregates_with_prefix(&self.shard_prefix)
            .any(|shard| shard.hosts.contains(source));
        if same_shard { 1.0 } else { 0.0 }
    }
}
