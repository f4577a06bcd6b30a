//! stowage.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StowageConfig {
    pub scheduler: SchedulerConfig,
    pub filters: FilterConfig,
    pub weighers: WeigherConfig,
    pub cache: CacheConfig,
    pub migration: MigrationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Filter stages in execution order.
    pub enabled_filters: Vec<String>,
    pub enabled_weighers: Vec<String>,
    /// Alternates returned next to the primary destination.
    pub max_alternates: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled_filters: [
                "DestinationFilter",
                "IgnoreHostsFilter",
                "AvailabilityZoneFilter",
                "ResourceFitFilter",
                "ServerGroupAffinityFilter",
                "ServerGroupAntiAffinityFilter",
                "BaremetalExactCoreFilter",
                "BigVmHypervisorRamFilter",
                "BigVmClusterUtilizationFilter",
                "BigFlavorFilter",
                "ShardFilter",
                "CpuInfoMigrationFilter",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            enabled_weighers: [
                "ServerGroupSoftAffinityWeigher",
                "ServerGroupSoftAntiAffinityWeigher",
                "PreferSameShardOnResizeWeigher",
                "PreferSameShardOnLiveMigrateWeigher",
                "FreeRamWeigher",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_alternates: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Requests at or above this memory size are "big VMs".
    pub big_vm_mb: u64,
    /// Flavor name subject to a per-host quota.
    pub big_vm_flavor: Option<String>,
    /// Aggregate name prefix marking a shard.
    pub shard_prefix: String,
    /// Tenant tag granting access to every shard.
    pub all_shards_tag: String,
    /// Flavors with this name prefix are exempt from sharding.
    pub shard_exempt_flavor_prefix: String,
    /// Hypervisor types that legitimately lack virtualization metadata.
    pub baremetal_hypervisor_types: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            big_vm_mb: 1024 * 1024,
            big_vm_flavor: None,
            shard_prefix: "vc-".to_string(),
            all_shards_tag: "sharding_enabled".to_string(),
            shard_exempt_flavor_prefix: "hana_".to_string(),
            baremetal_hypervisor_types: vec!["ironic".to_string()],
        }
    }
}

impl FilterConfig {
    pub fn is_baremetal(&self, hypervisor_type: &str) -> bool {
        self.baremetal_hypervisor_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(hypervisor_type))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeigherConfig {
    pub soft_affinity_multiplier: f64,
    pub soft_anti_affinity_multiplier: f64,
    pub same_shard_resize_multiplier: f64,
    pub same_shard_live_migrate_multiplier: f64,
    pub ram_multiplier: f64,
}

impl Default for WeigherConfig {
    fn default() -> Self {
        Self {
            soft_affinity_multiplier: 1.0,
            soft_anti_affinity_multiplier: 1.0,
            same_shard_resize_multiplier: 1.0,
            same_shard_live_migrate_multiplier: 1.0,
            ram_multiplier: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub host_attribute_ttl_secs: u64,
    pub tenant_tags_ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host_attribute_ttl_secs: 600,
            tenant_tags_ttl_secs: 600,
            max_entries: 4096,
        }
    }
}

impl CacheConfig {
    pub fn host_attribute_ttl(&self) -> Duration {
        Duration::from_secs(self.host_attribute_ttl_secs)
    }

    pub fn tenant_tags_ttl(&self) -> Duration {
        Duration::from_secs(self.tenant_tags_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Alternates consulted after the first candidate; `-1` is unbounded.
    pub max_retries: i32,
    pub query_timeout_ms: u64,
    pub precheck_timeout_ms: u64,
    pub claim_timeout_ms: u64,
    pub dispatch_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_retries: -1,
            query_timeout_ms: 60_000,
            precheck_timeout_ms: 30_000,
            claim_timeout_ms: 30_000,
            dispatch_timeout_ms: 10_000,
        }
    }
}

impl MigrationConfig {
    /// Maximum number of candidates to try, `None` when unbounded.
    pub fn candidate_budget(&self) -> Option<usize> {
        (self.max_retries >= 0).then(|| self.max_retries as usize + 1)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn precheck_timeout(&self) -> Duration {
        Duration::from_millis(self.precheck_timeout_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// Log level used for a soft rejection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub missing_metadata: SeverityMatrix,
}

/// Severity of "host lacks required metadata", by host kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SeverityMatrix {
    pub baremetal: Severity,
    pub virtualization: Severity,
}

impl Default for SeverityMatrix {
    fn default() -> Self {
        Self {
            baremetal: Severity::Debug,
            virtualization: Severity::Error,
        }
    }
}

impl SeverityMatrix {
    pub fn for_host(&self, baremetal: bool) -> Severity {
        if baremetal {
            self.baremetal
        } else {
            self.virtualization
        }
    }
}

impl StowageConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StowageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings no stage could interpret.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.max_retries < -1 {
            return Err(ConfigError::Invalid(format!(
                "migration.max_retries must be >= -1, got {}",
                self.migration.max_retries
            )));
        }
        if self.scheduler.max_alternates == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_alternates must be at least 1".to_string(),
            ));
        }
        if self.cache.host_attribute_ttl_secs == 0 || self.cache.tenant_tags_ttl_secs == 0 {
            return Err(ConfigError::Invalid("cache TTLs must be non-zero".to_string()));
        }
        let multipliers = [
            ("soft_affinity_multiplier", self.weighers.soft_affinity_multiplier),
            ("soft_anti_affinity_multiplier", self.weighers.soft_anti_affinity_multiplier),
            ("same_shard_resize_multiplier", self.weighers.same_shard_resize_multiplier),
            (
                "same_shard_live_migrate_multiplier",
                self.weighers.same_shard_live_migrate_multiplier,
            ),
            ("ram_multiplier", self.weighers.ram_multiplier),
        ];
        for (name, value) in multipliers {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "weighers.{name} must be finite"
                )));
            }
        }
        if self.filters.shard_prefix.is_empty() {
            return Err(ConfigError::Invalid("filters.shard_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}
