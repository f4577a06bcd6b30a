//! Name-to-stage registry.
//!
//! Pipelines are assembled from the stage names listed in
//! `[scheduler]`, in the listed order. Names are resolved once, when the
//! pipelines are built; an unknown name is a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use stowage_core::StowageConfig;

use crate::cache::{Expiry, TtlCacheConfig};
use crate::error::{FilterError, FilterResult};
use crate::filters::affinity::{ServerGroupAffinityFilter, ServerGroupAntiAffinityFilter};
use crate::filters::availability_zone::AvailabilityZoneFilter;
use crate::filters::baremetal::BaremetalExactCoreFilter;
use crate::filters::bigvm::{
    BigFlavorFilter, BigVmClusterUtilizationFilter, BigVmHypervisorRamFilter, HypervisorSize,
};
use crate::filters::cpu_info::CpuInfoMigrationFilter;
use crate::filters::destination::{DestinationFilter, IgnoreHostsFilter};
use crate::filters::resources::ResourceFitFilter;
use crate::filters::shard::ShardFilter;
use crate::filters::{FilterPipeline, FilterStage, MetadataReporter};
use crate::inventory::{CeilingCache, InventoryService};
use crate::tags::{TagCache, TagLookup, TenantTagService};
use crate::weighers::affinity::{ServerGroupSoftAffinityWeigher, ServerGroupSoftAntiAffinityWeigher};
use crate::weighers::ram::FreeRamWeigher;
use crate::weighers::shard::PreferSameShardWeigher;
use crate::weighers::{HostWeigher, WeigherPipeline};

/// Everything a stage may be constructed from.
#[derive(Clone)]
pub struct StageContext {
    pub config: StowageConfig,
    pub inventory: Arc<dyn InventoryService>,
    pub tags: Arc<dyn TagLookup>,
    pub ceilings: Option<Arc<CeilingCache>>,
}

impl StageContext {
    pub fn new(config: StowageConfig, inventory: Arc<dyn InventoryService>, tags: Arc<dyn TagLookup>) -> Self {
        Self {
            config,
            inventory,
            tags,
            ceilings: None,
        }
    }

    /// Wrap raw collaborators in the caches sized by `[cache]`.
    pub fn from_services(
        config: StowageConfig,
        inventory: Arc<dyn InventoryService>,
        tag_service: Arc<dyn TenantTagService>,
    ) -> Self {
        let tags = TagCache::new(
            tag_service,
            TtlCacheConfig {
                ttl: config.cache.tenant_tags_ttl(),
                max_entries: config.cache.max_entries,
                expiry: Expiry::Wholesale,
            },
        );
        let ceilings = CeilingCache::new(
            inventory.clone(),
            TtlCacheConfig {
                ttl: config.cache.host_attribute_ttl(),
                max_entries: config.cache.max_entries,
                expiry: Expiry::PerEntry,
            },
        );
        Self::new(config, inventory, Arc::new(tags)).with_ceilings(Arc::new(ceilings))
    }

    pub fn with_ceilings(mut self, ceilings: Arc<CeilingCache>) -> Self {
        self.ceilings = Some(ceilings);
        self
    }

    pub fn reporter(&self) -> MetadataReporter {
        MetadataReporter::new(self.config.filters.clone(), self.config.logging.missing_metadata)
    }

    fn hypervisor_size(&self) -> HypervisorSize {
        HypervisorSize::new(self.ceilings.clone(), self.reporter())
    }
}

pub type FilterFactory = fn(&StageContext) -> FilterStage;
pub type WeigherFactory = fn(&StageContext) -> Box<dyn HostWeigher>;

/// Known stage constructors.
pub struct StageRegistry {
    filters: HashMap<&'static str, FilterFactory>,
    weighers: HashMap<&'static str, WeigherFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        let mut registry = Self {
            filters: HashMap::new(),
            weighers: HashMap::new(),
        };
        registry
            .register_filter("DestinationFilter", |_| {
                FilterStage::PerHost(Box::new(DestinationFilter))
            })
            .register_filter("IgnoreHostsFilter", |_| {
                FilterStage::PerHost(Box::new(IgnoreHostsFilter))
            })
            .register_filter("AvailabilityZoneFilter", |_| {
                FilterStage::PerHost(Box::new(AvailabilityZoneFilter))
            })
            .register_filter("ResourceFitFilter", |_| {
                FilterStage::PerHost(Box::new(ResourceFitFilter))
            })
            .register_filter("ServerGroupAffinityFilter", |_| {
                FilterStage::PerHost(Box::new(ServerGroupAffinityFilter))
            })
            .register_filter("ServerGroupAntiAffinityFilter", |_| {
                FilterStage::PerHost(Box::new(ServerGroupAntiAffinityFilter))
            })
            .register_filter("BaremetalExactCoreFilter", |_| {
                FilterStage::PerHost(Box::new(BaremetalExactCoreFilter))
            })
            .register_filter("BigVmHypervisorRamFilter", |ctx| {
                FilterStage::PerHost(Box::new(BigVmHypervisorRamFilter::new(
                    ctx.config.filters.big_vm_mb,
                    ctx.hypervisor_size(),
                )))
            })
            .register_filter("BigVmClusterUtilizationFilter", |ctx| {
                FilterStage::PerHost(Box::new(BigVmClusterUtilizationFilter::new(
                    ctx.config.filters.big_vm_mb,
                    ctx.hypervisor_size(),
                )))
            })
            .register_filter("BigFlavorFilter", |ctx| {
                FilterStage::PerHost(Box::new(BigFlavorFilter::new(
                    ctx.config.filters.big_vm_flavor.clone(),
                    ctx.reporter(),
                )))
            })
            .register_filter("ShardFilter", |ctx| {
                FilterStage::Batch(Box::new(ShardFilter::new(
                    ctx.tags.clone(),
                    ctx.inventory.clone(),
                    ctx.config.filters.clone(),
                    ctx.reporter(),
                )))
            })
            .register_filter("CpuInfoMigrationFilter", |ctx| {
                FilterStage::Batch(Box::new(CpuInfoMigrationFilter::new(ctx.inventory.clone())))
            });

        registry
            .register_weigher("ServerGroupSoftAffinityWeigher", |ctx| {
                Box::new(ServerGroupSoftAffinityWeigher::new(
                    ctx.config.weighers.soft_affinity_multiplier,
                    ctx.config.filters.shard_prefix.clone(),
                ))
            })
            .register_weigher("ServerGroupSoftAntiAffinityWeigher", |ctx| {
                Box::new(ServerGroupSoftAntiAffinityWeigher::new(
                    ctx.config.weighers.soft_anti_affinity_multiplier,
                ))
            })
            .register_weigher("PreferSameShardOnResizeWeigher", |ctx| {
                Box::new(PreferSameShardWeigher::on_resize(
                    ctx.config.weighers.same_shard_resize_multiplier,
                    ctx.config.filters.shard_prefix.clone(),
                ))
            })
            .register_weigher("PreferSameShardOnLiveMigrateWeigher", |ctx| {
                Box::new(PreferSameShardWeigher::on_live_migrate(
                    ctx.config.weighers.same_shard_live_migrate_multiplier,
                    ctx.config.filters.shard_prefix.clone(),
                ))
            })
            .register_weigher("FreeRamWeigher", |ctx| {
                Box::new(FreeRamWeigher::new(ctx.config.weighers.ram_multiplier))
            });
        registry
    }
}

impl StageRegistry {
    pub fn register_filter(&mut self, name: &'static str, factory: FilterFactory) -> &mut Self {
        self.filters.insert(name, factory);
        self
    }

    pub fn register_weigher(&mut self, name: &'static str, factory: WeigherFactory) -> &mut Self {
        self.weighers.insert(name, factory);
        self
    }

    pub fn filter_pipeline(&self, ctx: &StageContext) -> FilterResult<FilterPipeline> {
        let stages = ctx
            .config
            .scheduler
            .enabled_filters
            .iter()
            .map(|name| {
                self.filters
                    .get(name.as_str())
                    .map(|factory| factory(ctx))
                    .ok_or_else(|| FilterError::Configuration(format!("unknown filter: {name}")))
            })
            .collect::<FilterResult<Vec<_>>>()?;
        Ok(FilterPipeline::new(stages))
    }

    pub fn weigher_pipeline(&self, ctx: &StageContext) -> FilterResult<WeigherPipeline> {
        let weighers = ctx
            .config
            .scheduler
            .enabled_weighers
            .iter()
            .map(|name| {
                self.weighers
                    .get(name.as_str())
                    .map(|factory| factory(ctx))
                    .ok_or_else(|| FilterError::Configuration(format!("unknown weigher: {name}")))
            })
            .collect::<FilterResult<Vec<_>>>()?;
        Ok(WeigherPipeline::new(weighers))
    }
}
