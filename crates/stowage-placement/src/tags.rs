//! Per-tenant tag sets, cached.
//!
//! Shard assignment for a tenant lives in its tag set. [`TagCache`] wraps
//! the tenant-tag collaborator behind a wholesale-expiring [`TtlCache`] and
//! exposes one narrow lookup to every stage that needs it.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::cache::{Expiry, TtlCache, TtlCacheConfig};
use crate::clock::{Clock, SystemClock};
use crate::error::FilterResult;

/// External source of tenant tags.
pub trait TenantTagService: Send + Sync {
    /// Full tag set of a tenant, `None` when the tenant is unknown.
    fn get_tags(&self, tenant_id: &str) -> FilterResult<Option<Vec<String>>>;
}

/// Narrow tag lookup embedded in stages.
pub trait TagLookup: Send + Sync {
    /// Tags of a tenant, `None` when they could not be determined.
    fn tags(&self, tenant_id: &str) -> Option<Vec<String>>;
}

/// Tenant tag cache with a single retention window.
pub struct TagCache {
    service: Arc<dyn TenantTagService>,
    cache: TtlCache<String, Vec<String>>,
}

impl TagCache {
    pub fn new(service: Arc<dyn TenantTagService>, config: TtlCacheConfig) -> Self {
        Self::with_clock(service, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        service: Arc<dyn TenantTagService>,
        config: TtlCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = TtlCacheConfig {
            expiry: Expiry::Wholesale,
            ..config
        };
        Self {
            service,
            cache: TtlCache::with_clock("tenant_tags", config, clock),
        }
    }

    pub fn cache(&self) -> &TtlCache<String, Vec<String>> {
        &self.cache
    }
}

impl TagLookup for TagCache {
    fn tags(&self, tenant_id: &str) -> Option<Vec<String>> {
        let key = tenant_id.to_string();
        match self
            .cache
            .get_or_fetch(&key, |id| self.service.get_tags(id))
        {
            Ok(tags) => tags,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "tenant tag lookup failed");
                None
            }
        }
    }
}

/// Fixed tenant tags, used for dry runs and tests.
#[derive(Default)]
pub struct StaticTags {
    tags: RwLock<BTreeMap<String, Vec<String>>>,
}

impl StaticTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant_id: &str, tags: &[&str]) -> Self {
        self.set(tenant_id, tags);
        self
    }

    pub fn set(&self, tenant_id: &str, tags: &[&str]) {
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id.to_string(), tags.iter().map(|t| t.to_string()).collect());
    }
}

impl TenantTagService for StaticTags {
    fn get_tags(&self, tenant_id: &str) -> FilterResult<Option<Vec<String>>> {
        Ok(self
            .tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .cloned())
    }
}
