//! CPU feature compatibility for live migration.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use stowage_state::{HostState, RequestSpec};
use tracing::warn;

use super::BatchFilter;
use crate::error::FilterResult;
use crate::inventory::{HostQuery, InventoryService};

#[derive(Deserialize)]
struct CpuInfo {
    features: BTreeSet<String>,
}

fn parse_features(raw: Option<&str>) -> Option<BTreeSet<String>> {
    let raw = raw?;
    serde_json::from_str::<CpuInfo>(raw).ok().map(|info| info.features)
}

/// A running workload can only move to a host offering every CPU feature
/// of its source host.
pub struct CpuInfoMigrationFilter {
    inventory: Arc<dyn InventoryService>,
}

impl CpuInfoMigrationFilter {
    pub fn new(inventory: Arc<dyn InventoryService>) -> Self {
        Self { inventory }
    }
}

impl BatchFilter for CpuInfoMigrationFilter {
    fn name(&self) -> &'static str {
        "CpuInfoMigrationFilter"
    }

    fn filter_all(&self, hosts: Vec<HostState>, spec: &RequestSpec) -> FilterResult<Vec<HostState>> {
        let (Some(source_host), Some(source_node)) = (spec.source_host(), spec.source_node()) else {
            return Ok(hosts);
        };
        if spec.is_resize() || spec.is_rebuild() {
            return Ok(hosts);
        }

        let source = self
            .inventory
            .get_host_states(&HostQuery {
                cell: None,
                hosts: Some(vec![source_host.to_string()]),
            })?
            .into_iter()
            .find(|h| h.host == source_host && h.nodename == source_node);
        let Some(source) = source else {
            warn!(%source_host, %source_node, "cannot find source host/node");
            return Ok(Vec::new());
        };
        let Some(required) = parse_features(source.cpu_info.as_deref()) else {
            warn!(%source_host, %source_node, cpu_info = ?source.cpu_info, "cannot parse source cpu_info");
            return Ok(Vec::new());
        };

        Ok(hosts
            .into_iter()
            .filter(|host| match parse_features(host.cpu_info.as_deref()) {
                Some(features) => required.is_subset(&features),
                None => {
                    warn!(
                        host = %host.host,
                        node = %host.nodename,
                        cpu_info = ?host.cpu_info,
                        "cannot parse target cpu_info"
                    );
                    false
                }
            })
            .collect())
    }

    fn run_once_per_request(&self) -> bool {
        true
    }
}
