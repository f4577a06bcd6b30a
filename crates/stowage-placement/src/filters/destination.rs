//! Forced, requested and excluded destinations.

use stowage_state::{HostState, RequestSpec};

use super::{HostFilter, Verdict};
use crate::error::FilterResult;

/// Honours forced hosts/nodes and the requested destination.
#[derive(Debug, Default)]
pub struct DestinationFilter;

impl HostFilter for DestinationFilter {
    fn name(&self) -> &'static str {
        "DestinationFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        if !spec.force_hosts.is_empty() && !spec.force_hosts.contains(&host.host) {
            return Ok(Verdict::reject("not a forced host"));
        }
        if !spec.force_nodes.is_empty() && !spec.force_nodes.contains(&host.nodename) {
            return Ok(Verdict::reject("not a forced node"));
        }
        if let Some(dest) = &spec.requested_destination {
            if dest.host.as_ref().is_some_and(|h| *h != host.host) {
                return Ok(Verdict::reject("not the requested destination host"));
            }
            if dest.node.as_ref().is_some_and(|n| *n != host.nodename) {
                return Ok(Verdict::reject("not the requested destination node"));
            }
            if let Some(cell) = &dest.cell {
                if host.cell.as_ref() != Some(cell) {
                    return Ok(Verdict::reject(format!("outside cell {cell}")));
                }
            }
        }
        Ok(Verdict::Accepted)
    }
}

/// Drops explicitly ignored hosts and hosts already tried.
#[derive(Debug, Default)]
pub struct IgnoreHostsFilter;

impl HostFilter for IgnoreHostsFilter {
    fn name(&self) -> &'static str {
        "IgnoreHostsFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        if spec.ignore_hosts.contains(&host.host) {
            return Ok(Verdict::reject("host is ignored"));
        }
        if spec
            .retry
            .as_ref()
            .is_some_and(|retry| retry.hosts.contains(&host.host))
        {
            return Ok(Verdict::reject("host already tried"));
        }
        Ok(Verdict::Accepted)
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}
