//! Capacity admission: memory, vCPUs and disk scaled by allocation ratios.

use stowage_state::{HostState, RequestSpec};

use super::{HostFilter, Verdict};
use crate::error::FilterResult;

/// Rejects hosts without room for the requested flavor.
#[derive(Debug, Default)]
pub struct ResourceFitFilter;

impl ResourceFitFilter {
    fn usable_memory_mb(host: &HostState) -> f64 {
        host.total_memory_mb as f64 * host.ram_allocation_ratio - host.used_memory_mb() as f64
    }

    fn usable_vcpus(host: &HostState) -> f64 {
        f64::from(host.total_vcpus) * host.cpu_allocation_ratio - f64::from(host.used_vcpus)
    }

    fn usable_disk_gb(host: &HostState) -> f64 {
        let used = host.total_disk_gb as f64 - host.free_disk_gb as f64;
        host.total_disk_gb as f64 * host.disk_allocation_ratio - used
    }
}

impl HostFilter for ResourceFitFilter {
    fn name(&self) -> &'static str {
        "ResourceFitFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        let req = spec.resources();

        let memory = Self::usable_memory_mb(host);
        if memory < req.memory_mb as f64 {
            return Ok(Verdict::reject(format!(
                "needs {} MB memory, usable {memory:.0} MB",
                req.memory_mb
            )));
        }
        let vcpus = Self::usable_vcpus(host);
        if vcpus < f64::from(req.vcpus) {
            return Ok(Verdict::reject(format!(
                "needs {} vCPUs, usable {vcpus:.1}",
                req.vcpus
            )));
        }
        let disk = Self::usable_disk_gb(host);
        if disk < req.disk_gb as f64 {
            return Ok(Verdict::reject(format!(
                "needs {} GB disk, usable {disk:.0} GB",
                req.disk_gb
            )));
        }
        Ok(Verdict::Accepted)
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::*;

    #[test]
    fn accepts_when_everything_fits() {
        let verdict = ResourceFitFilter.host_passes(&host("h1"), &spec(4096)).unwrap();
        assert!(verdict.is_accepted());
    }

    #[test]
    fn rejects_insufficient_memory() {
        let mut h = host("h1");
        h.free_memory_mb = 1024;
        assert!(!ResourceFitFilter.host_passes(&h, &spec(2048)).unwrap().is_accepted());
    }

    #[test]
    fn allocation_ratio_allows_overcommit() {
        let mut h = host("h1");
        h.free_memory_mb = 1024;
        h.ram_allocation_ratio = 1.5;
        // usable = 16384 * 1.5 - 15360
        assert!(ResourceFitFilter.host_passes(&h, &spec(2048)).unwrap().is_accepted());
    }

    #[test]
    fn rejects_insufficient_vcpus() {
        let mut h = host("h1");
        h.used_vcpus = 16;
        assert!(!ResourceFitFilter.host_passes(&h, &spec(512)).unwrap().is_accepted());
        h.cpu_allocation_ratio = 2.0;
        assert!(ResourceFitFilter.host_passes(&h, &spec(512)).unwrap().is_accepted());
    }

    #[test]
    fn rejects_insufficient_disk() {
        let mut h = host("h1");
        h.free_disk_gb = 5;
        assert!(!ResourceFitFilter.host_passes(&h, &spec(512)).unwrap().is_accepted());
    }
}
