//! Big-VM admission.
//!
//! Requests at or above `big_vm_mb` must fit the hypervisor backing a host
//! and may only land where enough memory stays free. The hypervisor size
//! comes from the `hv_size_mb` aggregate tag, falling back to the cached
//! inventory ceiling when no aggregate carries the tag. A present but
//! non-numeric tag rejects the host.

use std::sync::Arc;

use stowage_state::{HostState, RequestSpec};
use tracing::{debug, info};

use super::{HostFilter, MetadataReporter, Verdict};
use crate::error::FilterResult;
use crate::inventory::CeilingCache;

/// Aggregate metadata key holding the hypervisor memory size.
pub const HV_SIZE_KEY: &str = "hv_size_mb";

/// Aggregate metadata key holding the per-host big flavor quota.
pub const FLAVOR_QUOTA_KEY: &str = "flavor_quota";

/// Hypervisor size lookup shared by the big-VM stages.
#[derive(Clone)]
pub struct HypervisorSize {
    ceilings: Option<Arc<CeilingCache>>,
    reporter: MetadataReporter,
}

impl HypervisorSize {
    pub fn new(ceilings: Option<Arc<CeilingCache>>, reporter: MetadataReporter) -> Self {
        Self { ceilings, reporter }
    }

    /// Size in MB, or the rejection to return.
    fn resolve(&self, stage: &'static str, host: &HostState) -> Result<u64, Verdict> {
        let values = host.aggregate_metadata_values(HV_SIZE_KEY);
        match values.iter().next() {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                self.reporter.reject(
                    stage,
                    host,
                    format!("invalid {HV_SIZE_KEY} value {raw:?}, only integers are supported"),
                )
            }),
            None => self
                .ceilings
                .as_ref()
                .and_then(|cache| cache.ceiling_mb(&host.host))
                .ok_or_else(|| {
                    self.reporter.reject(
                        stage,
                        host,
                        format!("{HV_SIZE_KEY} not set, host is not in a hypervisor-size aggregate"),
                    )
                }),
        }
    }
}

/// Rejects hosts whose hypervisor is smaller than a big request.
pub struct BigVmHypervisorRamFilter {
    big_vm_mb: u64,
    size: HypervisorSize,
}

impl BigVmHypervisorRamFilter {
    pub fn new(big_vm_mb: u64, size: HypervisorSize) -> Self {
        Self { big_vm_mb, size }
    }
}

impl HostFilter for BigVmHypervisorRamFilter {
    fn name(&self) -> &'static str {
        "BigVmHypervisorRamFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        let requested = spec.flavor.memory_mb;
        if requested < self.big_vm_mb {
            return Ok(Verdict::Accepted);
        }
        let hv_mb = match self.size.resolve(self.name(), host) {
            Ok(mb) => mb,
            Err(verdict) => return Ok(verdict),
        };
        if requested > hv_mb {
            debug!(host = %host.host, requested, hv_mb, "hypervisor too small for big VM");
            return Ok(Verdict::reject(format!(
                "hypervisor supports up to {hv_mb} MB, requested {requested} MB"
            )));
        }
        Ok(Verdict::Accepted)
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}

/// Only places big requests where memory utilization leaves, on average,
/// half the requested memory free.
pub struct BigVmClusterUtilizationFilter {
    big_vm_mb: u64,
    size: HypervisorSize,
}

impl BigVmClusterUtilizationFilter {
    pub fn new(big_vm_mb: u64, size: HypervisorSize) -> Self {
        Self { big_vm_mb, size }
    }

    /// Highest tolerated utilization in percent.
    pub fn max_used_percent(requested_mb: u64, hv_mb: u64) -> f64 {
        let hv = hv_mb as f64;
        (hv - requested_mb as f64 / 2.0) / hv * 100.0
    }
}

impl HostFilter for BigVmClusterUtilizationFilter {
    fn name(&self) -> &'static str {
        "BigVmClusterUtilizationFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        let requested = spec.flavor.memory_mb;
        if requested < self.big_vm_mb {
            return Ok(Verdict::Accepted);
        }
        let usable = host.total_memory_mb as f64 * host.ram_allocation_ratio;
        if usable <= 0.0 {
            return Ok(Verdict::reject("no usable memory reported"));
        }
        let used_percent = host.used_memory_mb() as f64 / usable * 100.0;

        let hv_mb = match self.size.resolve(self.name(), host) {
            Ok(mb) => mb,
            Err(verdict) => return Ok(verdict),
        };
        if hv_mb == 0 {
            return Ok(Verdict::reject(format!("{HV_SIZE_KEY} is zero")));
        }
        let max_percent = Self::max_used_percent(requested, hv_mb);
        if used_percent > max_percent {
            info!(
                host = %host.host,
                used_percent,
                max_percent,
                "memory utilization too high for big VMs"
            );
            return Ok(Verdict::reject(format!(
                "{used_percent:.1}% memory used, big VMs need at most {max_percent:.1}%"
            )));
        }
        Ok(Verdict::Accepted)
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}

/// Caps the number of workloads of one configured flavor per host.
pub struct BigFlavorFilter {
    big_vm_flavor: Option<String>,
    reporter: MetadataReporter,
}

impl BigFlavorFilter {
    pub fn new(big_vm_flavor: Option<String>, reporter: MetadataReporter) -> Self {
        Self {
            big_vm_flavor,
            reporter,
        }
    }
}

impl HostFilter for BigFlavorFilter {
    fn name(&self) -> &'static str {
        "BigFlavorFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        let Some(big) = self.big_vm_flavor.as_deref() else {
            return Ok(Verdict::Accepted);
        };
        if spec.flavor.name != big {
            debug!(flavor = %spec.flavor.name, "not the big flavor, skipping quota check");
            return Ok(Verdict::Accepted);
        }
        let quota = match host.aggregate_metadata_values(FLAVOR_QUOTA_KEY).iter().next() {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(q) => q,
                Err(_) => {
                    return Ok(self.reporter.reject(
                        self.name(),
                        host,
                        format!("invalid {FLAVOR_QUOTA_KEY} value {raw:?}"),
                    ));
                }
            },
            None => {
                return Ok(self.reporter.reject(
                    self.name(),
                    host,
                    format!("{FLAVOR_QUOTA_KEY} not set"),
                ));
            }
        };
        let resident = host
            .instances
            .values()
            .filter(|w| w.flavor_name == big)
            .count();
        if resident >= quota {
            return Ok(Verdict::reject(format!(
                "{resident} {big} workloads already, quota {quota}"
            )));
        }
        Ok(Verdict::Accepted)
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }

    fn run_once_per_request(&self) -> bool {
        true
    }
}
