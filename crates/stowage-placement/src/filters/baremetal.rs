//! Exact core match for bare-metal flavors.

use stowage_state::{EXTRA_SPEC_CPU_ARCH, HostState, RequestSpec};
use tracing::debug;

use super::{HostFilter, Verdict};
use crate::error::FilterResult;

/// A bare-metal node is consumed whole: its free cores must equal the
/// flavor's vCPUs. Only applies to flavors carrying a CPU architecture.
#[derive(Debug, Default)]
pub struct BaremetalExactCoreFilter;

impl HostFilter for BaremetalExactCoreFilter {
    fn name(&self) -> &'static str {
        "BaremetalExactCoreFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        if !spec.flavor.extra_specs.contains_key(EXTRA_SPEC_CPU_ARCH) {
            return Ok(Verdict::Accepted);
        }
        if host.total_vcpus == 0 {
            debug!(host = %host.host, "vCPU totals not tracked");
            return Ok(Verdict::reject("vCPU totals not tracked"));
        }
        let usable = host.total_vcpus.saturating_sub(host.used_vcpus);
        if usable != spec.flavor.vcpus {
            return Ok(Verdict::reject(format!(
                "has {usable} usable vCPUs, flavor needs exactly {}",
                spec.flavor.vcpus
            )));
        }
        Ok(Verdict::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::*;

    fn baremetal_spec(vcpus: u32) -> RequestSpec {
        let mut f = flavor("bm.large", 4096, vcpus);
        f.extra_specs.insert(EXTRA_SPEC_CPU_ARCH.into(), "x86_64".into());
        RequestSpec::new("w1", "p1", f)
    }

    #[test]
    fn ignores_virtual_flavors() {
        let mut h = host("h1");
        h.total_vcpus = 0;
        assert!(BaremetalExactCoreFilter.host_passes(&h, &spec(512)).unwrap().is_accepted());
    }

    #[test]
    fn requires_exact_core_count() {
        let mut h = host("h1");
        h.total_vcpus = 16;
        h.used_vcpus = 0;
        assert!(BaremetalExactCoreFilter.host_passes(&h, &baremetal_spec(16)).unwrap().is_accepted());
        assert!(!BaremetalExactCoreFilter.host_passes(&h, &baremetal_spec(8)).unwrap().is_accepted());
        h.used_vcpus = 8;
        assert!(BaremetalExactCoreFilter.host_passes(&h, &baremetal_spec(8)).unwrap().is_accepted());
    }

    #[test]
    fn untracked_host_is_rejected() {
        let mut h = host("h1");
        h.total_vcpus = 0;
        assert!(!BaremetalExactCoreFilter.host_passes(&h, &baremetal_spec(8)).unwrap().is_accepted());
    }
}
