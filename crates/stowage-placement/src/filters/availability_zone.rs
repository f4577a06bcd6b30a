//! Availability zone admission.

use stowage_state::{HostState, RequestSpec};

use super::{HostFilter, Verdict};
use crate::error::FilterResult;

/// Keeps hosts in the requested availability zone.
#[derive(Debug, Default)]
pub struct AvailabilityZoneFilter;

impl HostFilter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "AvailabilityZoneFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        let Some(zone) = spec.availability_zone.as_deref() else {
            return Ok(Verdict::Accepted);
        };
        if host.availability_zones().contains(zone) {
            Ok(Verdict::Accepted)
        } else {
            Ok(Verdict::reject(format!("not in availability zone {zone}")))
        }
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}
