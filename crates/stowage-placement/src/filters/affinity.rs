//! Hard server-group policies.

use stowage_state::{GroupPolicy, HostState, RequestSpec};

use super::{HostFilter, Verdict};
use crate::error::FilterResult;

/// Keeps only hosts already holding group members (policy `affinity`).
#[derive(Debug, Default)]
pub struct ServerGroupAffinityFilter;

impl HostFilter for ServerGroupAffinityFilter {
    fn name(&self) -> &'static str {
        "ServerGroupAffinityFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        match &spec.instance_group {
            Some(group) if group.policy == GroupPolicy::Affinity && !group.hosts.is_empty() => {
                if group.hosts.contains(&host.host) {
                    Ok(Verdict::Accepted)
                } else {
                    Ok(Verdict::reject(format!("group {} lives elsewhere", group.id)))
                }
            }
            _ => Ok(Verdict::Accepted),
        }
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}

/// Rejects hosts already holding group members (policy `anti-affinity`).
#[derive(Debug, Default)]
pub struct ServerGroupAntiAffinityFilter;

impl HostFilter for ServerGroupAntiAffinityFilter {
    fn name(&self) -> &'static str {
        "ServerGroupAntiAffinityFilter"
    }

    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict> {
        match &spec.instance_group {
            Some(group)
                if group.policy == GroupPolicy::AntiAffinity && group.hosts.contains(&host.host) =>
            {
                Ok(Verdict::reject(format!("group {} already here", group.id)))
            }
            _ => Ok(Verdict::Accepted),
        }
    }

    fn run_on_rebuild(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::*;
    use stowage_state::InstanceGroup;

    fn group(policy: GroupPolicy) -> InstanceGroup {
        InstanceGroup {
            id: "g1".into(),
            policy,
            members: ["m1".to_string()].into_iter().collect(),
            hosts: ["h1".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn affinity_requires_group_host() {
        let spec = spec(512).with_group(group(GroupPolicy::Affinity));
        let f = ServerGroupAffinityFilter;
        assert!(f.host_passes(&host("h1"), &spec).unwrap().is_accepted());
        assert!(!f.host_passes(&host("h2"), &spec).unwrap().is_accepted());
    }

    #[test]
    fn anti_affinity_rejects_group_host() {
        let spec = spec(512).with_group(group(GroupPolicy::AntiAffinity));
        let f = ServerGroupAntiAffinityFilter;
        assert!(!f.host_passes(&host("h1"), &spec).unwrap().is_accepted());
        assert!(f.host_passes(&host("h2"), &spec).unwrap().is_accepted());
    }

    #[test]
    fn soft_policies_are_ignored() {
        let spec = spec(512).with_group(group(GroupPolicy::SoftAffinity));
        assert!(ServerGroupAffinityFilter.host_passes(&host("h2"), &spec).unwrap().is_accepted());
        assert!(ServerGroupAntiAffinityFilter.host_passes(&host("h1"), &spec).unwrap().is_accepted());
    }
}
