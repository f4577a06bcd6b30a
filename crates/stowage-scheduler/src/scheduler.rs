//! Scheduler — inventory → filters → weighers → destinations.
//!
//! One call is one scheduling attempt. For multi-instance requests every
//! instance is placed against the same host snapshots, with earlier
//! placements consumed so later instances see the reduced capacity, and
//! compute-once filter outcomes are shared across instances.

use std::sync::Arc;

use stowage_placement::{
    FilterPipeline, FilterRun, HostQuery, InventoryService, StageContext, StageRegistry, WeighedHost,
    WeigherPipeline,
};
use stowage_state::{AllocationCandidate, AllocationRequest, RequestSpec, WorkloadId};
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::query::{DestinationQuery, QueryFuture};

/// Chosen destination plus ranked fallbacks in the same cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub primary: WeighedHost,
    pub alternates: Vec<WeighedHost>,
}

impl Selection {
    /// Ledger-ready candidates, primary first.
    pub fn to_candidates(&self, spec: &RequestSpec, with_alternates: bool) -> SchedulerResult<Vec<AllocationCandidate>> {
        let alternates: &[WeighedHost] = if with_alternates { &self.alternates } else { &[] };
        std::iter::once(&self.primary)
            .chain(alternates)
            .map(|weighed| {
                let host = &weighed.host;
                let request = AllocationRequest::single(&host.provider_id, spec.resources());
                Ok(AllocationCandidate {
                    host: host.host.clone(),
                    nodename: host.nodename.clone(),
                    provider_id: host.provider_id.clone(),
                    allocation_request: Some(serde_json::to_string(&request)?),
                    version: host.provider_generation,
                })
            })
            .collect()
    }
}

/// Host selection service.
pub struct Scheduler {
    inventory: Arc<dyn InventoryService>,
    filters: FilterPipeline,
    weighers: WeigherPipeline,
    max_alternates: usize,
}

impl Scheduler {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        filters: FilterPipeline,
        weighers: WeigherPipeline,
        max_alternates: u32,
    ) -> Self {
        Self {
            inventory,
            filters,
            weighers,
            max_alternates: max_alternates as usize,
        }
    }

    /// Build both pipelines from the configured stage names.
    pub fn from_context(ctx: &StageContext, registry: &StageRegistry) -> SchedulerResult<Self> {
        let filters = registry.filter_pipeline(ctx)?;
        let weighers = registry.weigher_pipeline(ctx)?;
        info!(
            filters = ?filters.stage_names(),
            weighers = ?weighers.weigher_names(),
            "scheduler pipelines built"
        );
        Ok(Self::new(
            ctx.inventory.clone(),
            filters,
            weighers,
            ctx.config.scheduler.max_alternates,
        ))
    }

    /// Place a single instance.
    pub fn schedule(&self, spec: &RequestSpec) -> SchedulerResult<Selection> {
        let mut selections = self.schedule_for(spec, std::slice::from_ref(&spec.workload_id))?;
        selections
            .pop()
            .ok_or_else(|| SchedulerError::NoValidHost(spec.workload_id.clone()))
    }

    /// Place every instance of `spec`, one selection per instance, in
    /// [`Scheduler::instance_ids`] order.
    pub fn schedule_all(&self, spec: &RequestSpec) -> SchedulerResult<Vec<Selection>> {
        self.schedule_for(spec, &Self::instance_ids(spec))
    }

    /// Consumer ids of the instances of `spec`: the workload id, then
    /// `{id}-1`, `{id}-2`, ...
    pub fn instance_ids(spec: &RequestSpec) -> Vec<WorkloadId> {
        (0..spec.num_instances.max(1))
            .map(|i| match i {
                0 => spec.workload_id.clone(),
                n => format!("{}-{n}", spec.workload_id),
            })
            .collect()
    }

    fn host_query(spec: &RequestSpec) -> HostQuery {
        HostQuery {
            cell: spec
                .requested_destination
                .as_ref()
                .and_then(|d| d.cell.clone()),
            hosts: (!spec.force_hosts.is_empty()).then(|| spec.force_hosts.clone()),
        }
    }

    fn schedule_for(&self, spec: &RequestSpec, workload_ids: &[WorkloadId]) -> SchedulerResult<Vec<Selection>> {
        let mut hosts = self.inventory.get_host_states(&Self::host_query(spec))?;
        debug!(workload = %spec.workload_id, candidates = hosts.len(), "host states loaded");

        // Group hosts grow as instances are placed, so hard group policies
        // also hold between instances of this request.
        let mut attempt = spec.clone();
        let mut run = FilterRun::new();
        let mut selections = Vec::with_capacity(workload_ids.len());
        for workload_id in workload_ids {
            let survivors = self.filters.filter_with(&mut run, hosts.clone(), &attempt)?;
            if survivors.is_empty() {
                return Err(SchedulerError::NoValidHost(format!(
                    "no host passed the filters for workload {workload_id}"
                )));
            }

            let mut ranked = self.weighers.weigh(survivors, &attempt).into_iter();
            let Some(primary) = ranked.next() else {
                return Err(SchedulerError::NoValidHost(workload_id.clone()));
            };
            let alternates: Vec<WeighedHost> = ranked
                .filter(|w| w.host.cell == primary.host.cell)
                .take(self.max_alternates)
                .collect();

            if let Some(host) = hosts
                .iter_mut()
                .find(|h| h.host == primary.host.host && h.nodename == primary.host.nodename)
            {
                host.consume(workload_id, &spec.flavor);
            }
            if let Some(group) = attempt.instance_group.as_mut() {
                group.hosts.insert(primary.host.host.clone());
            }
            info!(
                workload = %workload_id,
                host = %primary.host.host,
                weight = primary.weight,
                alternates = alternates.len(),
                "destination selected"
            );
            selections.push(Selection { primary, alternates });
        }
        Ok(selections)
    }
}

impl DestinationQuery for Scheduler {
    fn select_destinations<'a>(
        &'a self,
        spec: &'a RequestSpec,
        workload_ids: &'a [WorkloadId],
        return_alternates: bool,
    ) -> QueryFuture<'a> {
        let result = self.schedule_for(spec, workload_ids).and_then(|selections| {
            selections
                .iter()
                .map(|s| s.to_candidates(spec, return_alternates))
                .collect()
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::StowageConfig;
    use stowage_placement::{StaticInventory, StaticTags};
    use stowage_state::{Aggregate, Flavor, GroupPolicy, HostState, InstanceGroup, RequestedDestination};

    fn flavor(memory_mb: u64) -> Flavor {
        Flavor {
            id: "f1".into(),
            name: "m1.small".into(),
            memory_mb,
            vcpus: 1,
            root_gb: 10,
            ..Default::default()
        }
    }

    fn host(name: &str, memory_mb: u64, cell: &str) -> HostState {
        let mut h = HostState::new(name, memory_mb, 16, 500).with_aggregate(Aggregate::new("vc-a-0", &[name]));
        h.cell = Some(cell.to_string());
        h
    }

    fn scheduler(hosts: Vec<HostState>, config: StowageConfig) -> Scheduler {
        let inventory = Arc::new(StaticInventory::new(hosts));
        let tags = Arc::new(StaticTags::new().with_tenant("p1", &["vc-a-0"]));
        let ctx = StageContext::from_services(config, inventory, tags);
        Scheduler::from_context(&ctx, &StageRegistry::default()).unwrap()
    }

    fn spread_config() -> StowageConfig {
        let mut config = StowageConfig::default();
        config.weighers.ram_multiplier = 1.0;
        config
    }

    fn hosts() -> Vec<HostState> {
        vec![
            host("h1", 8192, "cell1"),
            host("h2", 32768, "cell1"),
            host("h3", 16384, "cell1"),
            host("h4", 65536, "cell2"),
            host("h5", 1024, "cell1"),
        ]
    }

    #[test]
    fn primary_is_best_weighed_host() {
        let s = scheduler(hosts(), spread_config());
        let mut spec = RequestSpec::new("w1", "p1", flavor(2048));
        spec.requested_destination = Some(RequestedDestination {
            cell: Some("cell1".into()),
            ..Default::default()
        });
        let selection = s.schedule(&spec).unwrap();
        assert_eq!(selection.primary.host.host, "h2");
        let alternates: Vec<&str> = selection.alternates.iter().map(|w| w.host.host.as_str()).collect();
        assert_eq!(alternates, vec!["h3", "h1"]);
    }

    #[test]
    fn alternates_stay_in_primary_cell_and_are_capped() {
        let mut config = spread_config();
        config.scheduler.max_alternates = 1;
        let s = scheduler(hosts(), config);
        let selection = s.schedule(&RequestSpec::new("w1", "p1", flavor(2048))).unwrap();
        assert_eq!(selection.primary.host.host, "h4");
        assert!(selection.alternates.is_empty());

        let s = scheduler(hosts(), spread_config());
        let selection = s.schedule(&RequestSpec::new("w1", "p1", flavor(2048))).unwrap();
        assert!(selection.alternates.iter().all(|w| w.host.cell.as_deref() == Some("cell2")));
    }

    #[test]
    fn nothing_fits_is_no_valid_host() {
        let s = scheduler(hosts(), spread_config());
        let err = s.schedule(&RequestSpec::new("w1", "p1", flavor(1 << 20))).unwrap_err();
        assert!(matches!(err, SchedulerError::NoValidHost(_)));

        let s = scheduler(hosts(), spread_config());
        let err = s.schedule(&RequestSpec::new("w1", "unsharded", flavor(512))).unwrap_err();
        assert!(matches!(err, SchedulerError::NoValidHost(_)));
    }

    #[test]
    fn instances_consume_capacity_in_turn() {
        let s = scheduler(vec![host("h1", 4096, "cell1"), host("h2", 6144, "cell1")], spread_config());
        let mut spec = RequestSpec::new("w1", "p1", flavor(3072));
        spec.num_instances = 3;
        let selections = s.schedule_all(&spec).unwrap();
        let placed: Vec<&str> = selections.iter().map(|s| s.primary.host.host.as_str()).collect();
        assert_eq!(placed, vec!["h2", "h1", "h2"]);

        spec.num_instances = 4;
        assert!(matches!(s.schedule_all(&spec), Err(SchedulerError::NoValidHost(_))));
    }

    #[test]
    fn anti_affinity_spreads_within_one_request() {
        let mut config = spread_config();
        config.weighers.ram_multiplier = 0.0;
        let s = scheduler(hosts(), config);
        let group = InstanceGroup {
            id: "g1".into(),
            policy: GroupPolicy::AntiAffinity,
            members: ["w1", "w1-1", "w1-2"].iter().map(|m| m.to_string()).collect(),
            hosts: Default::default(),
        };
        let mut spec = RequestSpec::new("w1", "p1", flavor(512)).with_group(group);
        spec.num_instances = 3;
        let selections = s.schedule_all(&spec).unwrap();
        let mut placed: Vec<&str> = selections.iter().map(|s| s.primary.host.host.as_str()).collect();
        placed.sort();
        placed.dedup();
        assert_eq!(placed.len(), 3);
    }

    #[test]
    fn affinity_keeps_instances_together() {
        let pair = || vec![host("h1", 8192, "cell1"), host("h2", 8192, "cell1")];
        let mut spec = RequestSpec::new("w1", "p1", flavor(2048));
        spec.num_instances = 3;

        let s = scheduler(pair(), spread_config());
        let placed: Vec<String> = s.schedule_all(&spec).unwrap().into_iter().map(|s| s.primary.host.host).collect();
        assert_eq!(placed, vec!["h1", "h2", "h1"]);

        let group = InstanceGroup {
            id: "g1".into(),
            policy: GroupPolicy::Affinity,
            members: ["w1", "w1-1", "w1-2"].iter().map(|m| m.to_string()).collect(),
            hosts: Default::default(),
        };
        let spec = spec.with_group(group);
        let s = scheduler(pair(), spread_config());
        let placed: Vec<String> = s.schedule_all(&spec).unwrap().into_iter().map(|s| s.primary.host.host).collect();
        assert_eq!(placed, vec!["h1", "h1", "h1"]);
    }

    #[test]
    fn anti_affinity_runs_out_of_hosts() {
        let group = InstanceGroup {
            id: "g1".into(),
            policy: GroupPolicy::AntiAffinity,
            members: ["w1", "w1-1", "w1-2"].iter().map(|m| m.to_string()).collect(),
            hosts: Default::default(),
        };
        let mut spec = RequestSpec::new("w1", "p1", flavor(512)).with_group(group);
        spec.num_instances = 3;
        let s = scheduler(vec![host("h1", 8192, "cell1"), host("h2", 8192, "cell1")], spread_config());
        assert!(matches!(s.schedule_all(&spec), Err(SchedulerError::NoValidHost(_))));
    }

    #[test]
    fn instance_ids_follow_the_workload_id() {
        let mut spec = RequestSpec::new("w1", "p1", flavor(512));
        assert_eq!(Scheduler::instance_ids(&spec), vec!["w1"]);
        spec.num_instances = 3;
        assert_eq!(Scheduler::instance_ids(&spec), vec!["w1", "w1-1", "w1-2"]);
    }

    #[tokio::test]
    async fn destinations_carry_claimable_requests() {
        let mut inventory_hosts = hosts();
        inventory_hosts[1].provider_generation = 7;
        let s = scheduler(inventory_hosts, spread_config());
        let mut spec = RequestSpec::new("w1", "p1", flavor(2048));
        spec.requested_destination = Some(RequestedDestination {
            cell: Some("cell1".into()),
            ..Default::default()
        });

        let ids = vec!["w1".to_string()];
        let lists = s.select_destinations(&spec, &ids, true).await.unwrap();
        assert_eq!(lists.len(), 1);
        let primary = &lists[0][0];
        assert_eq!(primary.host, "h2");
        assert_eq!(primary.version, 7);
        let request: AllocationRequest =
            serde_json::from_str(primary.allocation_request.as_deref().unwrap()).unwrap();
        assert_eq!(request.allocations["h2"], spec.resources());
        assert_eq!(lists[0].len(), 3);

        let without = s.select_destinations(&spec, &ids, false).await.unwrap();
        assert_eq!(without[0].len(), 1);
    }

    #[test]
    fn unknown_stage_fails_construction() {
        let mut config = StowageConfig::default();
        config.scheduler.enabled_weighers.push("Bogus".into());
        let inventory = Arc::new(StaticInventory::new(vec![]));
        let ctx = StageContext::from_services(config, inventory, Arc::new(StaticTags::new()));
        assert!(matches!(
            Scheduler::from_context(&ctx, &StageRegistry::default()),
            Err(SchedulerError::Filter(_))
        ));
    }
}
