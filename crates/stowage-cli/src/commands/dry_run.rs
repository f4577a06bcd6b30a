use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stowage_core::StowageConfig;
use stowage_placement::{StageContext, StageRegistry, StaticInventory, StaticTags, WeighedHost};
use stowage_scheduler::ledger::protocol;
use stowage_scheduler::{ClaimOutcome, InMemoryLedger, Scheduler};
use stowage_state::{HostState, RequestSpec, Resources};
use tracing::info;

/// Consumer holding the usage a host already reports.
const IN_USE_CONSUMER: &str = "in-use";

/// Host inventory as read from disk.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InventoryFile {
    Hosts(Vec<HostState>),
    Full {
        hosts: Vec<HostState>,
        #[serde(default)]
        tenant_tags: BTreeMap<String, Vec<String>>,
    },
}

impl InventoryFile {
    fn into_parts(self) -> (Vec<HostState>, BTreeMap<String, Vec<String>>) {
        match self {
            Self::Hosts(hosts) => (hosts, BTreeMap::new()),
            Self::Full { hosts, tenant_tags } => (hosts, tenant_tags),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedHost {
    pub host: String,
    pub nodename: String,
    pub cell: Option<String>,
    pub weight: f64,
}

impl From<&WeighedHost> for RankedHost {
    fn from(weighed: &WeighedHost) -> Self {
        Self {
            host: weighed.host.host.clone(),
            nodename: weighed.host.nodename.clone(),
            cell: weighed.host.cell.clone(),
            weight: weighed.weight,
        }
    }
}

/// Outcome for one instance of the request.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub workload_id: String,
    pub primary: RankedHost,
    pub alternates: Vec<RankedHost>,
    /// Whether the ledger accepted the primary's allocation request.
    pub claimed: bool,
}

pub async fn dry_run(config: Option<&str>, hosts: &str, request: &str) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => StowageConfig::from_file(Path::new(path))?,
        None => StowageConfig::default(),
    };
    let inventory: InventoryFile = serde_json::from_str(&std::fs::read_to_string(hosts)?)?;
    let spec: RequestSpec = serde_json::from_str(&std::fs::read_to_string(request)?)?;

    match plan(config, inventory, &spec).await {
        Ok(placements) => {
            println!("{}", serde_json::to_string_pretty(&placements)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Dry run failed: {e}");
            Err(e)
        }
    }
}

async fn plan(
    config: StowageConfig,
    inventory: InventoryFile,
    spec: &RequestSpec,
) -> anyhow::Result<Vec<Placement>> {
    let (mut hosts, tenant_tags) = inventory.into_parts();
    info!(hosts = hosts.len(), workload = %spec.workload_id, instances = spec.num_instances, "dry run");
    let ledger = seed_ledger(&mut hosts);

    let tags = StaticTags::new();
    for (tenant, values) in &tenant_tags {
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        tags.set(tenant, &values);
    }

    let claim_timeout = config.migration.claim_timeout();
    let ctx = StageContext::from_services(config, Arc::new(StaticInventory::new(hosts)), Arc::new(tags));
    let scheduler = Scheduler::from_context(&ctx, &StageRegistry::default())?;
    let selections = scheduler.schedule_all(spec)?;

    let mut placements = Vec::with_capacity(selections.len());
    for (workload_id, selection) in Scheduler::instance_ids(spec).into_iter().zip(&selections) {
        let mut candidates = selection.to_candidates(spec, false)?;
        let mut primary = candidates.remove(0);
        // Earlier claims in this run advance the generation.
        if let Some(generation) = ledger.generation(&primary.provider_id) {
            primary.version = generation;
        }
        let outcome = protocol::claim(&ledger, &workload_id, &primary, claim_timeout).await?;
        placements.push(Placement {
            workload_id,
            primary: RankedHost::from(&selection.primary),
            alternates: selection.alternates.iter().map(RankedHost::from).collect(),
            claimed: outcome == ClaimOutcome::Claimed,
        });
    }
    Ok(placements)
}

/// One provider per host, sized by the allocation ratios, with current
/// usage pre-booked. Host generations are synced to the ledger's.
fn seed_ledger(hosts: &mut [HostState]) -> InMemoryLedger {
    let ledger = InMemoryLedger::new();
    for host in hosts.iter_mut() {
        let capacity = Resources::new(
            (host.total_memory_mb as f64 * host.ram_allocation_ratio) as u64,
            (host.total_vcpus as f64 * host.cpu_allocation_ratio) as u32,
            (host.total_disk_gb as f64 * host.disk_allocation_ratio) as u64,
        );
        ledger.add_provider(&host.provider_id, capacity);
        let in_use = Resources::new(
            host.used_memory_mb().max(0) as u64,
            host.used_vcpus,
            (host.total_disk_gb as i64 - host.free_disk_gb).max(0) as u64,
        );
        if !in_use.is_empty() {
            ledger.seed_allocation(&host.provider_id, IN_USE_CONSUMER, in_use);
        }
        host.provider_generation = ledger.generation(&host.provider_id).unwrap_or_default();
    }
    ledger
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use stowage_state::Flavor;

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

    fn config() -> StowageConfig {
        StowageConfig::from_toml_str(
            "[scheduler]\nenabled_filters = [\"ResourceFitFilter\"]\nenabled_weighers = [\"FreeRamWeigher\"]\nmax_alternates = 2\n\n[weighers]\nram_multiplier = 1.0\n",
        )
        .unwrap()
    }

    fn hosts() -> Vec<HostState> {
        let mut busy = HostState::new("h1", 8192, 8, 100);
        busy.free_memory_mb = 2048;
        vec![busy, HostState::new("h2", 8192, 8, 100), HostState::new("h3", 1024, 8, 100)]
    }

    #[test]
    fn test_inventory_accepts_bare_array_and_object() {
        let bare = serde_json::to_string(&hosts()).unwrap();
        let (parsed, tags) = serde_json::from_str::<InventoryFile>(&bare).unwrap().into_parts();
        assert_eq!(parsed.len(), 3);
        assert!(tags.is_empty());

        let full = serde_json::json!({
            "hosts": hosts(),
            "tenant_tags": { "p1": ["shard-1"] },
        });
        let (parsed, tags) = serde_json::from_value::<InventoryFile>(full).unwrap().into_parts();
        assert_eq!(parsed.len(), 3);
        assert_eq!(tags["p1"], vec!["shard-1"]);
    }

    #[test]
    fn test_seed_ledger_books_existing_usage() {
        let mut hosts = hosts();
        let ledger = seed_ledger(&mut hosts);

        assert_eq!(ledger.used("h1").memory_mb, 6144);
        assert_eq!(hosts[0].provider_generation, 1);
        assert!(ledger.used("h2").is_empty());
        assert_eq!(hosts[1].provider_generation, 0);
    }

    #[tokio::test]
    async fn test_plan_ranks_and_claims() {
        let spec = RequestSpec::new("w1", "p1", flavor(2048));
        let placements = plan(config(), InventoryFile::Hosts(hosts()), &spec).await.unwrap();

        assert_eq!(placements.len(), 1);
        let placement = &placements[0];
        assert_eq!(placement.workload_id, "w1");
        assert_eq!(placement.primary.host, "h2");
        assert_eq!(placement.alternates.len(), 1);
        assert_eq!(placement.alternates[0].host, "h1");
        assert!(placement.claimed);
    }

    #[tokio::test]
    async fn test_plan_claims_every_instance() {
        let mut spec = RequestSpec::new("w1", "p1", flavor(2048));
        spec.num_instances = 2;
        let placements = plan(config(), InventoryFile::Hosts(hosts()), &spec).await.unwrap();

        let ids: Vec<&str> = placements.iter().map(|p| p.workload_id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "w1-1"]);
        assert!(placements.iter().all(|p| p.claimed));
    }

    #[tokio::test]
    async fn test_plan_no_valid_host() {
        let spec = RequestSpec::new("w1", "p1", flavor(65536));
        let err = plan(config(), InventoryFile::Hosts(hosts()), &spec).await.unwrap_err();
        assert!(err.to_string().contains("no valid host"));
    }

    #[tokio::test]
    async fn test_dry_run_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts.json");
        let request_path = dir.path().join("request.json");
        let config_path = dir.path().join("stowage.toml");
        fs::write(&config_path, config().to_toml_string().unwrap()).unwrap();
        fs::write(&hosts_path, serde_json::to_string(&hosts()).unwrap()).unwrap();
        let spec = RequestSpec::new("w1", "p1", flavor(512));
        fs::write(&request_path, serde_json::to_string(&spec).unwrap()).unwrap();

        dry_run(
            config_path.to_str(),
            hosts_path.to_str().unwrap(),
            request_path.to_str().unwrap(),
        )
        .await
        .unwrap();
    }
}
