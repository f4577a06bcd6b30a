//! DestinationSelector — claim-and-verify over a ranked candidate list.
//!
//! Candidates are consulted in order. Each one goes through local
//! pre-checks, a ledger claim for the workload consumer and a readiness
//! check on the destination. A rejection at any step discards the
//! candidate (releasing a claim it already holds) and moves on. Only
//! ledger faults abort the walk.

use std::collections::VecDeque;
use std::sync::Arc;

use stowage_core::MigrationConfig;
use stowage_placement::{HostQuery, InventoryService};
use stowage_scheduler::AllocationLedger;
use stowage_scheduler::ledger::protocol::{self, ClaimOutcome};
use stowage_state::{AllocationCandidate, HostState, RequestSpec, Workload};
use tracing::{debug, info, warn};

use crate::dispatch::ComputeDispatch;
use crate::error::{MigrationError, MigrationResult};

/// A destination that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedDestination {
    pub candidate: AllocationCandidate,
    /// False when the candidate carried no allocation request.
    pub claimed: bool,
}

/// Outcome of a successful walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    pub destination: ClaimedDestination,
    /// Candidates not consulted, in their original order.
    pub remaining: Vec<AllocationCandidate>,
}

/// Claim-and-verify walk over ranked candidates, bounded by the retry budget.
pub struct DestinationSelector {
    ledger: Arc<dyn AllocationLedger>,
    inventory: Arc<dyn InventoryService>,
    dispatch: Arc<dyn ComputeDispatch>,
    config: MigrationConfig,
}

impl DestinationSelector {
    pub fn new(
        ledger: Arc<dyn AllocationLedger>,
        inventory: Arc<dyn InventoryService>,
        dispatch: Arc<dyn ComputeDispatch>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            ledger,
            inventory,
            dispatch,
            config,
        }
    }

    /// Walk `candidates` until one is claimed and ready.
    ///
    /// Fails with `MaxRetriesExceeded` once the retry budget or the list
    /// runs out.
    pub async fn select(
        &self,
        workload: &Workload,
        spec: &RequestSpec,
        candidates: Vec<AllocationCandidate>,
    ) -> MigrationResult<Selected> {
        let source = self.host_state(&workload.host)?;
        if source.is_none() {
            warn!(host = %workload.host, "source host not in inventory, hypervisor checks skipped");
        }

        let budget = self.config.candidate_budget();
        let mut queue: VecDeque<AllocationCandidate> = candidates.into();
        let mut consulted = 0usize;

        while let Some(candidate) = queue.pop_front() {
            if budget.is_some_and(|max| consulted >= max) {
                queue.push_front(candidate);
                break;
            }
            consulted += 1;

            if let Err(reason) = self.precheck(workload, spec, source.as_ref(), &candidate) {
                info!(workload = %workload.id, host = %candidate.host, %reason, "pre-check failed, skipping candidate");
                continue;
            }

            let claimed = match protocol::claim(
                self.ledger.as_ref(),
                &workload.id,
                &candidate,
                self.config.claim_timeout(),
            )
            .await?
            {
                ClaimOutcome::Conflict => continue,
                outcome => outcome == ClaimOutcome::Claimed,
            };

            if let Err(reason) = self.check_ready(workload, &candidate).await {
                info!(workload = %workload.id, host = %candidate.host, %reason, "destination not ready, skipping candidate");
                if claimed {
                    self.release(workload, &candidate).await;
                }
                continue;
            }

            info!(workload = %workload.id, host = %candidate.host, consulted, "destination claimed");
            return Ok(Selected {
                destination: ClaimedDestination { candidate, claimed },
                remaining: queue.into(),
            });
        }

        warn!(workload = %workload.id, consulted, left = queue.len(), "no candidate could be claimed");
        Err(MigrationError::MaxRetriesExceeded(format!(
            "exhausted {consulted} candidate hosts for workload {}",
            workload.id
        )))
    }

    fn host_state(&self, host: &str) -> MigrationResult<Option<HostState>> {
        let query = HostQuery {
            cell: None,
            hosts: Some(vec![host.to_string()]),
        };
        let mut states = self
            .inventory
            .get_host_states(&query)
            .map_err(|e| MigrationError::Remote(e.to_string()))?;
        Ok(states.pop())
    }

    fn precheck(
        &self,
        workload: &Workload,
        spec: &RequestSpec,
        source: Option<&HostState>,
        candidate: &AllocationCandidate,
    ) -> Result<(), String> {
        if candidate.host == workload.host {
            return Err("destination is the source host".to_string());
        }
        let dest = self
            .host_state(&candidate.host)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "destination not in inventory".to_string())?;

        if let Some(source) = source {
            if source.hypervisor_type != dest.hypervisor_type {
                return Err(format!(
                    "hypervisor type {} differs from source {}",
                    dest.hypervisor_type, source.hypervisor_type
                ));
            }
            if source.hypervisor_version > dest.hypervisor_version {
                return Err(format!(
                    "hypervisor version {} older than source {}",
                    dest.hypervisor_version, source.hypervisor_version
                ));
            }
        }

        let requested = spec.flavor.memory_mb as f64;
        let headroom = dest.total_memory_mb as f64 * dest.ram_allocation_ratio - dest.used_memory_mb() as f64;
        if requested == 0.0 || headroom <= requested {
            return Err(format!("memory headroom {headroom:.0} MB <= requested {requested:.0} MB"));
        }
        debug!(host = %candidate.host, headroom, "pre-checks passed");
        Ok(())
    }

    async fn check_ready(&self, workload: &Workload, candidate: &AllocationCandidate) -> Result<(), String> {
        let timeout = self.config.precheck_timeout();
        match tokio::time::timeout(timeout, self.dispatch.check_destination(&candidate.host, workload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("readiness check timed out after {timeout:?}")),
        }
    }

    async fn release(&self, workload: &Workload, candidate: &AllocationCandidate) {
        if let Err(e) = protocol::release_all(
            self.ledger.as_ref(),
            &workload.id,
            &candidate.provider_id,
            self.config.claim_timeout(),
        )
        .await
        {
            warn!(workload = %workload.id, host = %candidate.host, error = %e, "failed to release claim");
        }
    }
}
