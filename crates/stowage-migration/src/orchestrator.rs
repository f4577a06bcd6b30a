//! Migration orchestrator — drives one relocation through its phases.
//!
//! ```text
//! Init → PreAllocated → Selecting → Claiming → Dispatched
//!            └────────────┴───────────┴──→ RolledBack { reason }
//! ```
//!
//! Pre-allocation moves the workload's source reservation onto the
//! migration record, so the source capacity stays protected while a
//! destination is claimed for the workload itself. Rollback reverses
//! that move and releases any destination claim.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_core::MigrationConfig;
use stowage_placement::InventoryService;
use stowage_scheduler::ledger::protocol;
use stowage_scheduler::{AllocationLedger, DestinationQuery};
use stowage_state::{
    AllocationCandidate, Flavor, Migration, MigrationStatus, MigrationStore, MigrationType, ProviderId,
    RequestSpec, RequestedDestination, Resources, StateStore, Workload, WorkloadId, WorkloadStore,
    epoch_secs,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::{ComputeDispatch, DispatchRequest};
use crate::error::{MigrationError, MigrationResult};
use crate::selector::{ClaimedDestination, DestinationSelector};

/// Current phase of a relocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Init,
    /// Migration record exists and holds the source reservation, if any.
    PreAllocated,
    /// Waiting on the destination query.
    Selecting,
    /// Walking candidates.
    Claiming,
    /// Accepted by the destination compute.
    Dispatched,
    RolledBack { reason: String },
}

/// Caller input for one relocation.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub workload_id: WorkloadId,
    pub spec: RequestSpec,
    /// Target flavor; differs from the current one for a resize.
    pub flavor: Flavor,
    /// Alternates left over from an earlier attempt. When set no new
    /// destination query is made.
    pub host_list: Option<Vec<AllocationCandidate>>,
}

impl MigrationRequest {
    pub fn new(workload_id: &str, spec: RequestSpec, flavor: Flavor) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            spec,
            flavor,
            host_list: None,
        }
    }

    pub fn with_host_list(mut self, host_list: Vec<AllocationCandidate>) -> Self {
        self.host_list = Some(host_list);
        self
    }
}

/// Source reservation moved onto the migration record.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldAllocation {
    pub provider: ProviderId,
    pub resources: Resources,
}

/// One relocation in progress.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub request: MigrationRequest,
    pub phase: MigrationPhase,
    pub workload: Option<Workload>,
    pub migration: Option<Migration>,
    pub held: Option<HeldAllocation>,
    pub destination: Option<ClaimedDestination>,
    /// Candidates still unused after a destination was chosen.
    pub alternates: Vec<AllocationCandidate>,
}

impl MigrationTask {
    pub fn new(request: MigrationRequest) -> Self {
        Self {
            request,
            phase: MigrationPhase::Init,
            workload: None,
            migration: None,
            held: None,
            destination: None,
            alternates: Vec::new(),
        }
    }

    fn workload(&self) -> MigrationResult<&Workload> {
        self.workload
            .as_ref()
            .ok_or_else(|| MigrationError::WorkloadNotFound(self.request.workload_id.clone()))
    }

    fn enter(&mut self, phase: MigrationPhase) {
        debug!(workload = %self.request.workload_id, from = ?self.phase, to = ?phase, "migration phase");
        self.phase = phase;
    }
}

/// Drives one relocation from pre-allocation to dispatch, rolling back on
/// any failure before the destination accepts the job.
pub struct MigrationOrchestrator {
    query: Arc<dyn DestinationQuery>,
    ledger: Arc<dyn AllocationLedger>,
    dispatch: Arc<dyn ComputeDispatch>,
    migrations: Arc<dyn MigrationStore>,
    workloads: Arc<dyn WorkloadStore>,
    selector: DestinationSelector,
    config: MigrationConfig,
}

impl MigrationOrchestrator {
    pub fn new(
        query: Arc<dyn DestinationQuery>,
        ledger: Arc<dyn AllocationLedger>,
        inventory: Arc<dyn InventoryService>,
        dispatch: Arc<dyn ComputeDispatch>,
        migrations: Arc<dyn MigrationStore>,
        workloads: Arc<dyn WorkloadStore>,
        config: MigrationConfig,
    ) -> Self {
        let selector = DestinationSelector::new(ledger.clone(), inventory, dispatch.clone(), config.clone());
        Self {
            query,
            ledger,
            dispatch,
            migrations,
            workloads,
            selector,
            config,
        }
    }

    /// Both stores served by one [`StateStore`].
    pub fn with_store(
        query: Arc<dyn DestinationQuery>,
        ledger: Arc<dyn AllocationLedger>,
        inventory: Arc<dyn InventoryService>,
        dispatch: Arc<dyn ComputeDispatch>,
        store: Arc<StateStore>,
        config: MigrationConfig,
    ) -> Self {
        Self::new(query, ledger, inventory, dispatch, store.clone(), store, config)
    }

    /// Run a relocation to dispatch acceptance, rolling back on failure.
    pub async fn migrate(&self, request: MigrationRequest) -> MigrationResult<MigrationTask> {
        let mut task = MigrationTask::new(request);
        match self.execute(&mut task).await {
            Ok(()) => Ok(task),
            Err(e) => {
                warn!(workload = %task.request.workload_id, phase = ?task.phase, error = %e, "migration failed, rolling back");
                self.rollback(&mut task, &e).await;
                Err(e)
            }
        }
    }

    /// Drive `task` from its current phase to `Dispatched`.
    pub async fn execute(&self, task: &mut MigrationTask) -> MigrationResult<()> {
        if task.phase == MigrationPhase::Init {
            self.pre_allocate(task).await?;
        }
        if task.phase != MigrationPhase::PreAllocated {
            return Err(MigrationError::Configuration(format!(
                "cannot execute migration in phase {:?}",
                task.phase
            )));
        }

        let spec = self.constrain_spec(task)?;
        task.enter(MigrationPhase::Selecting);
        let candidates = match task.request.host_list.take() {
            Some(host_list) => {
                debug!(workload = %task.request.workload_id, alternates = host_list.len(), "reusing alternates");
                host_list
            }
            None => self.query_destinations(&spec, &task.request.workload_id).await?,
        };

        task.enter(MigrationPhase::Claiming);
        let selected = self.selector.select(task.workload()?, &spec, candidates).await?;
        task.destination = Some(selected.destination);
        task.alternates = selected.remaining;

        self.dispatch_to_destination(task).await?;
        task.enter(MigrationPhase::Dispatched);
        Ok(())
    }

    /// Create or adopt the migration record and move the source
    /// reservation onto it. `Init → PreAllocated`.
    pub async fn pre_allocate(&self, task: &mut MigrationTask) -> MigrationResult<()> {
        let workload = self
            .workloads
            .load_workload(&task.request.workload_id)?
            .ok_or_else(|| MigrationError::WorkloadNotFound(task.request.workload_id.clone()))?;

        let migration_type = if workload.flavor.id != task.request.flavor.id {
            MigrationType::Resize
        } else {
            MigrationType::Migration
        };
        let now = epoch_secs();
        let candidate = Migration {
            id: Uuid::new_v4().to_string(),
            workload_id: workload.id.clone(),
            migration_type,
            status: MigrationStatus::PreMigrating,
            source_host: workload.host.clone(),
            source_node: workload.node.clone(),
            dest_host: None,
            dest_node: None,
            old_flavor_id: workload.flavor.id.clone(),
            new_flavor_id: task.request.flavor.id.clone(),
            created_at: now,
            updated_at: now,
        };
        let (migration, created) = self.migrations.create_or_adopt_pre_migrating(&candidate)?;
        info!(
            workload = %workload.id,
            migration = %migration.id,
            kind = %migration_type,
            created,
            "migration record ready"
        );
        task.migration = Some(migration.clone());
        task.workload = Some(workload.clone());

        let provider = workload.provider_id.as_str();
        let timeout = self.config.claim_timeout();
        let ledger = self.ledger.as_ref();
        if let Some(held) = with_ledger_timeout(timeout, ledger.get_allocations_for_consumer(provider, &workload.id)).await? {
            if !protocol::transfer(ledger, provider, &workload.id, &migration.id, &held, timeout).await? {
                return Err(MigrationError::AllocationConflict(format!(
                    "could not move allocation of {} on {provider} to migration {}",
                    workload.id, migration.id
                )));
            }
            task.held = Some(HeldAllocation {
                provider: provider.to_string(),
                resources: held,
            });
        } else if let Some(held) =
            with_ledger_timeout(timeout, ledger.get_allocations_for_consumer(provider, &migration.id)).await?
        {
            debug!(migration = %migration.id, "adopted record already holds the source allocation");
            task.held = Some(HeldAllocation {
                provider: provider.to_string(),
                resources: held,
            });
        } else {
            info!(workload = %workload.id, %provider, "no source allocation, continuing without one");
        }

        task.enter(MigrationPhase::PreAllocated);
        Ok(())
    }

    /// Undo everything a failed attempt left behind. Repeated calls and
    /// calls without a held allocation change nothing.
    pub async fn rollback(&self, task: &mut MigrationTask, cause: &MigrationError) {
        match task.phase {
            MigrationPhase::RolledBack { .. } => {
                debug!(workload = %task.request.workload_id, "already rolled back");
                return;
            }
            MigrationPhase::Dispatched => {
                warn!(workload = %task.request.workload_id, "dispatched migrations are not rolled back here");
                return;
            }
            _ => {}
        }
        let timeout = self.config.claim_timeout();
        let workload_id = task.request.workload_id.clone();

        if let Some(dest) = task.destination.take().filter(|d| d.claimed) {
            if let Err(e) =
                protocol::release_all(self.ledger.as_ref(), &workload_id, &dest.candidate.provider_id, timeout).await
            {
                error!(workload = %workload_id, host = %dest.candidate.host, error = %e, "failed to release destination claim");
            }
        }

        if let Some(migration) = task.migration.as_mut() {
            migration.status = if cause.is_exhaustion() {
                MigrationStatus::Failed
            } else {
                MigrationStatus::Error
            };
            migration.updated_at = epoch_secs();
            if let Err(e) = self.migrations.save_migration(migration) {
                error!(migration = %migration.id, error = %e, "failed to mark migration record");
            }
        }

        if let (Some(held), Some(migration)) = (task.held.take(), task.migration.as_ref()) {
            match protocol::transfer(
                self.ledger.as_ref(),
                &held.provider,
                &migration.id,
                &workload_id,
                &held.resources,
                timeout,
            )
            .await
            {
                Ok(true) => info!(workload = %workload_id, provider = %held.provider, "source allocation restored"),
                Ok(false) => error!(workload = %workload_id, provider = %held.provider, "source allocation changed, not restored"),
                Err(e) => error!(workload = %workload_id, provider = %held.provider, error = %e, "failed to restore source allocation"),
            }
        }

        task.enter(MigrationPhase::RolledBack {
            reason: cause.to_string(),
        });
    }

    /// Request used for destination queries: no forced hosts, limited to
    /// the workload's cell, no retries towards an explicitly named host.
    fn constrain_spec(&self, task: &mut MigrationTask) -> MigrationResult<RequestSpec> {
        let cell = task.workload()?.cell.clone();
        let spec = &mut task.request.spec;
        spec.reset_forced_destinations();
        spec.flavor = task.request.flavor.clone();
        let destination = spec.requested_destination.get_or_insert_with(RequestedDestination::default);
        debug!(workload = %task.request.workload_id, cell = ?cell, "requesting cell while migrating");
        destination.cell = cell;
        if destination.host.is_some() {
            spec.retry = None;
        }
        Ok(spec.clone())
    }

    async fn query_destinations(
        &self,
        spec: &RequestSpec,
        workload_id: &WorkloadId,
    ) -> MigrationResult<Vec<AllocationCandidate>> {
        let timeout = self.config.query_timeout();
        let ids = std::slice::from_ref(workload_id);
        let lists = tokio::time::timeout(timeout, self.query.select_destinations(spec, ids, true))
            .await
            .map_err(|_| MigrationError::SchedulerUnavailable(format!("destination query timed out after {timeout:?}")))??;
        let candidates = lists.into_iter().next().unwrap_or_default();
        if candidates.is_empty() {
            return Err(MigrationError::NoValidHost(format!("no destinations for workload {workload_id}")));
        }
        info!(workload = %workload_id, candidates = candidates.len(), "destinations received");
        Ok(candidates)
    }

    async fn dispatch_to_destination(&self, task: &mut MigrationTask) -> MigrationResult<()> {
        let workload = task.workload()?.clone();
        let Some(dest) = task.destination.as_ref() else {
            return Err(MigrationError::NoValidHost(task.request.workload_id.clone()));
        };
        let Some(migration) = task.migration.as_mut() else {
            return Err(MigrationError::Configuration("dispatch without migration record".to_string()));
        };
        migration.dest_host = Some(dest.candidate.host.clone());
        migration.dest_node = Some(dest.candidate.nodename.clone());
        migration.updated_at = epoch_secs();
        self.migrations.save_migration(migration)?;

        let request = DispatchRequest {
            host: dest.candidate.host.clone(),
            nodename: dest.candidate.nodename.clone(),
            workload,
            migration: migration.clone(),
            flavor: task.request.flavor.clone(),
            alternates: task.alternates.clone(),
        };
        let timeout = self.config.dispatch_timeout();
        tokio::time::timeout(timeout, self.dispatch.dispatch(&request))
            .await
            .map_err(|_| MigrationError::Remote(format!("dispatch to {} timed out after {timeout:?}", request.host)))??;
        info!(
            workload = %request.workload.id,
            migration = %request.migration.id,
            host = %request.host,
            alternates = request.alternates.len(),
            "migration dispatched"
        );
        Ok(())
    }
}

async fn with_ledger_timeout<T>(
    timeout: Duration,
    call: stowage_scheduler::LedgerFuture<'_, T>,
) -> MigrationResult<T> {
    let result = tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| MigrationError::Remote(format!("ledger call timed out after {timeout:?}")))?;
    Ok(result?)
}
