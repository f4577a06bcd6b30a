//! Admission stages and the pipeline that runs them.
//!
//! A stage is either per-host ([`HostFilter::host_passes`]) or batch
//! ([`BatchFilter::filter_all`]). Per-host stages are independent of each
//! other; batch stages see the whole surviving set and their position in
//! the pipeline matters.

pub mod affinity;
pub mod availability_zone;
pub mod baremetal;
pub mod bigvm;
pub mod cpu_info;
pub mod destination;
pub mod resources;
pub mod shard;

use std::collections::{BTreeSet, HashMap};

use stowage_core::{FilterConfig, Severity, SeverityMatrix};
use stowage_state::{HostId, HostState, RequestSpec};
use tracing::{debug, error, info, trace, warn};

use crate::error::FilterResult;

/// Outcome of a per-host admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
}

impl Verdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Verdict::Rejected(reason.into())
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Independent per-host predicate.
pub trait HostFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err` aborts the request; expected rejections are `Ok(Rejected)`.
    fn host_passes(&self, host: &HostState, spec: &RequestSpec) -> FilterResult<Verdict>;

    fn run_on_rebuild(&self) -> bool {
        true
    }

    fn run_once_per_request(&self) -> bool {
        false
    }
}

/// Stage needing cross-host context.
pub trait BatchFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter_all(&self, hosts: Vec<HostState>, spec: &RequestSpec) -> FilterResult<Vec<HostState>>;

    fn run_on_rebuild(&self) -> bool {
        true
    }

    fn run_once_per_request(&self) -> bool {
        false
    }
}

/// One pipeline stage.
pub enum FilterStage {
    PerHost(Box<dyn HostFilter>),
    Batch(Box<dyn BatchFilter>),
}

impl FilterStage {
    pub fn name(&self) -> &'static str {
        match self {
            FilterStage::PerHost(f) => f.name(),
            FilterStage::Batch(f) => f.name(),
        }
    }

    fn run_on_rebuild(&self) -> bool {
        match self {
            FilterStage::PerHost(f) => f.run_on_rebuild(),
            FilterStage::Batch(f) => f.run_on_rebuild(),
        }
    }

    fn run_once_per_request(&self) -> bool {
        match self {
            FilterStage::PerHost(f) => f.run_once_per_request(),
            FilterStage::Batch(f) => f.run_once_per_request(),
        }
    }

    fn apply(&self, hosts: Vec<HostState>, spec: &RequestSpec) -> FilterResult<Vec<HostState>> {
        match self {
            FilterStage::PerHost(f) => {
                let mut kept = Vec::with_capacity(hosts.len());
                for host in hosts {
                    match f.host_passes(&host, spec)? {
                        Verdict::Accepted => kept.push(host),
                        Verdict::Rejected(reason) => {
                            debug!(stage = f.name(), host = %host.host, %reason, "host rejected");
                        }
                    }
                }
                Ok(kept)
            }
            FilterStage::Batch(f) => f.filter_all(hosts, spec),
        }
    }
}

/// State of one scheduling attempt, shared by every instance of a
/// multi-instance request.
#[derive(Debug, Default)]
pub struct FilterRun {
    /// Accepted hosts of each compute-once stage.
    memo: HashMap<&'static str, BTreeSet<HostId>>,
}

impl FilterRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_memoized(&self, stage: &str) -> bool {
        self.memo.contains_key(stage)
    }
}

/// Ordered admission stages.
#[derive(Default)]
pub struct FilterPipeline {
    stages: Vec<FilterStage>,
}

impl FilterPipeline {
    pub fn new(stages: Vec<FilterStage>) -> Self {
        Self { stages }
    }

    pub fn with_stage(mut self, stage: FilterStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(FilterStage::name).collect()
    }

    /// Run every stage once over `hosts`.
    pub fn filter(&self, hosts: Vec<HostState>, spec: &RequestSpec) -> FilterResult<Vec<HostState>> {
        let mut run = FilterRun::new();
        self.filter_with(&mut run, hosts, spec)
    }

    /// Run the pipeline as part of a longer attempt. Compute-once stages
    /// evaluated earlier in `run` are replaced by their recorded outcome.
    pub fn filter_with(
        &self,
        run: &mut FilterRun,
        mut hosts: Vec<HostState>,
        spec: &RequestSpec,
    ) -> FilterResult<Vec<HostState>> {
        let rebuild = spec.is_rebuild();
        for stage in &self.stages {
            let name = stage.name();
            if rebuild && !stage.run_on_rebuild() {
                trace!(stage = name, "stage skipped on rebuild");
                continue;
            }
            let before = hosts.len();
            let once = stage.run_once_per_request();

            hosts = match run.memo.get(name).filter(|_| once) {
                Some(accepted) => {
                    hosts.retain(|h| accepted.contains(&h.host));
                    hosts
                }
                None => {
                    let kept = stage.apply(hosts, spec)?;
                    if once {
                        run.memo
                            .insert(name, kept.iter().map(|h| h.host.clone()).collect());
                    }
                    kept
                }
            };

            debug!(stage = name, before, after = hosts.len(), "filter stage done");
            if hosts.is_empty() {
                info!(stage = name, workload = %spec.workload_id, "no hosts left after filter stage");
                break;
            }
        }
        Ok(hosts)
    }
}

// ── Missing-metadata reporting ─────────────────────────────────────

/// Logs soft rejections caused by missing or invalid host metadata at a
/// severity chosen by host kind.
#[derive(Debug, Clone)]
pub struct MetadataReporter {
    filters: FilterConfig,
    matrix: SeverityMatrix,
}

impl MetadataReporter {
    pub fn new(filters: FilterConfig, matrix: SeverityMatrix) -> Self {
        Self { filters, matrix }
    }

    pub fn severity_for(&self, host: &HostState) -> Severity {
        self.matrix
            .for_host(self.filters.is_baremetal(&host.hypervisor_type))
    }

    /// Log and build the rejection.
    pub fn reject(&self, stage: &'static str, host: &HostState, reason: String) -> Verdict {
        log_at(self.severity_for(host), stage, &host.host, &reason);
        Verdict::Rejected(reason)
    }
}

impl Default for MetadataReporter {
    fn default() -> Self {
        Self::new(FilterConfig::default(), SeverityMatrix::default())
    }
}

pub(crate) fn log_at(severity: Severity, stage: &'static str, host: &str, reason: &str) {
    match severity {
        Severity::Trace => trace!(stage, %host, %reason, "host metadata unusable"),
        Severity::Debug => debug!(stage, %host, %reason, "host metadata unusable"),
        Severity::Info => info!(stage, %host, %reason, "host metadata unusable"),
        Severity::Warn => warn!(stage, %host, %reason, "host metadata unusable"),
        Severity::Error => error!(stage, %host, %reason, "host metadata unusable"),
    }
}
