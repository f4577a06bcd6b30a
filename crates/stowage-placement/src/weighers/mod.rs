//! Host ranking.
//!
//! Each weigher produces a raw score per host. The pipeline normalizes
//! every weigher's raw scores to `[0, 1]` over the candidate set, scales
//! them by the weigher's multiplier and sums the results. Hosts are then
//! sorted by total weight, highest first; ties keep their input order.

pub mod affinity;
pub mod ram;
pub mod shard;

use stowage_state::{HostState, RequestSpec};
use tracing::trace;

/// Ranking stage.
pub trait HostWeigher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Factor applied to the normalized score. Negative values invert the
    /// preference; zero disables the weigher.
    fn multiplier(&self) -> f64;

    fn raw_weight(&self, host: &HostState, spec: &RequestSpec) -> f64;

    /// Raw scores for the whole candidate set, in input order.
    fn weigh_all(&self, hosts: &[HostState], spec: &RequestSpec) -> Vec<f64> {
        hosts.iter().map(|h| self.raw_weight(h, spec)).collect()
    }
}

/// A candidate and its combined weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeighedHost {
    pub host: HostState,
    pub weight: f64,
}

/// Min-max normalization. An all-equal set maps to zeros.
pub fn normalize(raw: &[f64]) -> Vec<f64> {
    let Some(min) = raw.iter().copied().reduce(f64::min) else {
        return Vec::new();
    };
    let max = raw.iter().copied().fold(min, f64::max);
    let range = max - min;
    if range == 0.0 {
        return vec![0.0; raw.len()];
    }
    raw.iter().map(|v| (v - min) / range).collect()
}

/// Ordered set of weighers.
#[derive(Default)]
pub struct WeigherPipeline {
    weighers: Vec<Box<dyn HostWeigher>>,
}

impl WeigherPipeline {
    pub fn new(weighers: Vec<Box<dyn HostWeigher>>) -> Self {
        Self { weighers }
    }

    pub fn with_weigher(mut self, weigher: Box<dyn HostWeigher>) -> Self {
        self.weighers.push(weigher);
        self
    }

    pub fn weigher_names(&self) -> Vec<&'static str> {
        self.weighers.iter().map(|w| w.name()).collect()
    }

    /// Score and rank `hosts`, best first.
    pub fn weigh(&self, hosts: Vec<HostState>, spec: &RequestSpec) -> Vec<WeighedHost> {
        let mut totals = vec![0.0; hosts.len()];
        for weigher in &self.weighers {
            let multiplier = weigher.multiplier();
            if multiplier == 0.0 {
                continue;
            }
            let normalized = normalize(&weigher.weigh_all(&hosts, spec));
            for ((total, score), host) in totals.iter_mut().zip(normalized).zip(&hosts) {
                *total += score * multiplier;
                trace!(weigher = weigher.name(), host = %host.host, score, multiplier, "weighed");
            }
        }

        let mut weighed: Vec<WeighedHost> = hosts
            .into_iter()
            .zip(totals)
            .map(|(host, weight)| WeighedHost { host, weight })
            .collect();
        weighed.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        weighed
    }
}
