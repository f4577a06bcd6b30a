use stowage_state::{HostState, RequestSpec};

use super::HostWeigher;

/// Spreads load by preferring hosts with more free memory. A negative
/// multiplier stacks instead.
pub struct FreeRamWeigher {
    multiplier: f64,
}

impl FreeRamWeigher {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }
}

impl HostWeigher for FreeRamWeigher {
    fn name(&self) -> &'static str {
        "FreeRamWeigher"
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn raw_weight(&self, host: &HostState, _spec: &RequestSpec) -> f64 {
        host.free_memory_mb as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::{host, spec};
    use crate::weighers::test_support::rank;

    fn hosts() -> Vec<HostState> {
        [("h1", 2048), ("h2", 8192), ("h3", -512)]
            .into_iter()
            .map(|(name, free)| {
                let mut h = host(name);
                h.free_memory_mb = free;
                h
            })
            .collect()
    }

    #[test]
    fn spreads_by_default_sign() {
        let ranked = rank(FreeRamWeigher::new(1.0), hosts(), &spec(512));
        assert_eq!(ranked[0], ("h2".to_string(), 1.0));
        assert_eq!(ranked[2], ("h3".to_string(), 0.0));
    }

    #[test]
    fn stacks_with_negative_multiplier() {
        let ranked = rank(FreeRamWeigher::new(-1.0), hosts(), &spec(512));
        assert_eq!(ranked[0].0, "h3");
        assert_eq!(ranked[2], ("h2".to_string(), -1.0));
    }
}
