//! Named mutual-exclusion regions.
//!
//! Each name maps to its own async mutex. Entries nobody holds or waits for
//! are pruned on the next acquisition, so the map only grows with the
//! number of names in use at the same time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// Held region; released on drop.
#[derive(Debug)]
pub struct NamedGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named async mutual-exclusion regions. Clones share the same regions.
#[derive(Debug, Clone, Default)]
pub struct NamedLocks {
    regions: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `name`.
    pub async fn lock(&self, name: &str) -> NamedGuard {
        let region = {
            let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
            regions.retain(|_, region| Arc::strong_count(region) > 1);
            regions.entry(name.to_string()).or_default().clone()
        };
        let guard = region.lock_owned().await;
        trace!(%name, "named lock acquired");
        NamedGuard {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Names currently held or awaited.
    pub fn active(&self) -> usize {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|region| Arc::strong_count(region) > 1)
            .count()
    }
}
