//! In-process allocation ledger.
//!
//! Each provider carries a capacity, a generation and the reservations held
//! against it. Every successful write bumps the generation, which is the
//! version token handed out with allocation candidates. Used for dry runs
//! and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use stowage_state::{AllocationRequest, ConsumerId, ProviderId, Resources};
use tracing::debug;

use super::{AllocationLedger, LedgerFuture};
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Default)]
struct ProviderRecord {
    capacity: Resources,
    generation: u64,
    allocations: BTreeMap<ConsumerId, Resources>,
}

impl ProviderRecord {
    fn used_excluding(&self, consumers: &[&str]) -> Resources {
        self.allocations
            .iter()
            .filter(|(consumer, _)| !consumers.contains(&consumer.as_str()))
            .fold(Resources::default(), |acc, (_, r)| acc.saturating_add(r))
    }

    fn fits(&self, replacing: &[&str], amount: &Resources) -> bool {
        self.capacity
            .covers(&self.used_excluding(replacing).saturating_add(amount))
    }
}

/// Process-local ledger with per-provider generations.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    providers: Mutex<BTreeMap<ProviderId, ProviderRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(self, provider: &str, capacity: Resources) -> Self {
        self.add_provider(provider, capacity);
        self
    }

    pub fn add_provider(&self, provider: &str, capacity: Resources) {
        self.lock().entry(provider.to_string()).or_default().capacity = capacity;
    }

    /// Write a reservation directly, bypassing capacity and version checks.
    pub fn seed_allocation(&self, provider: &str, consumer: &str, resources: Resources) {
        let mut providers = self.lock();
        let record = providers.entry(provider.to_string()).or_default();
        record.allocations.insert(consumer.to_string(), resources);
        record.generation += 1;
    }

    /// Drop a reservation without touching the generation.
    pub fn clear_allocation(&self, provider: &str, consumer: &str) {
        if let Some(record) = self.lock().get_mut(provider) {
            record.allocations.remove(consumer);
        }
    }

    pub fn allocation(&self, provider: &str, consumer: &str) -> Option<Resources> {
        self.lock()
            .get(provider)
            .and_then(|p| p.allocations.get(consumer).copied())
    }

    pub fn generation(&self, provider: &str) -> Option<u64> {
        self.lock().get(provider).map(|p| p.generation)
    }

    /// Consumers holding a reservation on `provider`.
    pub fn consumers(&self, provider: &str) -> Vec<ConsumerId> {
        self.lock()
            .get(provider)
            .map(|p| p.allocations.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn used(&self, provider: &str) -> Resources {
        self.lock()
            .get(provider)
            .map(|p| p.used_excluding(&[]))
            .unwrap_or_default()
    }

    /// Make every call fail with [`LedgerError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ProviderId, ProviderRecord>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> LedgerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(())
    }

    fn transfer_now(&self, provider: &str, from: &str, to: &str, allocation: &Resources) -> LedgerResult<bool> {
        self.check_available()?;
        let mut providers = self.lock();
        let Some(record) = providers.get_mut(provider) else {
            return Ok(false);
        };
        if !record.allocations.contains_key(from) {
            debug!(%provider, %from, "transfer source holds nothing");
            return Ok(false);
        }
        if !record.fits(&[from, to], allocation) {
            return Ok(false);
        }
        record.allocations.remove(from);
        record.allocations.insert(to.to_string(), *allocation);
        record.generation += 1;
        Ok(true)
    }

    fn claim_now(&self, consumer: &str, allocation_request: &str, version: u64) -> LedgerResult<bool> {
        self.check_available()?;
        let request: AllocationRequest = serde_json::from_str(allocation_request)
            .map_err(|e| LedgerError::InvalidRequest(e.to_string()))?;
        let mut providers = self.lock();

        for (provider, amount) in &request.allocations {
            let Some(record) = providers.get(provider) else {
                debug!(%provider, "claim against unknown provider");
                return Ok(false);
            };
            if record.generation > version {
                debug!(%provider, version, generation = record.generation, "stale claim version");
                return Ok(false);
            }
            if !record.fits(&[consumer], amount) {
                debug!(%provider, %consumer, "insufficient capacity for claim");
                return Ok(false);
            }
        }

        for (provider, amount) in request.allocations {
            if let Some(record) = providers.get_mut(&provider) {
                record.allocations.insert(consumer.to_string(), amount);
                record.generation += 1;
            }
        }
        Ok(true)
    }

    fn release_now(&self, consumer: &str, provider: &str, resources: &Resources) -> LedgerResult<()> {
        self.check_available()?;
        let mut providers = self.lock();
        let Some(record) = providers.get_mut(provider) else {
            return Ok(());
        };
        let Some(held) = record.allocations.get(consumer).copied() else {
            return Ok(());
        };
        let remaining = held.saturating_sub(resources);
        if remaining.is_empty() {
            record.allocations.remove(consumer);
        } else {
            record.allocations.insert(consumer.to_string(), remaining);
        }
        record.generation += 1;
        Ok(())
    }
}

impl AllocationLedger for InMemoryLedger {
    fn get_allocations_for_consumer<'a>(
        &'a self,
        provider: &'a str,
        consumer: &'a str,
    ) -> LedgerFuture<'a, Option<Resources>> {
        let result = self.check_available().map(|_| self.allocation(provider, consumer));
        Box::pin(async move { result })
    }

    fn transfer_allocation<'a>(
        &'a self,
        provider: &'a str,
        from: &'a str,
        to: &'a str,
        allocation: &'a Resources,
    ) -> LedgerFuture<'a, bool> {
        let result = self.transfer_now(provider, from, to, allocation);
        Box::pin(async move { result })
    }

    fn claim<'a>(
        &'a self,
        consumer: &'a str,
        allocation_request: &'a str,
        version: u64,
    ) -> LedgerFuture<'a, bool> {
        let result = self.claim_now(consumer, allocation_request, version);
        Box::pin(async move { result })
    }

    fn release_provider_allocation<'a>(
        &'a self,
        consumer: &'a str,
        provider: &'a str,
        resources: &'a Resources,
    ) -> LedgerFuture<'a, ()> {
        let result = self.release_now(consumer, provider, resources);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Resources {
        Resources::new(2048, 2, 20)
    }

    fn request(provider: &str, resources: Resources) -> String {
        serde_json::to_string(&AllocationRequest::single(provider, resources)).unwrap()
    }

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::new().with_provider("p1", Resources::new(4096, 4, 100))
    }

    #[tokio::test]
    async fn claim_bumps_generation() {
        let ledger = ledger();
        assert_eq!(ledger.generation("p1"), Some(0));
        assert!(ledger.claim("w1", &request("p1", small()), 0).await.unwrap());
        assert_eq!(ledger.generation("p1"), Some(1));
        assert_eq!(ledger.allocation("p1", "w1"), Some(small()));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let ledger = ledger();
        assert!(ledger.claim("w1", &request("p1", small()), 0).await.unwrap());
        assert!(!ledger.claim("w2", &request("p1", small()), 0).await.unwrap());
        assert_eq!(ledger.allocation("p1", "w2"), None);
        assert!(ledger.claim("w2", &request("p1", small()), 1).await.unwrap());
    }

    #[tokio::test]
    async fn claim_respects_capacity() {
        let ledger = ledger();
        let big = Resources::new(4097, 1, 1);
        assert!(!ledger.claim("w1", &request("p1", big), 0).await.unwrap());
        assert!(!ledger.claim("w1", &request("missing", small()), 0).await.unwrap());
        assert!(ledger.used("p1").is_empty());
    }

    #[tokio::test]
    async fn malformed_request_is_an_error() {
        let err = ledger().claim("w1", "{not json", 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn transfer_moves_ownership_in_one_step() {
        let ledger = ledger();
        ledger.seed_allocation("p1", "w1", small());
        assert!(ledger.transfer_allocation("p1", "w1", "m1", &small()).await.unwrap());
        assert_eq!(ledger.allocation("p1", "w1"), None);
        assert_eq!(ledger.allocation("p1", "m1"), Some(small()));
        assert_eq!(ledger.used("p1"), small());
    }

    #[tokio::test]
    async fn transfer_without_source_allocation_is_a_conflict() {
        let ledger = ledger();
        assert!(!ledger.transfer_allocation("p1", "w1", "m1", &small()).await.unwrap());
        assert!(!ledger.transfer_allocation("nope", "w1", "m1", &small()).await.unwrap());
        assert!(ledger.consumers("p1").is_empty());
    }

    #[tokio::test]
    async fn release_drops_empty_allocations() {
        let ledger = ledger();
        ledger.seed_allocation("p1", "w1", small());
        ledger
            .release_provider_allocation("w1", "p1", &Resources::new(1024, 1, 10))
            .await
            .unwrap();
        assert_eq!(ledger.allocation("p1", "w1"), Some(Resources::new(1024, 1, 10)));
        ledger.release_provider_allocation("w1", "p1", &small()).await.unwrap();
        assert_eq!(ledger.allocation("p1", "w1"), None);
        ledger.release_provider_allocation("w1", "p1", &small()).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_ledger_faults() {
        let ledger = ledger();
        ledger.set_unavailable(true);
        assert!(matches!(
            ledger.get_allocations_for_consumer("p1", "w1").await,
            Err(LedgerError::Unavailable(_))
        ));
        assert!(ledger.claim("w1", &request("p1", small()), 0).await.is_err());
    }
}
