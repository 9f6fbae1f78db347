//! Nonce coordination for concurrent transaction submission.
//!
//! One logical counter per (chain, sender). The first allocation seeds the
//! counter from the chain's *pending* transaction count, which includes
//! mempool transactions and so survives restarts while transactions are
//! still in flight. Subsequent allocations increment locally without
//! touching the RPC. A failed submission resets the counter so the next
//! allocation re-queries.

use alloy_primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::ChainError;

/// Where the coordinator fetches the chain's pending transaction count.
///
/// Implemented by [`ChainClient`](crate::chain::ChainClient); tests provide
/// an in-memory source.
#[async_trait]
pub trait PendingNonceSource: Send + Sync {
    async fn pending_transaction_count(&self, address: Address) -> Result<u64, ChainError>;
}

#[derive(Debug, Default)]
struct NonceEntry {
    /// Next nonce to hand out; `None` forces a fresh query.
    next: Option<u64>,
    /// Allocated but not yet confirmed.
    inflight: u64,
}

/// Serialises nonce allocation per (chain, sender).
///
/// Each entry has its own mutex, held across the initial pending-count fetch
/// so at most one `allocate` runs at a time per sender. The coordinator
/// knows nothing about individual transactions and keeps no persistent
/// state.
#[derive(Debug, Clone, Default)]
pub struct NonceCoordinator {
    entries: Arc<DashMap<(u64, Address), Arc<Mutex<NonceEntry>>>>,
}

impl NonceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, chain_id: u64, sender: Address) -> Arc<Mutex<NonceEntry>> {
        // Clone the Arc out so the dashmap shard lock is not held across
        // the await points below.
        let entry = self
            .entries
            .entry((chain_id, sender))
            .or_insert_with(|| Arc::new(Mutex::new(NonceEntry::default())));
        Arc::clone(entry.value())
    }

    /// Hand out the next nonce for `sender`, seeding from the chain on
    /// first use.
    pub async fn allocate(
        &self,
        source: &dyn PendingNonceSource,
        chain_id: u64,
        sender: Address,
    ) -> Result<u64, ChainError> {
        let cell = self.entry(chain_id, sender);
        let mut entry = cell.lock().await;
        let nonce = match entry.next {
            Some(next) => next,
            None => {
                tracing::trace!(%sender, chain_id, "fetching pending nonce");
                source.pending_transaction_count(sender).await?
            }
        };
        entry.next = Some(nonce + 1);
        entry.inflight += 1;
        tracing::trace!(%sender, chain_id, nonce, inflight = entry.inflight, "allocated nonce");
        Ok(nonce)
    }

    /// A previously allocated transaction was confirmed on chain.
    pub async fn on_confirmed(&self, chain_id: u64, sender: Address) {
        let cell = self.entry(chain_id, sender);
        let mut entry = cell.lock().await;
        entry.inflight = entry.inflight.saturating_sub(1);
    }

    /// A submission failed somewhere between allocation and acceptance:
    /// resynchronise against the chain.
    pub async fn on_failed(
        &self,
        source: &dyn PendingNonceSource,
        chain_id: u64,
        sender: Address,
    ) -> Result<(), ChainError> {
        self.reset(source, chain_id, sender).await
    }

    /// Clear the local counter and re-seed from the chain's pending count.
    ///
    /// Runs entirely under the entry mutex. If the re-query itself fails the
    /// counter stays cleared, so the next allocation retries the query.
    pub async fn reset(
        &self,
        source: &dyn PendingNonceSource,
        chain_id: u64,
        sender: Address,
    ) -> Result<(), ChainError> {
        let cell = self.entry(chain_id, sender);
        let mut entry = cell.lock().await;
        entry.next = None;
        entry.inflight = 0;
        let fresh = source.pending_transaction_count(sender).await?;
        entry.next = Some(fresh);
        tracing::debug!(%sender, chain_id, nonce = fresh, "nonce counter resynced");
        Ok(())
    }

    /// Allocated-but-unconfirmed count, for diagnostics.
    pub async fn inflight(&self, chain_id: u64, sender: Address) -> u64 {
        let cell = self.entry(chain_id, sender);
        let entry = cell.lock().await;
        entry.inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::sync::atomic::{AtomicU64, Ordering};

    const SENDER: Address = address!("0x6666666666666666666666666666666666666666");

    /// In-memory pending-count source that tracks how often it was queried.
    #[derive(Default)]
    struct MockSource {
        pending: AtomicU64,
        queries: AtomicU64,
        fail_next: AtomicU64,
    }

    #[async_trait]
    impl PendingNonceSource for MockSource {
        async fn pending_transaction_count(&self, _address: Address) -> Result<u64, ChainError> {
            if self.fail_next.swap(0, Ordering::SeqCst) > 0 {
                return Err(ChainError::Rpc {
                    code: None,
                    message: "nope".into(),
                    retryable: true,
                });
            }
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.pending.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_allocation_is_sequential() {
        let source = MockSource::default();
        source.pending.store(7, Ordering::SeqCst);
        let coordinator = NonceCoordinator::new();
        for expected in 7..12 {
            let nonce = coordinator.allocate(&source, 1, SENDER).await.unwrap();
            assert_eq!(nonce, expected);
        }
        // Only the first allocation hit the source.
        assert_eq!(source.queries.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.inflight(1, SENDER).await, 5);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let source = Arc::new(MockSource::default());
        let coordinator = NonceCoordinator::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let source = Arc::clone(&source);
            handles.push(tokio::spawn(async move {
                coordinator.allocate(source.as_ref(), 1, SENDER).await
            }));
        }
        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reset_resyncs_from_chain() {
        let source = MockSource::default();
        let coordinator = NonceCoordinator::new();
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 0);
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 1);

        // The chain moved on (both landed); a failure forces a resync.
        source.pending.store(2, Ordering::SeqCst);
        coordinator.on_failed(&source, 1, SENDER).await.unwrap();
        assert_eq!(coordinator.inflight(1, SENDER).await, 0);
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_resync_retries_on_next_allocate() {
        let source = MockSource::default();
        source.pending.store(3, Ordering::SeqCst);
        let coordinator = NonceCoordinator::new();
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 3);

        source.fail_next.store(1, Ordering::SeqCst);
        assert!(coordinator.on_failed(&source, 1, SENDER).await.is_err());
        // Counter stayed cleared; the next allocation queries again.
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_chains_do_not_share_counters() {
        let source = MockSource::default();
        let coordinator = NonceCoordinator::new();
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 0);
        assert_eq!(coordinator.allocate(&source, 8453, SENDER).await.unwrap(), 0);
        assert_eq!(coordinator.allocate(&source, 1, SENDER).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_decrements_inflight() {
        let source = MockSource::default();
        let coordinator = NonceCoordinator::new();
        coordinator.allocate(&source, 1, SENDER).await.unwrap();
        coordinator.allocate(&source, 1, SENDER).await.unwrap();
        coordinator.on_confirmed(1, SENDER).await;
        assert_eq!(coordinator.inflight(1, SENDER).await, 1);
        coordinator.on_confirmed(1, SENDER).await;
        coordinator.on_confirmed(1, SENDER).await;
        assert_eq!(coordinator.inflight(1, SENDER).await, 0);
    }
}
