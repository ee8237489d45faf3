//! Bounded retries for network-tier stores

use crate::stats::{BlockStoreStats, StoreCounters};
use crate::BlockStore;
use async_trait::async_trait;
use depot_core::hash::to_hex;
use depot_core::{Hash, Result, StoreIndex, StoredBlock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before retry `n` is `base_backoff << n`
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Retries transient (`Io`) failures of the wrapped store
///
/// Other errors and exhausted retries are returned unchanged.
pub struct RetryBlockStore {
    inner: Arc<dyn BlockStore>,
    policy: RetryPolicy,
    counters: StoreCounters,
}

impl RetryBlockStore {
    pub fn new(inner: Arc<dyn BlockStore>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            counters: StoreCounters::new(),
        }
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, on_retry: fn(&StoreCounters), mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay(attempt);
                    warn!(op = what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying block store operation");
                    on_retry(&self.counters);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BlockStore for RetryBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        let result = self
            .with_retries("put", StoreCounters::put_retried, || self.inner.put_stored_block(block.clone()))
            .await;
        if let Err(e) = &result {
            self.counters.put_failed();
            warn!(block = %to_hex(block.block_hash()), error = %e, "block put failed");
        }
        result
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.with_retries("preflight", StoreCounters::get_retried, || self.inner.preflight_get(chunk_hashes))
            .await
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let result = self
            .with_retries("get", StoreCounters::get_retried, || self.inner.get_stored_block(block_hash))
            .await;
        if let Err(e) = &result {
            self.counters.get_failed();
            warn!(block = %to_hex(block_hash), error = %e, "block get failed");
        }
        result
    }

    async fn get_existing_content(
        &self,
        chunk_hashes: &[Hash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        self.with_retries("existing_content", StoreCounters::get_retried, || {
            self.inner.get_existing_content(chunk_hashes, min_block_usage_percent)
        })
        .await
    }

    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32> {
        self.inner.prune_blocks(keep_block_hashes).await
    }

    async fn flush(&self) -> Result<()> {
        self.with_retries("flush", StoreCounters::put_retried, || self.inner.flush())
            .await
    }

    fn get_stats(&self) -> BlockStoreStats {
        let own = self.counters.snapshot();
        let mut stats = self.inner.get_stats();
        stats.block_get_retry_count += own.block_get_retry_count;
        stats.block_put_retry_count += own.block_put_retry_count;
        stats.block_get_fail_count += own.block_get_fail_count;
        stats.block_put_fail_count += own.block_put_fail_count;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBlockStore;
    use depot_core::{Blake3Hasher, Error, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` gets with `error`
    struct Flaky {
        blocks: MemBlockStore,
        failures: AtomicU32,
        error: Error,
    }

    #[async_trait]
    impl BlockStore for Flaky {
        async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
            self.blocks.put_stored_block(block).await
        }
        async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
            self.blocks.preflight_get(chunk_hashes).await
        }
        async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.blocks.get_stored_block(block_hash).await
        }
        async fn get_existing_content(&self, chunk_hashes: &[Hash], pct: u32) -> Result<StoreIndex> {
            self.blocks.get_existing_content(chunk_hashes, pct).await
        }
        async fn prune_blocks(&self, keep: &[Hash]) -> Result<u32> {
            self.blocks.prune_blocks(keep).await
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn get_stats(&self) -> BlockStoreStats {
            self.blocks.get_stats()
        }
    }

    async fn flaky(failures: u32, error: Error) -> (Arc<Flaky>, Arc<StoredBlock>) {
        let store = Arc::new(Flaky {
            blocks: MemBlockStore::new(),
            failures: AtomicU32::new(failures),
            error,
        });
        let block = Arc::new(StoredBlock::from_chunks(&Blake3Hasher, 0, &[&b"retry me"[..]]));
        store.put_stored_block(block.clone()).await.unwrap();
        (store, block)
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (backing, block) = flaky(2, Error::io("connection reset")).await;
        let store = RetryBlockStore::new(backing, policy(3));
        store.get_stored_block(block.block_hash()).await.unwrap();
        let stats = store.get_stats();
        assert_eq!(stats.block_get_retry_count, 2);
        assert_eq!(stats.block_get_fail_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_io() {
        let (backing, block) = flaky(5, Error::io("connection reset")).await;
        let store = RetryBlockStore::new(backing, policy(2));
        let err = store.get_stored_block(block.block_hash()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
        let stats = store.get_stats();
        assert_eq!(stats.block_get_retry_count, 2);
        assert_eq!(stats.block_get_fail_count, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let (backing, block) = flaky(1, Error::not_found("gone")).await;
        let store = RetryBlockStore::new(backing, policy(3));
        let err = store.get_stored_block(block.block_hash()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(store.get_stats().block_get_retry_count, 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
        };
        assert_eq!(p.delay(0), Duration::from_millis(50));
        assert_eq!(p.delay(2), Duration::from_millis(200));
    }
}
