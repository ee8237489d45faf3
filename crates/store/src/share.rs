//! Single-flight block fetches
//!
//! Concurrent gets for the same block are turned into one fetch from the
//! wrapped store. The fetch runs in its own task, so cancelling the caller
//! that started it does not fail the others.

use crate::stats::BlockStoreStats;
use crate::BlockStore;
use ahash::AHashMap;
use async_trait::async_trait;
use depot_core::hash::to_hex;
use depot_core::{Error, Hash, Result, StoreIndex, StoredBlock};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::instrument::WithSubscriber;

type Shared = Result<Arc<StoredBlock>>;
type InFlight = Arc<Mutex<AHashMap<Hash, broadcast::Sender<Shared>>>>;

pub struct ShareBlockStore {
    inner: Arc<dyn BlockStore>,
    in_flight: InFlight,
}

impl ShareBlockStore {
    pub fn new(inner: Arc<dyn BlockStore>) -> Self {
        Self {
            inner,
            in_flight: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// Blocks currently being fetched
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Hands the fetch result to every waiter and clears the in-flight entry,
/// also when the fetch task unwinds before it has a result
struct Publish {
    map: InFlight,
    block_hash: Hash,
    sent: bool,
}

impl Publish {
    fn finish(mut self, result: Shared) {
        self.send(result);
    }

    fn send(&mut self, result: Shared) {
        self.sent = true;
        if let Some(tx) = self.map.lock().remove(&self.block_hash) {
            let _ = tx.send(result);
        }
    }
}

impl Drop for Publish {
    fn drop(&mut self) {
        if !self.sent {
            let msg = format!("fetch of block {} was interrupted", to_hex(self.block_hash));
            self.send(Err(Error::io(msg)));
        }
    }
}

#[async_trait]
impl BlockStore for ShareBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        self.inner.put_stored_block(block).await
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.inner.preflight_get(chunk_hashes).await
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let mut rx = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&block_hash) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    in_flight.insert(block_hash, tx);
                    let inner = self.inner.clone();
                    let publish = Publish {
                        map: self.in_flight.clone(),
                        block_hash,
                        sent: false,
                    };
                    tokio::spawn(
                        async move {
                            let result = inner.get_stored_block(block_hash).await;
                            publish.finish(result);
                        }
                        .with_current_subscriber(),
                    );
                    rx
                }
            }
        };
        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(Error::io(format!(
                "fetch of block {} ended without a result",
                to_hex(block_hash)
            ))),
        }
    }

    async fn get_existing_content(
        &self,
        chunk_hashes: &[Hash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        self.inner
            .get_existing_content(chunk_hashes, min_block_usage_percent)
            .await
    }

    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32> {
        self.inner.prune_blocks(keep_block_hashes).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.inner.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBlockStore;
    use depot_core::{Blake3Hasher, ErrorKind};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Slow store that counts the gets reaching it
    struct Counting {
        blocks: MemBlockStore,
        gets: AtomicU64,
    }

    #[async_trait]
    impl BlockStore for Counting {
        async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
            self.blocks.put_stored_block(block).await
        }
        async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
            self.blocks.preflight_get(chunk_hashes).await
        }
        async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
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

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            blocks: MemBlockStore::new(),
            gets: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn test_concurrent_gets_fetch_once() {
        let backing = counting();
        let block = Arc::new(StoredBlock::from_chunks(&Blake3Hasher, 0, &[&b"shared"[..]]));
        backing.put_stored_block(block.clone()).await.unwrap();
        let store = Arc::new(ShareBlockStore::new(backing.clone()));

        let gets = (0..8).map(|_| {
            let store = store.clone();
            let hash = block.block_hash();
            tokio::spawn(async move { store.get_stored_block(hash).await })
        });
        for got in futures::future::join_all(gets).await {
            assert_eq!(got.unwrap().unwrap().data, block.data);
        }
        assert_eq!(backing.gets.load(Ordering::SeqCst), 1);
        assert_eq!(store.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let backing = counting();
        let store = ShareBlockStore::new(backing.clone());
        let (a, b) = tokio::join!(store.get_stored_block(5), store.get_stored_block(5));
        assert_eq!(a.err().unwrap().kind(), ErrorKind::NotFound);
        assert_eq!(b.err().unwrap().kind(), ErrorKind::NotFound);
        assert_eq!(backing.gets.load(Ordering::SeqCst), 1);
    }

    struct Panicking;

    #[async_trait]
    impl BlockStore for Panicking {
        async fn put_stored_block(&self, _block: Arc<StoredBlock>) -> Result<()> {
            Ok(())
        }
        async fn preflight_get(&self, _chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
            Ok(Vec::new())
        }
        async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            panic!("backend blew up fetching {}", block_hash);
        }
        async fn get_existing_content(&self, _chunk_hashes: &[Hash], _pct: u32) -> Result<StoreIndex> {
            Err(Error::not_supported("panicking store"))
        }
        async fn prune_blocks(&self, _keep: &[Hash]) -> Result<u32> {
            Ok(0)
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn get_stats(&self) -> BlockStoreStats {
            BlockStoreStats::default()
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_waiters() {
        let store = ShareBlockStore::new(Arc::new(Panicking));
        let (a, b) = tokio::join!(store.get_stored_block(9), store.get_stored_block(9));
        assert_eq!(a.err().unwrap().kind(), ErrorKind::Io);
        assert_eq!(b.err().unwrap().kind(), ErrorKind::Io);
        assert_eq!(store.in_flight_count(), 0);

        // The entry is gone, so the next get starts a fresh fetch
        let again = tokio::time::timeout(Duration::from_secs(5), store.get_stored_block(9)).await;
        assert!(again.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_fail_joiners() {
        let backing = counting();
        let block = Arc::new(StoredBlock::from_chunks(&Blake3Hasher, 0, &[&b"x"[..]]));
        backing.put_stored_block(block.clone()).await.unwrap();
        let store = Arc::new(ShareBlockStore::new(backing.clone()));

        let leader = {
            let store = store.clone();
            let hash = block.block_hash();
            tokio::spawn(async move { store.get_stored_block(hash).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let joiner = {
            let store = store.clone();
            let hash = block.block_hash();
            tokio::spawn(async move { store.get_stored_block(hash).await })
        };
        leader.abort();
        assert_eq!(joiner.await.unwrap().unwrap().data, block.data);
        assert_eq!(backing.gets.load(Ordering::SeqCst), 1);
    }
}
