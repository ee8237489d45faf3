//! Bounded in-memory block cache

use crate::stats::BlockStoreStats;
use crate::BlockStore;
use ahash::AHashMap;
use async_trait::async_trait;
use depot_core::{Hash, Result, StoreIndex, StoredBlock};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Entry {
    block: Arc<StoredBlock>,
    /// Access counter value at the last hit
    last_access: AtomicU64,
}

/// Keeps the `capacity` most recently used blocks in front of another store
///
/// Puts are written through and cached. A capacity of 0 disables caching.
pub struct LruBlockStore {
    inner: Arc<dyn BlockStore>,
    capacity: usize,
    entries: RwLock<AHashMap<Hash, Entry>>,
    access_counter: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruBlockStore {
    pub fn new(inner: Arc<dyn BlockStore>, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            entries: RwLock::new(AHashMap::with_capacity(capacity)),
            access_counter: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, block_hash: Hash) -> bool {
        self.entries.read().contains_key(&block_hash)
    }

    /// (hits, misses) served so far
    pub fn hit_counts(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    fn tick(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, block: Arc<StoredBlock>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write();
        let hash = block.block_hash();
        if !entries.contains_key(&hash) {
            while entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                    .map(|(k, _)| *k);
                match oldest {
                    Some(key) => {
                        entries.remove(&key);
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            hash,
            Entry {
                block,
                last_access: AtomicU64::new(self.tick()),
            },
        );
    }
}

#[async_trait]
impl BlockStore for LruBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        self.inner.put_stored_block(block.clone()).await?;
        self.insert(block);
        Ok(())
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.inner.preflight_get(chunk_hashes).await
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let cached = self.entries.read().get(&block_hash).map(|entry| {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            entry.block.clone()
        });
        if let Some(block) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let block = self.inner.get_stored_block(block_hash).await?;
        self.insert(block.clone());
        Ok(block)
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
        self.entries
            .write()
            .retain(|hash, _| keep_block_hashes.contains(hash));
        self.inner.prune_blocks(keep_block_hashes).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.inner.get_stats()
    }
}
