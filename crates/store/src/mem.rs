//! In-memory block store

use crate::stats::{BlockStoreStats, StoreCounters};
use crate::BlockStore;
use async_trait::async_trait;
use dashmap::DashMap;
use depot_core::hash::to_hex;
use depot_core::store_index::{self, StoreIndex};
use depot_core::{Error, Hash, Result, StoredBlock};
use parking_lot::Mutex;
use std::sync::Arc;

/// Blocks kept in a concurrent map
///
/// Insertion order is remembered so [`get_existing_content`] sees a stable
/// store order.
///
/// [`get_existing_content`]: BlockStore::get_existing_content
#[derive(Default)]
pub struct MemBlockStore {
    blocks: DashMap<Hash, Arc<StoredBlock>>,
    order: Mutex<Vec<Hash>>,
    counters: StoreCounters,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block_hash: Hash) -> bool {
        self.blocks.contains_key(&block_hash)
    }

    /// Index over every stored block, in insertion order
    pub fn store_index(&self) -> Result<StoreIndex> {
        let order = self.order.lock();
        let blocks: Vec<_> = order
            .iter()
            .filter_map(|h| self.blocks.get(h).map(|b| b.index.clone()))
            .collect();
        let hash_identifier = blocks.first().map(|b| b.hash_identifier).unwrap_or(0);
        let max_size = blocks.iter().map(|b| b.data_size()).max().unwrap_or(0) as u32;
        let max_chunks = blocks.iter().map(|b| b.chunk_count()).max().unwrap_or(0) as u32;
        StoreIndex::from_blocks(hash_identifier, max_size, max_chunks, &blocks)
    }
}

#[async_trait]
impl BlockStore for MemBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        block.validate()?;
        let hash = block.block_hash();
        let mut order = self.order.lock();
        if self.blocks.contains_key(&hash) {
            return Ok(());
        }
        self.counters.block_put(&block);
        self.blocks.insert(hash, block);
        order.push(hash);
        Ok(())
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.counters.preflighted();
        let index = self.store_index()?;
        Ok(chunk_hashes
            .iter()
            .copied()
            .filter(|h| index.contains_chunk(*h))
            .collect())
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let block = self
            .blocks
            .get(&block_hash)
            .map(|b| b.clone())
            .ok_or_else(|| Error::not_found(format!("block {}", to_hex(block_hash))))?;
        self.counters.block_got(&block);
        Ok(block)
    }

    async fn get_existing_content(
        &self,
        chunk_hashes: &[Hash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        self.counters.existing_content_queried();
        store_index::get_existing_content(&self.store_index()?, chunk_hashes, min_block_usage_percent)
    }

    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32> {
        self.counters.pruned();
        let mut order = self.order.lock();
        let before = order.len();
        order.retain(|h| {
            let keep = keep_block_hashes.contains(h);
            if !keep {
                self.blocks.remove(h);
            }
            keep
        });
        Ok((before - order.len()) as u32)
    }

    async fn flush(&self) -> Result<()> {
        self.counters.flushed();
        Ok(())
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{Blake3Hasher, ErrorKind};

    fn block(payload: &[u8]) -> Arc<StoredBlock> {
        Arc::new(StoredBlock::from_chunks(&Blake3Hasher, 0, &[payload]))
    }

    #[tokio::test]
    async fn test_put_get_is_idempotent() {
        let store = MemBlockStore::new();
        let b = block(b"payload");
        store.put_stored_block(b.clone()).await.unwrap();
        store.put_stored_block(b.clone()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_stats().block_put_count, 1);

        let got = store.get_stored_block(b.block_hash()).await.unwrap();
        assert_eq!(got.data, b.data);
        let err = store.get_stored_block(42).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_prune_keeps_listed_blocks() {
        let store = MemBlockStore::new();
        let keep = block(b"keep");
        store.put_stored_block(keep.clone()).await.unwrap();
        store.put_stored_block(block(b"drop")).await.unwrap();
        assert_eq!(store.prune_blocks(&[keep.block_hash()]).await.unwrap(), 1);
        assert!(store.contains(keep.block_hash()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_content_and_preflight() {
        let store = MemBlockStore::new();
        let b = block(b"chunk");
        store.put_stored_block(b.clone()).await.unwrap();
        let chunk = b.index.chunk_hashes[0];
        let existing = store.get_existing_content(&[chunk, 7], 0).await.unwrap();
        assert_eq!(existing.block_hashes(), &[b.block_hash()]);
        assert_eq!(store.preflight_get(&[chunk, 7]).await.unwrap(), vec![chunk]);
    }
}
