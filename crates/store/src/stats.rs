//! Per-store operation counters

use depot_core::StoredBlock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of a store's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStoreStats {
    pub get_existing_content_count: u64,
    pub preflight_get_count: u64,
    pub block_get_count: u64,
    pub block_put_count: u64,
    pub chunk_get_count: u64,
    pub chunk_put_count: u64,
    pub bytes_get_count: u64,
    pub bytes_put_count: u64,
    pub block_get_retry_count: u64,
    pub block_put_retry_count: u64,
    pub block_get_fail_count: u64,
    pub block_put_fail_count: u64,
    pub prune_count: u64,
    pub flush_count: u64,
}

/// Lock-free counters behind [`BlockStoreStats`]
#[derive(Debug, Default)]
pub struct StoreCounters {
    get_existing_content: AtomicU64,
    preflight_get: AtomicU64,
    block_get: AtomicU64,
    block_put: AtomicU64,
    chunk_get: AtomicU64,
    chunk_put: AtomicU64,
    bytes_get: AtomicU64,
    bytes_put: AtomicU64,
    block_get_retry: AtomicU64,
    block_put_retry: AtomicU64,
    block_get_fail: AtomicU64,
    block_put_fail: AtomicU64,
    prune: AtomicU64,
    flush: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl StoreCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_got(&self, block: &StoredBlock) {
        bump(&self.block_get, 1);
        bump(&self.chunk_get, block.index.chunk_count() as u64);
        bump(&self.bytes_get, block.data.len() as u64);
    }

    pub fn block_put(&self, block: &StoredBlock) {
        bump(&self.block_put, 1);
        bump(&self.chunk_put, block.index.chunk_count() as u64);
        bump(&self.bytes_put, block.data.len() as u64);
    }

    pub fn get_retried(&self) {
        bump(&self.block_get_retry, 1);
    }

    pub fn put_retried(&self) {
        bump(&self.block_put_retry, 1);
    }

    pub fn get_failed(&self) {
        bump(&self.block_get_fail, 1);
    }

    pub fn put_failed(&self) {
        bump(&self.block_put_fail, 1);
    }

    pub fn existing_content_queried(&self) {
        bump(&self.get_existing_content, 1);
    }

    pub fn preflighted(&self) {
        bump(&self.preflight_get, 1);
    }

    pub fn pruned(&self) {
        bump(&self.prune, 1);
    }

    pub fn flushed(&self) {
        bump(&self.flush, 1);
    }

    pub fn snapshot(&self) -> BlockStoreStats {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BlockStoreStats {
            get_existing_content_count: read(&self.get_existing_content),
            preflight_get_count: read(&self.preflight_get),
            block_get_count: read(&self.block_get),
            block_put_count: read(&self.block_put),
            chunk_get_count: read(&self.chunk_get),
            chunk_put_count: read(&self.chunk_put),
            bytes_get_count: read(&self.bytes_get),
            bytes_put_count: read(&self.bytes_put),
            block_get_retry_count: read(&self.block_get_retry),
            block_put_retry_count: read(&self.block_put_retry),
            block_get_fail_count: read(&self.block_get_fail),
            block_put_fail_count: read(&self.block_put_fail),
            prune_count: read(&self.prune),
            flush_count: read(&self.flush),
        }
    }
}
