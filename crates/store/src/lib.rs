//! Block stores for depot
//!
//! [`BlockStore`] is the async interface every tier implements. Concrete
//! stores hold blocks ([`FsBlockStore`], [`MemBlockStore`]); decorators wrap
//! another store and add one behavior each:
//!
//! - [`CacheBlockStore`]: local tier in front of a remote tier
//! - [`CompressBlockStore`]: per-tag payload compression
//! - [`LruBlockStore`]: bounded in-memory block cache
//! - [`ShareBlockStore`]: single-flight for concurrent gets
//! - [`RetryBlockStore`]: bounded retries for transient failures

pub mod cache;
pub mod compress;
pub mod fs;
pub mod lru;
pub mod mem;
pub mod retry;
pub mod share;
pub mod stats;

pub use cache::CacheBlockStore;
pub use compress::{Codec, CompressBlockStore, CompressionRegistry};
pub use fs::FsBlockStore;
pub use lru::LruBlockStore;
pub use mem::MemBlockStore;
pub use retry::{RetryBlockStore, RetryPolicy};
pub use share::ShareBlockStore;
pub use stats::{BlockStoreStats, StoreCounters};

use async_trait::async_trait;
use depot_core::{with_current_dispatch, Error, Hash, Result, StoreIndex, StoredBlock};
use std::sync::Arc;

/// Asynchronous storage of immutable blocks
///
/// Every operation may be cancelled by dropping its future.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persist a block; putting a block that is already stored is a no-op
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()>;

    /// Declare intent to fetch `chunk_hashes` soon
    ///
    /// Returns the subset the store is pursuing. Advisory only.
    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>>;

    /// Fetch one block; `NotFound` if absent
    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>>;

    /// Blocks of this store worth fetching for `chunk_hashes`
    async fn get_existing_content(&self, chunk_hashes: &[Hash], min_block_usage_percent: u32)
        -> Result<StoreIndex>;

    /// Delete every block not in `keep_block_hashes`; returns the number deleted
    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32>;

    /// Wait until every pending put is durably committed
    async fn flush(&self) -> Result<()>;

    fn get_stats(&self) -> BlockStoreStats;
}

/// Run blocking storage or codec work off the async workers
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(with_current_dispatch(work))
        .await
        .map_err(|e| Error::io(format!("blocking task failed: {}", e)))?
}
