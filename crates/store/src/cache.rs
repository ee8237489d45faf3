//! Local tier in front of a remote tier

use crate::stats::BlockStoreStats;
use crate::BlockStore;
use async_trait::async_trait;
use depot_core::hash::to_hex;
use depot_core::{ErrorKind, Hash, Result, StoreIndex, StoredBlock};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves gets from `local` when it can and fills it from `remote` otherwise
///
/// Failing to populate the local tier is logged and does not fail the get.
pub struct CacheBlockStore {
    local: Arc<dyn BlockStore>,
    remote: Arc<dyn BlockStore>,
}

impl CacheBlockStore {
    pub fn new(local: Arc<dyn BlockStore>, remote: Arc<dyn BlockStore>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &Arc<dyn BlockStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn BlockStore> {
        &self.remote
    }
}

#[async_trait]
impl BlockStore for CacheBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        self.remote.put_stored_block(block.clone()).await?;
        if let Err(e) = self.local.put_stored_block(block).await {
            warn!(error = %e, "failed to mirror block into local cache");
        }
        Ok(())
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        let mut pursued = self.local.preflight_get(chunk_hashes).await?;
        let rest: Vec<Hash> = chunk_hashes
            .iter()
            .copied()
            .filter(|h| !pursued.contains(h))
            .collect();
        if !rest.is_empty() {
            pursued.extend(self.remote.preflight_get(&rest).await?);
        }
        Ok(pursued)
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        match self.local.get_stored_block(block_hash).await {
            Ok(block) => return Ok(block),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Io | ErrorKind::InvalidArgument) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(block = %to_hex(block_hash), error = %e, "local cache read failed, using remote");
                }
            }
            Err(e) => return Err(e),
        }
        let block = self.remote.get_stored_block(block_hash).await?;
        debug!(block = %to_hex(block_hash), "filled local cache from remote");
        if let Err(e) = self.local.put_stored_block(block.clone()).await {
            warn!(block = %to_hex(block_hash), error = %e, "failed to populate local cache");
        }
        Ok(block)
    }

    async fn get_existing_content(
        &self,
        chunk_hashes: &[Hash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        self.remote
            .get_existing_content(chunk_hashes, min_block_usage_percent)
            .await
    }

    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32> {
        self.local.prune_blocks(keep_block_hashes).await
    }

    async fn flush(&self) -> Result<()> {
        let (local, remote) = tokio::join!(self.local.flush(), self.remote.flush());
        if let Err(e) = local {
            warn!(error = %e, "failed to flush local cache");
        }
        remote
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.remote.get_stats()
    }
}
