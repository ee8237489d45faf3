//! Packing local content into blocks and uploading them

use ahash::AHashMap;
use depot_core::hash::to_hex;
use depot_core::storage::ReadHandle;
use depot_core::{
    with_current_dispatch, CancelToken, ContentHasher, Error, Hash, Progress, ProgressTracker, Result, Storage,
    StoreIndex, StoredBlock, VersionIndex,
};
use depot_store::BlockStore;
use futures::future::FutureExt;
use futures::stream::{self, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Where the bytes of one chunk can be read
#[derive(Debug, Clone)]
struct ChunkSource {
    path: String,
    offset: u64,
    size: u32,
}

/// First asset and offset holding each chunk of `version`
fn chunk_sources(version: &VersionIndex) -> AHashMap<Hash, ChunkSource> {
    let mut sources = AHashMap::with_capacity(version.chunk_count());
    for asset in 0..version.asset_count() {
        let mut offset = 0u64;
        for &c in version.asset_chunk_indexes(asset) {
            let c = c as usize;
            let size = version.chunk_size(c);
            sources.entry(version.chunk_hash(c)).or_insert_with(|| ChunkSource {
                path: version.asset_path(asset).to_string(),
                offset,
                size,
            });
            offset += u64::from(size);
        }
    }
    sources
}

fn read_block(
    storage: &dyn Storage,
    hasher: &dyn ContentHasher,
    root: &str,
    expected: Hash,
    tag: u32,
    sources: &[ChunkSource],
) -> Result<StoredBlock> {
    let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(sources.len());
    let mut current: Option<(&str, Box<dyn ReadHandle>)> = None;
    for source in sources {
        if current.as_ref().map_or(true, |(path, _)| *path != source.path) {
            let handle = storage.open_read(&storage.join(root, &source.path))?;
            current = Some((source.path.as_str(), handle));
        }
        let mut data = vec![0u8; source.size as usize];
        if let Some((_, handle)) = current.as_mut() {
            handle.read_at(source.offset, &mut data)?;
        }
        buffers.push(data);
    }
    let chunks: Vec<&[u8]> = buffers.iter().map(|b| b.as_slice()).collect();
    let block = StoredBlock::from_chunks(hasher, tag, &chunks);
    if block.block_hash() != expected {
        return Err(Error::io(format!(
            "content under {} changed while packing block {}",
            root,
            to_hex(expected)
        )));
    }
    Ok(block)
}

/// Build and put every block listed in `missing`, then flush `block_store`
///
/// Chunk bytes are read from the first asset of `version` that references
/// them. Up to `worker_count` blocks are in flight at once. Progress is
/// reported in blocks.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(root = %root, blocks = missing.block_count()))]
pub async fn write_content(
    block_store: &dyn BlockStore,
    storage: Arc<dyn Storage>,
    hasher: Arc<dyn ContentHasher>,
    missing: &StoreIndex,
    version: &VersionIndex,
    root: &str,
    worker_count: usize,
    progress: Option<&dyn Progress>,
    cancel: Option<&CancelToken>,
) -> Result<()> {
    if worker_count == 0 {
        return Err(Error::invalid("worker count must be non-zero"));
    }
    if !missing.is_empty() && missing.hash_identifier() != hasher.identifier() {
        return Err(Error::invalid("store index hash identifier does not match hasher"));
    }

    let sources = chunk_sources(version);
    let mut plans = Vec::with_capacity(missing.block_count());
    for block in 0..missing.block_count() {
        let chunk_sources = missing
            .block_chunk_hashes(block)
            .iter()
            .map(|h| {
                sources
                    .get(h)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("chunk {} is not part of the version", to_hex(*h))))
            })
            .collect::<Result<Vec<_>>>()?;
        plans.push((missing.block_hash(block), missing.block_tag(block), chunk_sources));
    }

    let tracker = ProgressTracker::new(progress, plans.len() as u64);
    let tracker = &tracker;
    let root_owned = root.to_string();
    stream::iter(plans.into_iter().map(Ok::<_, Error>))
        .map_ok(|(block_hash, tag, chunk_sources)| {
            let storage = storage.clone();
            let hasher = hasher.clone();
            let root = root_owned.clone();
            async move {
                if let Some(token) = cancel {
                    token.check()?;
                }
                let block = tokio::task::spawn_blocking(with_current_dispatch(move || {
                    read_block(storage.as_ref(), hasher.as_ref(), &root, block_hash, tag, &chunk_sources)
                }))
                .await
                .map_err(|e| Error::io(format!("block packing task failed: {}", e)))??;
                debug!(block = %to_hex(block_hash), chunks = block.index.chunk_count(), "putting block");
                block_store.put_stored_block(Arc::new(block)).await?;
                tracker.advance(1);
                Ok::<(), Error>(())
            }
            .boxed()
        })
        .try_buffer_unordered(worker_count)
        .try_collect::<()>()
        .await?;

    block_store.flush().await?;
    info!(blocks = missing.block_count(), chunks = missing.chunk_count(), "wrote content");
    Ok(())
}
