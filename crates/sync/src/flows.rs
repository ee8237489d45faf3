//! End-to-end flows: publishing a local tree and bringing an install up to date

use crate::config::EngineConfig;
use crate::content::write_content;
use crate::writer::{change_version, ChangeVersionContext};
use ahash::{AHashMap, AHashSet};
use depot_core::{
    create_missing_content, create_version_diff, create_version_index, get_files_recursively, with_current_dispatch,
    CancelToken, ContentHasher, Error, Hash, HashRegistry, JobPool, PathFilter, Progress, Result, Storage,
    StoreIndex, VersionIndex, VersionIndexOptions,
};
use depot_store::{
    BlockStore, BlockStoreStats, CacheBlockStore, CompressBlockStore, CompressionRegistry, FsBlockStore,
    LruBlockStore, ShareBlockStore,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared collaborators of the flows
#[derive(Clone)]
pub struct FlowContext {
    pub registry: Arc<HashRegistry>,
    /// Hasher for new versions
    pub hasher: Arc<dyn ContentHasher>,
    pub jobs: JobPool,
    pub progress: Option<Arc<dyn Progress>>,
    pub cancel: Option<CancelToken>,
}

impl FlowContext {
    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub target_chunk_size: u32,
    pub max_block_size: u32,
    pub max_chunks_per_block: u32,
    /// Existing blocks used below this share are repacked
    pub min_block_usage_percent: u32,
    /// Tag of new blocks, selecting their codec
    pub compression_tag: u32,
}

impl UploadOptions {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            target_chunk_size: config.chunking.target_chunk_size,
            max_block_size: config.blocks.max_block_size,
            max_chunks_per_block: config.blocks.max_chunks_per_block,
            min_block_usage_percent: config.blocks.min_block_usage_percent,
            compression_tag: config.compression_tag()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub max_block_size: u32,
    pub max_chunks_per_block: u32,
    /// Decompressed blocks kept in memory; 0 disables
    pub lru_block_count: usize,
    pub retain_permissions: bool,
}

impl UpdateOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_block_size: config.blocks.max_block_size,
            max_chunks_per_block: config.blocks.max_chunks_per_block,
            lru_block_count: config.store.lru_block_count,
            retain_permissions: true,
        }
    }
}

/// Result of [`upload_version`]
#[derive(Debug, Clone)]
pub struct UploadedVersion {
    pub version: VersionIndex,
    /// Blocks that were written by this upload
    pub uploaded: StoreIndex,
}

/// Chunk tag given to each asset while indexing
struct AssetTags {
    by_path: AHashMap<String, u32>,
    default: u32,
}

impl AssetTags {
    fn uniform(tag: u32) -> Self {
        Self {
            by_path: AHashMap::new(),
            default: tag,
        }
    }

    /// Tags as `version` recorded them, so an unchanged install indexes equal to it
    fn from_version(version: &VersionIndex) -> Self {
        let mut by_path = AHashMap::with_capacity(version.asset_count());
        for asset in 0..version.asset_count() {
            if let Some(&chunk) = version.asset_chunk_indexes(asset).first() {
                by_path.insert(version.asset_path(asset).to_string(), version.chunk_tag(chunk as usize));
            }
        }
        let default = if version.chunk_count() > 0 { version.chunk_tag(0) } else { 0 };
        Self { by_path, default }
    }

    fn get(&self, path: &str) -> u32 {
        self.by_path.get(path).copied().unwrap_or(self.default)
    }
}

async fn scan_and_index(
    ctx: &FlowContext,
    hasher: Arc<dyn ContentHasher>,
    storage: Arc<dyn Storage>,
    root: &str,
    filter: Option<Arc<dyn PathFilter>>,
    target_chunk_size: u32,
    tags: AssetTags,
) -> Result<VersionIndex> {
    let jobs = ctx.jobs.clone();
    let progress = ctx.progress.clone();
    let cancel = ctx.cancel.clone();
    let root = root.to_string();
    tokio::task::spawn_blocking(with_current_dispatch(move || {
        let infos = get_files_recursively(storage.as_ref(), &root, filter.as_deref(), cancel.as_ref())?;
        debug!(root = %root, assets = infos.paths.len(), bytes = infos.total_size(), "scanned");
        let asset_tag = move |path: &str| tags.get(path);
        let options = VersionIndexOptions {
            target_chunk_size,
            asset_tag: Some(&asset_tag),
            progress: progress.as_deref(),
            cancel: cancel.as_ref(),
        };
        create_version_index(storage.as_ref(), hasher.as_ref(), &jobs, &root, &infos, &options)
    }))
    .await
    .map_err(|e| Error::io(format!("indexing task failed: {}", e)))?
}

/// Index the tree at `root` and put every chunk `block_store` lacks
///
/// New blocks carry `options.compression_tag` and are compressed on the
/// way into `block_store`.
#[tracing::instrument(skip_all, fields(root = %root))]
pub async fn upload_version(
    ctx: &FlowContext,
    storage: Arc<dyn Storage>,
    root: &str,
    filter: Option<Arc<dyn PathFilter>>,
    block_store: Arc<dyn BlockStore>,
    options: &UploadOptions,
) -> Result<UploadedVersion> {
    let version = scan_and_index(
        ctx,
        ctx.hasher.clone(),
        storage.clone(),
        root,
        filter,
        options.target_chunk_size,
        AssetTags::uniform(options.compression_tag),
    )
    .await?;
    ctx.check_cancel()?;

    let existing = block_store
        .get_existing_content(version.chunk_hashes(), options.min_block_usage_percent)
        .await?;
    let missing = create_missing_content(
        ctx.hasher.as_ref(),
        &existing,
        &version,
        options.max_block_size,
        options.max_chunks_per_block,
    )?;
    debug!(
        reused_blocks = existing.block_count(),
        new_blocks = missing.block_count(),
        new_chunks = missing.chunk_count(),
        "planned upload"
    );

    let store = CompressBlockStore::new(block_store, CompressionRegistry::full());
    write_content(
        &store,
        storage,
        ctx.hasher.clone(),
        &missing,
        &version,
        root,
        ctx.jobs.worker_count(),
        ctx.progress.as_deref(),
        ctx.cancel.as_ref(),
    )
    .await?;
    info!(
        assets = version.asset_count(),
        chunks = version.chunk_count(),
        uploaded_blocks = missing.block_count(),
        "uploaded version"
    );
    Ok(UploadedVersion {
        version,
        uploaded: missing,
    })
}

/// Index what is installed at `path`, comparable with `target_version`
///
/// A missing `path` is an empty install.
#[tracing::instrument(skip_all, fields(path = %path))]
pub async fn get_current_version_index(
    ctx: &FlowContext,
    storage: Arc<dyn Storage>,
    path: &str,
    filter: Option<Arc<dyn PathFilter>>,
    target_version: &VersionIndex,
) -> Result<VersionIndex> {
    let identifier = target_version.hash_identifier();
    if identifier == 0 {
        return Err(Error::invalid("target version has no hash identifier"));
    }
    let hasher = ctx.registry.get(identifier)?;
    let target_chunk_size = target_version.target_chunk_size();
    if !storage.is_dir(path) {
        debug!("nothing installed");
        return Ok(VersionIndex::empty(identifier, target_chunk_size));
    }
    let tags = AssetTags::from_version(target_version);
    scan_and_index(ctx, hasher, storage, path, filter, target_chunk_size, tags).await
}

/// Chunks the writer will have to fetch to turn `diff`'s source into `target`
fn chunks_to_fetch(target: &VersionIndex, added: &[u32], modified: &[u32]) -> Vec<Hash> {
    let mut seen = AHashSet::new();
    added
        .iter()
        .chain(modified)
        .flat_map(|&asset| target.asset_chunk_indexes(asset as usize))
        .map(|&c| target.chunk_hash(c as usize))
        .filter(|h| seen.insert(*h))
        .collect()
}

/// Turn the install at `install_path` from `current` into `target`
///
/// Blocks come from `remote_store` through a local block cache at
/// `cache_path`. Returns the remote statistics after the update.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(install = %install_path, cache = %cache_path))]
pub async fn update_version(
    ctx: &FlowContext,
    cache_storage: Arc<dyn Storage>,
    cache_path: &str,
    remote_store: Arc<dyn BlockStore>,
    install_storage: Arc<dyn Storage>,
    install_path: &str,
    current: &VersionIndex,
    target: &VersionIndex,
    options: &UpdateOptions,
) -> Result<BlockStoreStats> {
    let hasher = ctx.registry.get(target.hash_identifier())?;
    let diff = create_version_diff(hasher.as_ref(), current, target)?;
    if diff.is_empty() {
        info!("install is up to date");
        return Ok(remote_store.get_stats());
    }

    let local = FsBlockStore::open(cache_storage, cache_path, options.max_block_size, options.max_chunks_per_block).await?;
    let cached: Arc<dyn BlockStore> = Arc::new(CacheBlockStore::new(Arc::new(local), remote_store.clone()));
    let mut store: Arc<dyn BlockStore> = Arc::new(CompressBlockStore::new(cached, CompressionRegistry::full()));
    if options.lru_block_count > 0 {
        store = Arc::new(LruBlockStore::new(store, options.lru_block_count));
    }
    let store: Arc<dyn BlockStore> = Arc::new(ShareBlockStore::new(store));

    let needed = chunks_to_fetch(target, &diff.target_added, &diff.target_content_modified);
    let store_index = store.get_existing_content(&needed, 0).await?;
    debug!(chunks = needed.len(), blocks = store_index.block_count(), "located content");

    let writer = ChangeVersionContext {
        block_store: store.clone(),
        storage: install_storage,
        hasher,
        worker_count: ctx.jobs.worker_count(),
        progress: ctx.progress.clone(),
        cancel: ctx.cancel.clone(),
    };
    change_version(
        &writer,
        &store_index,
        current,
        target,
        &diff,
        install_path,
        options.retain_permissions,
    )
    .await?;
    store.flush().await?;
    Ok(remote_store.get_stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::storage::{atomic_write, create_dir_all, read_all};
    use depot_core::{Blake3Hasher, ErrorKind, MemStorage};
    use depot_store::MemBlockStore;

    fn context() -> FlowContext {
        FlowContext {
            registry: Arc::new(HashRegistry::full()),
            hasher: Arc::new(Blake3Hasher),
            jobs: JobPool::new(2).unwrap(),
            progress: None,
            cancel: None,
        }
    }

    fn options() -> UploadOptions {
        UploadOptions {
            target_chunk_size: 256,
            max_block_size: 2048,
            max_chunks_per_block: 16,
            min_block_usage_percent: 0,
            compression_tag: depot_store::compress::ZSTD_DEFAULT,
        }
    }

    fn update_options() -> UpdateOptions {
        UpdateOptions {
            max_block_size: 2048,
            max_chunks_per_block: 16,
            lru_block_count: 4,
            retain_permissions: true,
        }
    }

    fn source_tree() -> MemStorage {
        let storage = MemStorage::new();
        create_dir_all(&storage, "src/bin").unwrap();
        atomic_write(&storage, "src/bin/tool", &b"compressible payload ".repeat(300)).unwrap();
        atomic_write(&storage, "src/notes.txt", b"hello").unwrap();
        storage
    }

    #[tokio::test]
    async fn test_second_upload_reuses_everything() {
        let ctx = context();
        let storage: Arc<dyn Storage> = Arc::new(source_tree());
        let remote = Arc::new(MemBlockStore::new());
        let first = upload_version(&ctx, storage.clone(), "src", None, remote.clone(), &options())
            .await
            .unwrap();
        assert!(first.uploaded.block_count() > 0);
        assert_eq!(remote.len(), first.uploaded.block_count());

        let second = upload_version(&ctx, storage, "src", None, remote.clone(), &options())
            .await
            .unwrap();
        assert!(second.uploaded.is_empty());
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn test_update_into_missing_install() {
        let ctx = context();
        let remote = Arc::new(MemBlockStore::new());
        let uploaded = upload_version(&ctx, Arc::new(source_tree()), "src", None, remote.clone(), &options())
            .await
            .unwrap();

        let install = MemStorage::new();
        let current = get_current_version_index(&ctx, Arc::new(install.clone()), "app", None, &uploaded.version)
            .await
            .unwrap();
        assert_eq!(current.asset_count(), 0);

        let cache = MemStorage::new();
        let stats = update_version(
            &ctx,
            Arc::new(cache.clone()),
            "cache",
            remote.clone(),
            Arc::new(install.clone()),
            "app",
            &current,
            &uploaded.version,
            &update_options(),
        )
        .await
        .unwrap();
        assert_eq!(stats.block_get_count, remote.len() as u64);
        assert_eq!(read_all(&install, "app/notes.txt").unwrap(), b"hello");
        assert_eq!(read_all(&install, "app/bin/tool").unwrap(), b"compressible payload ".repeat(300));
        assert!(cache.is_file("cache/store.lsi"));

        let now = get_current_version_index(&ctx, Arc::new(install), "app", None, &uploaded.version)
            .await
            .unwrap();
        assert_eq!(now, uploaded.version);
    }

    #[tokio::test]
    async fn test_unchanged_install_diffs_empty_against_tagged_upload() {
        let ctx = context();
        let storage = source_tree();
        let uploaded = upload_version(&ctx, Arc::new(storage.clone()), "src", None, Arc::new(MemBlockStore::new()), &options())
            .await
            .unwrap();
        let tool = uploaded.version.find_asset("bin/tool").unwrap();
        let first = uploaded.version.asset_chunk_indexes(tool)[0] as usize;
        assert_eq!(uploaded.version.chunk_tag(first), depot_store::compress::ZSTD_DEFAULT);

        // The source tree doubles as an install that already matches the upload
        let current = get_current_version_index(&ctx, Arc::new(storage), "src", None, &uploaded.version)
            .await
            .unwrap();
        assert_eq!(current, uploaded.version);
        let diff = create_version_diff(&Blake3Hasher, &current, &uploaded.version).unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_current_index_requires_hash_identifier() {
        let ctx = context();
        let target = VersionIndex::empty(0, 256);
        let err = get_current_version_index(&ctx, Arc::new(MemStorage::new()), "app", None, &target)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_upload_uses_filter() {
        let ctx = context();
        let storage = source_tree();
        atomic_write(&storage, "src/skip.tmp", b"scratch").unwrap();
        let filter: Arc<dyn PathFilter> = Arc::new(|path: &str, _is_dir: bool| !path.ends_with(".tmp"));
        let uploaded = upload_version(&ctx, Arc::new(storage), "src", Some(filter), Arc::new(MemBlockStore::new()), &options())
            .await
            .unwrap();
        assert!(uploaded.version.find_asset("skip.tmp").is_none());
        assert!(uploaded.version.find_asset("notes.txt").is_some());
    }
}
