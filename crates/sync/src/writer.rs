//! Applying a [`VersionDiff`] to an on-disk tree
//!
//! The order of operations is fixed:
//! 1. validate inputs and chunk availability
//! 2. remove assets, deepest first
//! 3. create directories, then write added and modified files
//! 4. set permissions of permission-only changes
//! 5. set directory permissions
//!
//! A failure aborts the operation and may leave the tree partially updated.

use ahash::AHashMap;
use bytes::Bytes;
use depot_core::ensure_invariant;
use depot_core::hash::to_hex;
use depot_core::storage::{create_dir_all, WriteHandle};
use depot_core::{
    with_current_dispatch, CancelToken, ContentHasher, Error, ErrorKind, Hash, Progress, ProgressTracker, Result,
    Storage, StoreIndex, StoredBlock, VersionDiff, VersionIndex,
};
use depot_store::BlockStore;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

const OWNER_WRITE: u16 = 0o200;

/// Collaborators of [`change_version`]
#[derive(Clone)]
pub struct ChangeVersionContext {
    pub block_store: Arc<dyn BlockStore>,
    pub storage: Arc<dyn Storage>,
    pub hasher: Arc<dyn ContentHasher>,
    /// Files written concurrently
    pub worker_count: usize,
    /// Reported in assets
    pub progress: Option<Arc<dyn Progress>>,
    pub cancel: Option<CancelToken>,
}

impl ChangeVersionContext {
    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }
}

/// Blocks fetched during one operation
///
/// Each block is fetched at most once. A block is released when the last
/// file that needs it has been written.
struct BlockCache {
    slots: Mutex<AHashMap<Hash, Slot>>,
}

struct Slot {
    cell: Arc<OnceCell<Arc<StoredBlock>>>,
    users: usize,
}

impl BlockCache {
    fn new(users: AHashMap<Hash, usize>) -> Self {
        let slots = users
            .into_iter()
            .map(|(hash, users)| {
                (
                    hash,
                    Slot {
                        cell: Arc::new(OnceCell::new()),
                        users,
                    },
                )
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    async fn get(&self, ctx: &ChangeVersionContext, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let cell = self
            .slots
            .lock()
            .get(&block_hash)
            .map(|slot| slot.cell.clone())
            .ok_or_else(|| Error::invalid(format!("block {} was not planned", to_hex(block_hash))))?;
        let block = cell
            .get_or_try_init(|| async {
                ctx.check_cancel()?;
                trace!(block = %to_hex(block_hash), "fetching block");
                ctx.block_store.get_stored_block(block_hash).await
            })
            .await?;
        Ok(block.clone())
    }

    fn release(&self, block_hash: Hash) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&block_hash) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(&block_hash);
            }
        }
    }

    fn resident(&self) -> usize {
        self.slots.lock().values().filter(|s| s.cell.initialized()).count()
    }
}

/// One chunk of a file to write
#[derive(Debug, Clone, Copy)]
struct Piece {
    chunk_hash: Hash,
    block_hash: Hash,
    chunk_in_block: usize,
    size: u32,
}

struct FilePlan {
    asset: usize,
    pieces: Vec<Piece>,
    /// Distinct blocks in first-use order
    blocks: Vec<Hash>,
    /// Position of the first block in the store index, for ordering
    first_block: usize,
}

fn check_range(list: &[u32], count: usize, what: &str) -> Result<()> {
    match list.iter().find(|&&i| i as usize >= count) {
        Some(i) => Err(Error::invalid(format!("{} asset {} out of range ({} assets)", what, i, count))),
        None => Ok(()),
    }
}

fn validate(
    ctx: &ChangeVersionContext,
    store_index: &StoreIndex,
    source: &VersionIndex,
    target: &VersionIndex,
    diff: &VersionDiff,
) -> Result<()> {
    if ctx.worker_count == 0 {
        return Err(Error::invalid("worker count must be non-zero"));
    }
    for (index, which) in [(source, "source"), (target, "target")] {
        if index.asset_count() > 0 && index.hash_identifier() != ctx.hasher.identifier() {
            return Err(Error::invalid(format!("{} index hash identifier does not match hasher", which)));
        }
    }
    if !store_index.is_empty() && store_index.hash_identifier() != ctx.hasher.identifier() {
        return Err(Error::invalid("store index hash identifier does not match hasher"));
    }
    if diff.source_content_modified.len() != diff.target_content_modified.len()
        || diff.source_permissions_modified.len() != diff.target_permissions_modified.len()
    {
        return Err(Error::invalid("diff modified lists are not paired"));
    }
    check_range(&diff.source_removed, source.asset_count(), "removed")?;
    check_range(&diff.source_content_modified, source.asset_count(), "modified")?;
    check_range(&diff.source_permissions_modified, source.asset_count(), "permission-modified")?;
    check_range(&diff.target_added, target.asset_count(), "added")?;
    check_range(&diff.target_content_modified, target.asset_count(), "modified")?;
    check_range(&diff.target_permissions_modified, target.asset_count(), "permission-modified")?;
    Ok(())
}

/// Map every chunk of the files to write onto a block of `store_index`
fn plan_files(store_index: &StoreIndex, target: &VersionIndex, assets: &[usize]) -> Result<Vec<FilePlan>> {
    let locations = store_index.chunk_locations();
    let mut plans = Vec::with_capacity(assets.len());
    let mut missing = 0usize;
    let mut first_missing = None;
    for &asset in assets {
        let mut pieces = Vec::with_capacity(target.asset_chunk_indexes(asset).len());
        let mut blocks: Vec<Hash> = Vec::new();
        let mut first_block = usize::MAX;
        for &c in target.asset_chunk_indexes(asset) {
            let chunk_hash = target.chunk_hash(c as usize);
            let Some(location) = locations.get(&chunk_hash) else {
                missing += 1;
                first_missing.get_or_insert(chunk_hash);
                continue;
            };
            let block_hash = store_index.block_hash(location.block);
            if !blocks.contains(&block_hash) {
                blocks.push(block_hash);
            }
            first_block = first_block.min(location.block);
            pieces.push(Piece {
                chunk_hash,
                block_hash,
                chunk_in_block: location.chunk_in_block,
                size: target.chunk_size(c as usize),
            });
        }
        plans.push(FilePlan {
            asset,
            pieces,
            blocks,
            first_block,
        });
    }
    if let Some(hash) = first_missing {
        return Err(Error::not_found(format!(
            "{} chunks needed by the target are not in the store, first {}",
            missing,
            to_hex(hash)
        )));
    }
    // Files sharing blocks are written close together
    plans.sort_by(|a, b| {
        a.first_block
            .cmp(&b.first_block)
            .then_with(|| target.asset_path(a.asset).cmp(target.asset_path(b.asset)))
    });
    Ok(plans)
}

fn chunk_bytes(block: &StoredBlock, piece: &Piece) -> Result<Bytes> {
    let index = match block.index.chunk_hashes.get(piece.chunk_in_block) {
        Some(&h) if h == piece.chunk_hash => piece.chunk_in_block,
        _ => block.find_chunk(piece.chunk_hash).ok_or_else(|| {
            Error::invalid(format!(
                "block {} does not hold chunk {}",
                to_hex(block.block_hash()),
                to_hex(piece.chunk_hash)
            ))
        })?,
    };
    let data = block.chunk_data(index)?;
    if data.len() != piece.size as usize {
        return Err(Error::invalid(format!("chunk {} has the wrong size", to_hex(piece.chunk_hash))));
    }
    Ok(data)
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(with_current_dispatch(work))
        .await
        .map_err(|e| Error::io(format!("blocking task failed: {}", e)))?
}

/// Make `path` writable by its owner
fn make_writable(storage: &dyn Storage, path: &str) -> Result<()> {
    let permissions = storage.permissions(path)?;
    storage.set_permissions(path, permissions | OWNER_WRITE)
}

fn open_for_write(storage: &dyn Storage, path: &str) -> Result<Box<dyn WriteHandle>> {
    match storage.open_write(path) {
        Err(e) if e.kind() == ErrorKind::PermissionDenied && storage.is_file(path) => {
            make_writable(storage, path)?;
            storage.open_write(path)
        }
        other => other,
    }
}

fn remove_asset(storage: &dyn Storage, path: &str, is_dir: bool) -> Result<()> {
    let remove = |p: &str| if is_dir { storage.remove_dir(p) } else { storage.remove_file(p) };
    match remove(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path, "already removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            make_writable(storage, path)?;
            remove(path)
        }
        Err(e) => Err(e),
    }
}

async fn write_file(
    ctx: &ChangeVersionContext,
    cache: &BlockCache,
    target: &VersionIndex,
    plan: &FilePlan,
    full_path: String,
    permissions: Option<u16>,
) -> Result<()> {
    ctx.check_cancel()?;
    let storage = ctx.storage.clone();
    let path = full_path.clone();
    let mut handle = blocking(move || {
        if let Some(parent) = storage.parent(&path) {
            create_dir_all(storage.as_ref(), &parent)?;
        }
        open_for_write(storage.as_ref(), &path)
    })
    .await?;

    // Write runs of consecutive chunks from the same block
    let mut offset = 0u64;
    let mut start = 0;
    while start < plan.pieces.len() {
        let block_hash = plan.pieces[start].block_hash;
        let end = plan.pieces[start..]
            .iter()
            .position(|p| p.block_hash != block_hash)
            .map_or(plan.pieces.len(), |n| start + n);
        let block = cache.get(ctx, block_hash).await?;
        let run = plan.pieces[start..end]
            .iter()
            .map(|piece| chunk_bytes(&block, piece))
            .collect::<Result<Vec<Bytes>>>()?;
        let run_len: u64 = run.iter().map(|b| b.len() as u64).sum();
        handle = blocking(move || {
            let mut at = offset;
            for data in &run {
                handle.write_at(at, data)?;
                at += data.len() as u64;
            }
            Ok(handle)
        })
        .await?;
        offset += run_len;
        start = end;
    }
    ensure_invariant!(offset == target.asset_size(plan.asset));

    let storage = ctx.storage.clone();
    blocking(move || {
        handle.set_len(offset)?;
        handle.flush()?;
        drop(handle);
        if let Some(permissions) = permissions {
            storage.set_permissions(&full_path, permissions)?;
        }
        Ok(())
    })
    .await?;

    for &block_hash in &plan.blocks {
        cache.release(block_hash);
    }
    Ok(())
}

/// Turn the tree at `version_path` from `source` into `target`
///
/// `store_index` must list every chunk of the added and content-modified
/// files of `target`; otherwise nothing is touched and `NotFound` is
/// returned. Progress counts assets; cancellation is checked between assets
/// and between block fetches.
#[tracing::instrument(skip_all, fields(path = %version_path, changes = diff.change_count()))]
pub async fn change_version(
    ctx: &ChangeVersionContext,
    store_index: &StoreIndex,
    source: &VersionIndex,
    target: &VersionIndex,
    diff: &VersionDiff,
    version_path: &str,
    retain_permissions: bool,
) -> Result<()> {
    validate(ctx, store_index, source, target, diff)?;

    let mut dirs_to_create = Vec::new();
    let mut files_to_write = Vec::new();
    for &asset in &diff.target_added {
        if target.is_dir(asset as usize) {
            dirs_to_create.push(asset as usize);
        } else {
            files_to_write.push(asset as usize);
        }
    }
    files_to_write.extend(diff.target_content_modified.iter().map(|&a| a as usize));
    let plans = plan_files(store_index, target, &files_to_write)?;

    let total = (diff.source_removed.len()
        + diff.target_added.len()
        + diff.target_content_modified.len()
        + diff.target_permissions_modified.len()) as u64;
    let tracker = ProgressTracker::new(ctx.progress.as_deref(), total);
    let full = |index: &VersionIndex, asset: usize| {
        ctx.storage
            .join(version_path, index.asset_path(asset).trim_end_matches('/'))
    };

    // Removals, deepest first
    for &asset in &diff.source_removed {
        ctx.check_cancel()?;
        let asset = asset as usize;
        let path = full(source, asset);
        let is_dir = source.is_dir(asset);
        let storage = ctx.storage.clone();
        blocking(move || remove_asset(storage.as_ref(), &path, is_dir)).await?;
        tracker.advance(1);
    }

    // Directories, parents first
    if !plans.is_empty() || !dirs_to_create.is_empty() {
        ctx.check_cancel()?;
        let storage = ctx.storage.clone();
        let mut paths = vec![version_path.to_string()];
        paths.extend(dirs_to_create.iter().map(|&a| full(target, a)));
        blocking(move || {
            for path in &paths {
                create_dir_all(storage.as_ref(), path)?;
            }
            Ok(())
        })
        .await?;
        tracker.advance(dirs_to_create.len() as u64);
    }

    // Files
    let mut users: AHashMap<Hash, usize> = AHashMap::new();
    for plan in &plans {
        for &block_hash in &plan.blocks {
            *users.entry(block_hash).or_default() += 1;
        }
    }
    let needed: Vec<Hash> = {
        let mut seen = ahash::AHashSet::new();
        plans
            .iter()
            .flat_map(|p| p.pieces.iter().map(|piece| piece.chunk_hash))
            .filter(|h| seen.insert(*h))
            .collect()
    };
    if !needed.is_empty() {
        match ctx.block_store.preflight_get(&needed).await {
            Ok(pursued) => debug!(needed = needed.len(), pursued = pursued.len(), "preflight"),
            Err(e) => warn!(error = %e, "preflight failed"),
        }
    }
    let block_count = users.len();
    let cache = BlockCache::new(users);
    let cache = &cache;
    let tracker_ref = &tracker;
    stream::iter(plans.iter().map(Ok::<_, Error>))
        .map_ok(|plan| {
            let permissions = retain_permissions.then(|| target.asset_permissions(plan.asset));
            let path = full(target, plan.asset);
            async move {
                write_file(ctx, cache, target, plan, path, permissions).await?;
                tracker_ref.advance(1);
                Ok::<(), Error>(())
            }
            .boxed()
        })
        .try_buffer_unordered(ctx.worker_count)
        .boxed()
        .try_collect::<()>()
        .await?;
    ensure_invariant!(cache.resident() == 0);

    // Permission-only changes; directories wait for the last step
    let mut dir_permissions: Vec<usize> = Vec::new();
    for &asset in &diff.target_permissions_modified {
        ctx.check_cancel()?;
        let asset = asset as usize;
        if target.is_dir(asset) {
            dir_permissions.push(asset);
        } else if retain_permissions {
            let storage = ctx.storage.clone();
            let path = full(target, asset);
            let permissions = target.asset_permissions(asset);
            blocking(move || storage.set_permissions(&path, permissions)).await?;
        }
        tracker.advance(1);
    }

    if retain_permissions {
        dir_permissions.extend(dirs_to_create.iter().copied());
        // Children before parents
        dir_permissions.sort_by(|&a, &b| target.asset_path(b).cmp(target.asset_path(a)));
        let storage = ctx.storage.clone();
        let updates: Vec<(String, u16)> = dir_permissions
            .iter()
            .map(|&a| (full(target, a), target.asset_permissions(a)))
            .collect();
        blocking(move || {
            for (path, permissions) in &updates {
                storage.set_permissions(path, *permissions)?;
            }
            Ok(())
        })
        .await?;
    }

    info!(
        removed = diff.source_removed.len(),
        written = plans.len(),
        blocks = block_count,
        "changed version"
    );
    Ok(())
}
