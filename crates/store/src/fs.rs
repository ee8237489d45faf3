//! Block store on a [`Storage`] backend
//!
//! Layout under the store root:
//! ```text
//! store.lsi              committed store index
//! store.lsi.lock         held while the index is rewritten
//! chunks/<hhhh>/0x<hash>.lrb
//! ```
//! `<hhhh>` is the first four hex digits of the block hash.

use crate::stats::{BlockStoreStats, StoreCounters};
use crate::{run_blocking, BlockStore};
use async_trait::async_trait;
use depot_core::hash::to_hex;
use depot_core::storage::{atomic_write, create_dir_all, join_path, read_all};
use depot_core::store_index::{self, merge, prune, read_store_index, write_store_index};
use depot_core::{BlockIndex, Error, ErrorKind, Hash, Result, Storage, StoreIndex, StoredBlock};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "store.lsi";
const LOCK_FILE: &str = "store.lsi.lock";
const CHUNKS_DIR: &str = "chunks";
const BLOCK_EXTENSION: &str = ".lrb";

pub fn block_path(root: &str, block_hash: Hash) -> String {
    let hex = to_hex(block_hash);
    join_path(&join_path(root, CHUNKS_DIR), &format!("{}/{}{}", &hex[2..6], hex, BLOCK_EXTENSION))
}

struct Inner {
    storage: Arc<dyn Storage>,
    root: String,
    committed: RwLock<StoreIndex>,
    added: Mutex<Vec<BlockIndex>>,
    pending: AtomicUsize,
    idle: Notify,
    counters: StoreCounters,
}

impl Inner {
    fn current_index(&self) -> Result<StoreIndex> {
        let committed = self.committed.read().clone();
        let added = self.added.lock();
        if added.is_empty() {
            return Ok(committed);
        }
        let fresh = StoreIndex::from_blocks(
            added[0].hash_identifier,
            committed.max_block_size(),
            committed.max_chunks_per_block(),
            &added,
        )?;
        merge(&committed, &fresh)
    }

    fn knows(&self, block_hash: Hash) -> bool {
        self.committed.read().find_block(block_hash).is_some()
            || self.added.lock().iter().any(|b| b.block_hash == block_hash)
    }

    fn write_block(&self, block: &StoredBlock) -> Result<()> {
        let path = block_path(&self.root, block.block_hash());
        if !self.storage.is_file(&path) {
            if let Some(parent) = self.storage.parent(&path) {
                create_dir_all(self.storage.as_ref(), &parent)?;
            }
            atomic_write(self.storage.as_ref(), &path, &block.to_bytes())?;
            self.counters.block_put(block);
        }
        let mut added = self.added.lock();
        if !added.iter().any(|b| b.block_hash == block.block_hash()) {
            added.push(block.index.clone());
        }
        Ok(())
    }

    fn read_block(&self, block_hash: Hash) -> Result<StoredBlock> {
        let path = block_path(&self.root, block_hash);
        let block = StoredBlock::from_bytes(&read_all(self.storage.as_ref(), &path)?)?;
        if block.block_hash() != block_hash {
            return Err(Error::invalid(format!(
                "{} holds block {}",
                path,
                to_hex(block.block_hash())
            )));
        }
        Ok(block)
    }

    /// Merge pending additions with whatever another writer committed
    fn commit(&self) -> Result<()> {
        let added: Vec<BlockIndex> = std::mem::take(&mut *self.added.lock());
        let result = self.commit_added(&added);
        if result.is_err() {
            self.added.lock().extend(added);
        }
        result
    }

    fn commit_added(&self, added: &[BlockIndex]) -> Result<()> {
        create_dir_all(self.storage.as_ref(), &self.root)?;
        let _lock = self.storage.lock_file(&join_path(&self.root, LOCK_FILE))?;
        let index_path = join_path(&self.root, INDEX_FILE);

        let mut committed = self.committed.write();
        let on_disk = if self.storage.is_file(&index_path) {
            read_store_index(self.storage.as_ref(), &index_path)?
        } else {
            committed.clone()
        };
        let mut next = merge(&on_disk, &committed)?;
        if let Some(first) = added.first() {
            let fresh = StoreIndex::from_blocks(
                first.hash_identifier,
                next.max_block_size(),
                next.max_chunks_per_block(),
                added,
            )?;
            next = merge(&next, &fresh)?;
        }
        write_store_index(self.storage.as_ref(), &index_path, &next)?;
        debug!(blocks = next.block_count(), added = added.len(), "committed store index");
        *committed = next;
        Ok(())
    }
}

/// Decrements the pending put count when the blocking write finishes
struct PendingPut(Arc<Inner>);

impl PendingPut {
    fn start(inner: &Arc<Inner>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self(inner.clone())
    }
}

impl Drop for PendingPut {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Durable block store over a [`Storage`]
///
/// Puts write block files immediately; the store index is rewritten on
/// [`flush`](BlockStore::flush) under an advisory lock, merged with any
/// index another writer committed in the meantime.
pub struct FsBlockStore {
    inner: Arc<Inner>,
}

impl FsBlockStore {
    /// Open or create a store at `root`
    ///
    /// Loads `store.lsi`; without one, the index is rebuilt from the block
    /// files found under `chunks/`.
    pub async fn open(
        storage: Arc<dyn Storage>,
        root: &str,
        max_block_size: u32,
        max_chunks_per_block: u32,
    ) -> Result<Self> {
        let root = root.trim_end_matches('/').to_string();
        let loaded = {
            let storage = storage.clone();
            let root = root.clone();
            run_blocking(move || load_index(storage.as_ref(), &root, max_block_size, max_chunks_per_block)).await?
        };
        info!(root = %root, blocks = loaded.block_count(), "opened block store");
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                root,
                committed: RwLock::new(loaded),
                added: Mutex::new(Vec::new()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                counters: StoreCounters::new(),
            }),
        })
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    /// Committed blocks plus puts not yet flushed
    pub fn store_index(&self) -> Result<StoreIndex> {
        self.inner.current_index()
    }
}

fn load_index(
    storage: &dyn Storage,
    root: &str,
    max_block_size: u32,
    max_chunks_per_block: u32,
) -> Result<StoreIndex> {
    let index_path = join_path(root, INDEX_FILE);
    if storage.is_file(&index_path) {
        return read_store_index(storage, &index_path);
    }
    let chunks = join_path(root, CHUNKS_DIR);
    let mut blocks = Vec::new();
    if storage.is_dir(&chunks) {
        let mut dirs = storage.list_dir(&chunks)?;
        dirs.sort_by(|a, b| a.name.cmp(&b.name));
        for dir in dirs.into_iter().filter(|d| d.is_dir) {
            let dir_path = join_path(&chunks, &dir.name);
            let mut files = storage.list_dir(&dir_path)?;
            files.sort_by(|a, b| a.name.cmp(&b.name));
            for file in files.into_iter().filter(|f| !f.is_dir && f.name.ends_with(BLOCK_EXTENSION)) {
                let path = join_path(&dir_path, &file.name);
                match read_all(storage, &path).and_then(|data| StoredBlock::from_bytes(&data)) {
                    Ok(block) => blocks.push(block.index),
                    Err(e) => warn!(path = %path, error = %e, "skipping unreadable block file"),
                }
            }
        }
    }
    let hash_identifier = blocks.first().map(|b| b.hash_identifier).unwrap_or(0);
    if !blocks.is_empty() {
        info!(root = %root, blocks = blocks.len(), "rebuilt store index from block files");
    }
    StoreIndex::from_blocks(hash_identifier, max_block_size, max_chunks_per_block, &blocks)
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        block.validate()?;
        if self.inner.knows(block.block_hash()) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let pending = PendingPut::start(&self.inner);
        run_blocking(move || {
            let _pending = pending;
            inner.write_block(&block)
        })
        .await
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.inner.counters.preflighted();
        let index = self.inner.current_index()?;
        Ok(chunk_hashes
            .iter()
            .copied()
            .filter(|h| index.contains_chunk(*h))
            .collect())
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let inner = self.inner.clone();
        let block = run_blocking(move || inner.read_block(block_hash)).await?;
        self.inner.counters.block_got(&block);
        Ok(Arc::new(block))
    }

    async fn get_existing_content(
        &self,
        chunk_hashes: &[Hash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        self.inner.counters.existing_content_queried();
        let index = self.inner.current_index()?;
        store_index::get_existing_content(&index, chunk_hashes, min_block_usage_percent)
    }

    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32> {
        self.flush().await?;
        self.inner.counters.pruned();
        let inner = self.inner.clone();
        let keep = keep_block_hashes.to_vec();
        run_blocking(move || {
            let _lock = inner.storage.lock_file(&join_path(&inner.root, LOCK_FILE))?;
            let mut committed = inner.committed.write();
            let mut removed = 0u32;
            for &hash in committed.block_hashes() {
                if keep.contains(&hash) {
                    continue;
                }
                match inner.storage.remove_file(&block_path(&inner.root, hash)) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            let next = prune(&committed, &keep);
            write_store_index(inner.storage.as_ref(), &join_path(&inner.root, INDEX_FILE), &next)?;
            info!(removed, kept = next.block_count(), "pruned block store");
            *committed = next;
            Ok(removed)
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }
        self.inner.counters.flushed();
        let inner = self.inner.clone();
        run_blocking(move || inner.commit()).await
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.inner.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{Blake3Hasher, FsStorage, MemStorage};

    fn block(payloads: &[&[u8]]) -> Arc<StoredBlock> {
        Arc::new(StoredBlock::from_chunks(&Blake3Hasher, 0, payloads))
    }

    #[test]
    fn test_block_path_layout() {
        let path = block_path("store", 0x0123_4567_89ab_cdef);
        assert_eq!(path, "store/chunks/0123/0x0123456789abcdef.lrb");
    }

    #[tokio::test]
    async fn test_put_flush_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new());

        let a = block(&[&b"one"[..], &b"two"[..]]);
        let b = block(&[&b"three"[..]]);
        {
            let store = FsBlockStore::open(storage.clone(), &root, 1024, 16).await.unwrap();
            store.put_stored_block(a.clone()).await.unwrap();
            store.put_stored_block(b.clone()).await.unwrap();
            store.put_stored_block(a.clone()).await.unwrap();
            store.flush().await.unwrap();
            assert_eq!(store.get_stats().block_put_count, 2);
        }

        let store = FsBlockStore::open(storage.clone(), &root, 1024, 16).await.unwrap();
        let index = store.store_index().unwrap();
        assert_eq!(index.block_hashes(), &[a.block_hash(), b.block_hash()]);
        let got = store.get_stored_block(b.block_hash()).await.unwrap();
        assert_eq!(&got.chunk_data(0).unwrap()[..], b"three");
    }

    #[tokio::test]
    async fn test_rebuilds_index_without_index_file() {
        let storage = MemStorage::new();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let a = block(&[&b"alpha"[..]]);
        {
            let store = FsBlockStore::open(shared.clone(), "remote", 1024, 16).await.unwrap();
            store.put_stored_block(a.clone()).await.unwrap();
        }
        assert!(!storage.is_file("remote/store.lsi"));
        let store = FsBlockStore::open(shared, "remote", 1024, 16).await.unwrap();
        assert_eq!(store.store_index().unwrap().block_hashes(), &[a.block_hash()]);
    }

    #[tokio::test]
    async fn test_missing_block_is_not_found() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let store = FsBlockStore::open(storage, "s", 1024, 16).await.unwrap();
        let err = store.get_stored_block(99).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_prune_removes_files() {
        let storage = MemStorage::new();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let store = FsBlockStore::open(shared, "s", 1024, 16).await.unwrap();
        let keep = block(&[&b"keep"[..]]);
        let gone = block(&[&b"gone"[..]]);
        store.put_stored_block(keep.clone()).await.unwrap();
        store.put_stored_block(gone.clone()).await.unwrap();

        assert_eq!(store.prune_blocks(&[keep.block_hash()]).await.unwrap(), 1);
        assert!(!storage.is_file(&block_path("s", gone.block_hash())));
        assert!(storage.is_file(&block_path("s", keep.block_hash())));
        assert_eq!(store.store_index().unwrap().block_hashes(), &[keep.block_hash()]);
    }

    #[tokio::test]
    async fn test_existing_content_sees_unflushed_puts() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let store = FsBlockStore::open(storage, "s", 1024, 16).await.unwrap();
        let a = block(&[&b"x"[..], &b"y"[..]]);
        store.put_stored_block(a.clone()).await.unwrap();
        let existing = store
            .get_existing_content(&[a.index.chunk_hashes[1]], 0)
            .await
            .unwrap();
        assert_eq!(existing.block_count(), 1);
    }
}
