//! Snapshot of a directory tree in chunk terms
//!
//! A [`VersionIndex`] is a flat arena: per-asset and per-chunk parallel
//! arrays, with asset `i` referencing
//! `asset_chunk_indexes[asset_chunk_index_starts[i] ..][.. asset_chunk_counts[i]]`
//! in the deduplicated chunk table.
//!
//! Binary layout (`DVI1`, little-endian):
//! ```text
//! magic "DVI1"
//! hash_identifier u32, target_chunk_size u32
//! asset_count u32, chunk_count u32, asset_chunk_index_count u32, name_data_len u32
//! path_hashes [u64; A], content_hashes [u64; A], asset_sizes [u64; A]
//! permissions [u16; A], name_offsets [u32; A]
//! asset_chunk_counts [u32; A], asset_chunk_index_starts [u32; A]
//! asset_chunk_indexes [u32; I]
//! chunk_hashes [u64; C], chunk_sizes [u32; C], chunk_tags [u32; C]
//! name_data [u8; N]   (NUL terminated paths)
//! ```

use crate::chunker::{Chunker, ChunkerParams};
use crate::error::{Error, Result};
use crate::hash::{ContentHasher, Hash};
use crate::job::{CancelToken, JobPool, Progress, ProgressTracker};
use crate::scan::FileInfos;
use crate::storage::{atomic_write, read_all, ReadHandle, Storage};
use crate::wire::{put_u16s, put_u32s, put_u64s, Reader};
use ahash::AHashMap;
use bytes::BufMut;
use std::io::Read;

const MAGIC: &[u8; 4] = b"DVI1";

/// Flat inventory of assets and their chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionIndex {
    hash_identifier: u32,
    target_chunk_size: u32,
    path_hashes: Vec<Hash>,
    content_hashes: Vec<Hash>,
    asset_sizes: Vec<u64>,
    permissions: Vec<u16>,
    name_offsets: Vec<u32>,
    asset_chunk_counts: Vec<u32>,
    asset_chunk_index_starts: Vec<u32>,
    asset_chunk_indexes: Vec<u32>,
    chunk_hashes: Vec<Hash>,
    chunk_sizes: Vec<u32>,
    chunk_tags: Vec<u32>,
    name_data: Vec<u8>,
}

impl VersionIndex {
    /// Index with no assets
    pub fn empty(hash_identifier: u32, target_chunk_size: u32) -> Self {
        VersionIndexBuilder::new(hash_identifier, target_chunk_size).finish()
    }

    pub fn hash_identifier(&self) -> u32 {
        self.hash_identifier
    }

    pub fn target_chunk_size(&self) -> u32 {
        self.target_chunk_size
    }

    pub fn asset_count(&self) -> usize {
        self.path_hashes.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    pub fn asset_path(&self, asset: usize) -> &str {
        let start = self.name_offsets[asset] as usize;
        let tail = &self.name_data[start..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        // Names are validated as UTF-8 on construction and on read
        std::str::from_utf8(&tail[..end]).unwrap_or_default()
    }

    pub fn asset_path_hash(&self, asset: usize) -> Hash {
        self.path_hashes[asset]
    }

    /// Hash over the asset's chunk hash sequence (0 for directories)
    pub fn asset_content_hash(&self, asset: usize) -> Hash {
        self.content_hashes[asset]
    }

    pub fn asset_size(&self, asset: usize) -> u64 {
        self.asset_sizes[asset]
    }

    pub fn asset_permissions(&self, asset: usize) -> u16 {
        self.permissions[asset]
    }

    pub fn is_dir(&self, asset: usize) -> bool {
        self.asset_path(asset).ends_with('/')
    }

    /// Chunk table indexes of an asset, in byte order
    pub fn asset_chunk_indexes(&self, asset: usize) -> &[u32] {
        let start = self.asset_chunk_index_starts[asset] as usize;
        let count = self.asset_chunk_counts[asset] as usize;
        &self.asset_chunk_indexes[start..start + count]
    }

    /// Chunk hashes of an asset, in byte order
    pub fn asset_chunk_hashes(&self, asset: usize) -> impl Iterator<Item = Hash> + '_ {
        self.asset_chunk_indexes(asset)
            .iter()
            .map(move |&c| self.chunk_hashes[c as usize])
    }

    pub fn chunk_hash(&self, chunk: usize) -> Hash {
        self.chunk_hashes[chunk]
    }

    pub fn chunk_size(&self, chunk: usize) -> u32 {
        self.chunk_sizes[chunk]
    }

    pub fn chunk_tag(&self, chunk: usize) -> u32 {
        self.chunk_tags[chunk]
    }

    /// Deduplicated chunk hashes
    pub fn chunk_hashes(&self) -> &[Hash] {
        &self.chunk_hashes
    }

    pub fn find_asset(&self, path: &str) -> Option<usize> {
        (0..self.asset_count()).find(|&i| self.asset_path(i) == path)
    }

    /// Chunk hashes in asset order, first occurrence only
    pub fn chunk_hashes_in_asset_order(&self) -> Vec<Hash> {
        let mut seen = vec![false; self.chunk_count()];
        let mut out = Vec::with_capacity(self.chunk_count());
        for &c in &self.asset_chunk_indexes {
            if !std::mem::replace(&mut seen[c as usize], true) {
                out.push(self.chunk_hashes[c as usize]);
            }
        }
        out
    }

    /// Serialize to the flat `DVI1` layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let assets = self.asset_count();
        let mut out = Vec::with_capacity(
            28 + assets * 38 + self.asset_chunk_indexes.len() * 4 + self.chunk_count() * 16 + self.name_data.len(),
        );
        out.put_slice(MAGIC);
        out.put_u32_le(self.hash_identifier);
        out.put_u32_le(self.target_chunk_size);
        out.put_u32_le(assets as u32);
        out.put_u32_le(self.chunk_count() as u32);
        out.put_u32_le(self.asset_chunk_indexes.len() as u32);
        out.put_u32_le(self.name_data.len() as u32);
        put_u64s(&mut out, &self.path_hashes);
        put_u64s(&mut out, &self.content_hashes);
        put_u64s(&mut out, &self.asset_sizes);
        put_u16s(&mut out, &self.permissions);
        put_u32s(&mut out, &self.name_offsets);
        put_u32s(&mut out, &self.asset_chunk_counts);
        put_u32s(&mut out, &self.asset_chunk_index_starts);
        put_u32s(&mut out, &self.asset_chunk_indexes);
        put_u64s(&mut out, &self.chunk_hashes);
        put_u32s(&mut out, &self.chunk_sizes);
        put_u32s(&mut out, &self.chunk_tags);
        out.put_slice(&self.name_data);
        out
    }

    /// Parse a `DVI1` buffer; short, trailing or inconsistent data is rejected
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "version index");
        r.magic(MAGIC)?;
        let hash_identifier = r.u32()?;
        let target_chunk_size = r.u32()?;
        let assets = r.u32()? as usize;
        let chunks = r.u32()? as usize;
        let index_count = r.u32()? as usize;
        let name_len = r.u32()? as usize;

        let index = Self {
            hash_identifier,
            target_chunk_size,
            path_hashes: r.u64s(assets)?,
            content_hashes: r.u64s(assets)?,
            asset_sizes: r.u64s(assets)?,
            permissions: r.u16s(assets)?,
            name_offsets: r.u32s(assets)?,
            asset_chunk_counts: r.u32s(assets)?,
            asset_chunk_index_starts: r.u32s(assets)?,
            asset_chunk_indexes: r.u32s(index_count)?,
            chunk_hashes: r.u64s(chunks)?,
            chunk_sizes: r.u32s(chunks)?,
            chunk_tags: r.u32s(chunks)?,
            name_data: r.bytes(name_len)?.to_vec(),
        };
        r.finish()?;
        index.validate()?;
        Ok(index)
    }

    /// Check the cross references of the arena
    pub fn validate(&self) -> Result<()> {
        let chunk_count = self.chunk_count();
        for asset in 0..self.asset_count() {
            let start = self.asset_chunk_index_starts[asset] as usize;
            let count = self.asset_chunk_counts[asset] as usize;
            if start + count > self.asset_chunk_indexes.len() {
                return Err(Error::invalid(format!("asset {} chunk range out of bounds", asset)));
            }
            let offset = self.name_offsets[asset] as usize;
            let Some(tail) = self.name_data.get(offset..) else {
                return Err(Error::invalid(format!("asset {} name offset out of bounds", asset)));
            };
            let end = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::invalid(format!("asset {} name is not terminated", asset)))?;
            std::str::from_utf8(&tail[..end])
                .map_err(|_| Error::invalid(format!("asset {} name is not UTF-8", asset)))?;

            let mut total = 0u64;
            for &c in &self.asset_chunk_indexes[start..start + count] {
                let c = c as usize;
                if c >= chunk_count {
                    return Err(Error::invalid(format!("asset {} references chunk {} of {}", asset, c, chunk_count)));
                }
                total += u64::from(self.chunk_sizes[c]);
            }
            if total != self.asset_sizes[asset] {
                return Err(Error::invalid(format!(
                    "asset {} size {} does not match chunk total {}",
                    asset, self.asset_sizes[asset], total
                )));
            }
        }
        Ok(())
    }
}

/// One chunk reference passed to [`VersionIndexBuilder::add_asset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub hash: Hash,
    pub size: u32,
    pub tag: u32,
}

/// Appends assets and deduplicates their chunks
pub struct VersionIndexBuilder {
    index: VersionIndex,
    chunk_lookup: AHashMap<Hash, u32>,
}

impl VersionIndexBuilder {
    pub fn new(hash_identifier: u32, target_chunk_size: u32) -> Self {
        Self {
            index: VersionIndex {
                hash_identifier,
                target_chunk_size,
                path_hashes: Vec::new(),
                content_hashes: Vec::new(),
                asset_sizes: Vec::new(),
                permissions: Vec::new(),
                name_offsets: Vec::new(),
                asset_chunk_counts: Vec::new(),
                asset_chunk_index_starts: Vec::new(),
                asset_chunk_indexes: Vec::new(),
                chunk_hashes: Vec::new(),
                chunk_sizes: Vec::new(),
                chunk_tags: Vec::new(),
                name_data: Vec::new(),
            },
            chunk_lookup: AHashMap::new(),
        }
    }

    /// Append an asset; directory paths end with `/` and carry no chunks
    pub fn add_asset(
        &mut self,
        hasher: &dyn ContentHasher,
        path: &str,
        permissions: u16,
        chunks: &[ChunkRef],
    ) -> Result<()> {
        if path.contains('\0') {
            return Err(Error::invalid(format!("asset path contains NUL: {:?}", path)));
        }
        let is_dir = path.ends_with('/');
        if is_dir && !chunks.is_empty() {
            return Err(Error::invalid(format!("directory {} cannot hold chunks", path)));
        }
        if hasher.identifier() != self.index.hash_identifier {
            return Err(Error::invalid("hasher does not match index hash identifier"));
        }

        let idx = &mut self.index;
        idx.path_hashes.push(hasher.hash(path.as_bytes()));
        idx.name_offsets.push(idx.name_data.len() as u32);
        idx.name_data.extend_from_slice(path.as_bytes());
        idx.name_data.push(0);
        idx.permissions.push(permissions);
        idx.asset_chunk_index_starts.push(idx.asset_chunk_indexes.len() as u32);
        idx.asset_chunk_counts.push(chunks.len() as u32);

        let mut size = 0u64;
        let mut sequence = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let next = idx.chunk_hashes.len() as u32;
            let slot = *self.chunk_lookup.entry(chunk.hash).or_insert_with(|| {
                idx.chunk_hashes.push(chunk.hash);
                idx.chunk_sizes.push(chunk.size);
                idx.chunk_tags.push(chunk.tag);
                next
            });
            idx.asset_chunk_indexes.push(slot);
            size += u64::from(chunk.size);
            sequence.push(chunk.hash);
        }
        idx.asset_sizes.push(size);
        idx.content_hashes.push(if is_dir { 0 } else { hasher.hash_hashes(&sequence) });
        Ok(())
    }

    pub fn finish(self) -> VersionIndex {
        self.index
    }
}

/// Options for [`create_version_index`]
pub struct VersionIndexOptions<'a> {
    pub target_chunk_size: u32,
    /// Compression tag per asset path; chunks default to tag 0
    pub asset_tag: Option<&'a (dyn Fn(&str) -> u32 + Sync)>,
    /// Reported in bytes
    pub progress: Option<&'a dyn Progress>,
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> VersionIndexOptions<'a> {
    pub fn new(target_chunk_size: u32) -> Self {
        Self {
            target_chunk_size,
            asset_tag: None,
            progress: None,
            cancel: None,
        }
    }
}

/// Adapts a [`ReadHandle`] to `std::io::Read`
struct HandleReader {
    handle: Box<dyn ReadHandle>,
    offset: u64,
    size: u64,
}

impl Read for HandleReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let left = self.size - self.offset;
        let n = (buf.len() as u64).min(left) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.handle
            .read_at(self.offset, &mut buf[..n])
            .map_err(Error::into_io)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Build a [`VersionIndex`] for the files listed in `file_infos`
///
/// Files are chunked and hashed in parallel on `jobs`; each job returns its
/// own chunk list and the chunk table is merged in `file_infos` order, so the
/// result does not depend on scheduling. Any failure discards all work.
#[tracing::instrument(skip_all, fields(root = %root, assets = file_infos.len()))]
pub fn create_version_index(
    storage: &dyn Storage,
    hasher: &dyn ContentHasher,
    jobs: &JobPool,
    root: &str,
    file_infos: &FileInfos,
    options: &VersionIndexOptions<'_>,
) -> Result<VersionIndex> {
    let params = ChunkerParams::from_target(options.target_chunk_size)?;
    let chunker = Chunker::new(params);
    let tracker = ProgressTracker::new(options.progress, file_infos.total_size());
    if let Some(token) = options.cancel {
        token.check()?;
    }

    let assets: Vec<usize> = (0..file_infos.len()).collect();
    let per_asset = jobs.run(&assets, options.cancel, |_, &i| {
        let path = &file_infos.paths[i];
        if path.ends_with('/') {
            return Ok(Vec::new());
        }
        let tag = options.asset_tag.map(|f| f(path)).unwrap_or(0);
        let full_path = storage.join(root, path);
        let handle = storage.open_read(&full_path)?;
        let size = handle.size();
        if size != file_infos.sizes[i] {
            return Err(Error::io(format!(
                "{} changed size during indexing ({} -> {})",
                path, file_infos.sizes[i], size
            )));
        }

        let reader = HandleReader { handle, offset: 0, size };
        let mut chunks = Vec::with_capacity((size / u64::from(options.target_chunk_size)) as usize + 1);
        for chunk in chunker.chunks(reader) {
            if let Some(token) = options.cancel {
                token.check()?;
            }
            let chunk = chunk?;
            chunks.push(ChunkRef {
                hash: hasher.hash(&chunk.data),
                size: chunk.data.len() as u32,
                tag,
            });
            tracker.advance(chunk.data.len() as u64);
        }
        Ok(chunks)
    })?;

    let mut builder = VersionIndexBuilder::new(hasher.identifier(), options.target_chunk_size);
    for (i, chunks) in per_asset.iter().enumerate() {
        builder.add_asset(hasher, &file_infos.paths[i], file_infos.permissions[i], chunks)?;
    }
    let index = builder.finish();
    tracing::info!(
        assets = index.asset_count(),
        chunks = index.chunk_count(),
        "built version index"
    );
    Ok(index)
}

pub fn write_version_index(storage: &dyn Storage, path: &str, index: &VersionIndex) -> Result<()> {
    atomic_write(storage, path, &index.to_bytes())
}

pub fn read_version_index(storage: &dyn Storage, path: &str) -> Result<VersionIndex> {
    VersionIndex::from_bytes(&read_all(storage, path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Blake3Hasher;
    use crate::scan::get_files_recursively;
    use crate::storage::MemStorage;
    use crate::ErrorKind;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn write_file(storage: &MemStorage, path: &str, data: &[u8]) {
        storage.open_write(path).unwrap().write_at(0, data).unwrap();
    }

    fn sample_tree() -> MemStorage {
        let storage = MemStorage::new();
        storage.create_dir("v").unwrap();
        storage.create_dir("v/dir").unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut big = vec![0u8; 20_000];
        rng.fill_bytes(&mut big);
        write_file(&storage, "v/empty", b"");
        write_file(&storage, "v/dir/big", &big);
        write_file(&storage, "v/dir/copy", &big);
        storage
    }

    fn build(storage: &MemStorage) -> VersionIndex {
        let infos = get_files_recursively(storage, "v", None, None).unwrap();
        let jobs = JobPool::new(3).unwrap();
        create_version_index(storage, &Blake3Hasher, &jobs, "v", &infos, &VersionIndexOptions::new(1024)).unwrap()
    }

    #[test]
    fn test_build_dedups_identical_files() {
        let storage = sample_tree();
        let index = build(&storage);
        assert_eq!(index.asset_count(), 4);
        let big = index.find_asset("dir/big").unwrap();
        let copy = index.find_asset("dir/copy").unwrap();
        assert_eq!(index.asset_chunk_indexes(big), index.asset_chunk_indexes(copy));
        assert_eq!(index.asset_content_hash(big), index.asset_content_hash(copy));
        assert_eq!(index.asset_size(big), 20_000);

        let dir = index.find_asset("dir/").unwrap();
        assert!(index.is_dir(dir));
        assert_eq!(index.asset_chunk_indexes(dir).len(), 0);

        let empty = index.find_asset("empty").unwrap();
        assert_eq!(index.asset_size(empty), 0);
        index.validate().unwrap();
    }

    #[test]
    fn test_build_is_deterministic_across_worker_counts() {
        let storage = sample_tree();
        let infos = get_files_recursively(&storage, "v", None, None).unwrap();
        let options = VersionIndexOptions::new(512);
        let a = create_version_index(&storage, &Blake3Hasher, &JobPool::new(1).unwrap(), "v", &infos, &options).unwrap();
        let b = create_version_index(&storage, &Blake3Hasher, &JobPool::new(8).unwrap(), "v", &infos, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_roundtrip_bytes_and_storage() {
        let storage = sample_tree();
        let index = build(&storage);
        let bytes = index.to_bytes();
        let decoded = VersionIndex::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.to_bytes(), bytes);

        write_version_index(&storage, "v.dvi", &index).unwrap();
        assert_eq!(read_version_index(&storage, "v.dvi").unwrap(), index);
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let storage = sample_tree();
        let bytes = build(&storage).to_bytes();
        for len in [0, 3, 10, bytes.len() / 2, bytes.len() - 1] {
            let err = VersionIndex::from_bytes(&bytes[..len]).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "len {}", len);
        }
        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(VersionIndex::from_bytes(&trailing).is_err());
    }

    #[test]
    fn test_missing_file_aborts_build() {
        let storage = sample_tree();
        let mut infos = get_files_recursively(&storage, "v", None, None).unwrap();
        infos.push("ghost".to_string(), 10, 0o644);
        let err = create_version_index(
            &storage,
            &Blake3Hasher,
            &JobPool::new(2).unwrap(),
            "v",
            &infos,
            &VersionIndexOptions::new(1024),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    struct FailingHandle(Error);

    impl ReadHandle for FailingHandle {
        fn size(&self) -> u64 {
            4096
        }

        fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> Result<()> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn test_read_errors_keep_their_kind_through_chunker() {
        let chunker = Chunker::new(ChunkerParams::from_target(512).unwrap());
        for error in [Error::Cancelled, Error::not_found("v/gone")] {
            let kind = error.kind();
            let reader = HandleReader {
                handle: Box::new(FailingHandle(error)),
                offset: 0,
                size: 4096,
            };
            let err = chunker.chunks(reader).find_map(|c| c.err()).unwrap();
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_zero_target_chunk_size_rejected() {
        let storage = sample_tree();
        let infos = get_files_recursively(&storage, "v", None, None).unwrap();
        let err = create_version_index(
            &storage,
            &Blake3Hasher,
            &JobPool::new(2).unwrap(),
            "v",
            &infos,
            &VersionIndexOptions::new(0),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_asset_tag_applies_to_chunks() {
        let storage = sample_tree();
        let infos = get_files_recursively(&storage, "v", None, None).unwrap();
        let tag = |path: &str| if path.starts_with("dir/") { 7 } else { 0 };
        let mut options = VersionIndexOptions::new(1024);
        options.asset_tag = Some(&tag);
        let index =
            create_version_index(&storage, &Blake3Hasher, &JobPool::new(2).unwrap(), "v", &infos, &options).unwrap();
        let big = index.find_asset("dir/big").unwrap();
        for &c in index.asset_chunk_indexes(big) {
            assert_eq!(index.chunk_tag(c as usize), 7);
        }
    }
}
