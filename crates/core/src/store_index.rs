//! Inventory of a block store and the planning operations over it
//!
//! A [`StoreIndex`] lists blocks and, for each block, its chunk entries.
//! Indexes are values: merging, pruning and subsetting return new ones.
//!
//! Binary layout (`DSI1`, little-endian):
//! ```text
//! magic "DSI1"
//! hash_identifier u32, max_block_size u32, max_chunks_per_block u32
//! block_count u32, chunk_count u32
//! block_hashes [u64; B], block_tags [u32; B]
//! block_chunk_offsets [u32; B], block_chunk_counts [u32; B]
//! chunk_hashes [u64; C], chunk_sizes [u32; C]
//! ```

use crate::block::{block_hash, BlockIndex};
use crate::error::{Error, Result};
use crate::hash::{ContentHasher, Hash};
use crate::storage::{atomic_write, read_all, Storage};
use crate::version_index::VersionIndex;
use crate::wire::{put_u32s, put_u64s, Reader};
use ahash::{AHashMap, AHashSet};
use bytes::BufMut;
use smallvec::SmallVec;

const MAGIC: &[u8; 4] = b"DSI1";

/// Where a chunk lives inside a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Block position in the store index
    pub block: usize,
    /// Position of the chunk inside the block
    pub chunk_in_block: usize,
    /// Byte offset of the chunk inside the block payload
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreIndex {
    hash_identifier: u32,
    max_block_size: u32,
    max_chunks_per_block: u32,
    block_hashes: Vec<Hash>,
    block_tags: Vec<u32>,
    block_chunk_offsets: Vec<u32>,
    block_chunk_counts: Vec<u32>,
    chunk_hashes: Vec<Hash>,
    chunk_sizes: Vec<u32>,
}

impl StoreIndex {
    pub fn empty(hash_identifier: u32, max_block_size: u32, max_chunks_per_block: u32) -> Self {
        Self {
            hash_identifier,
            max_block_size,
            max_chunks_per_block,
            block_hashes: Vec::new(),
            block_tags: Vec::new(),
            block_chunk_offsets: Vec::new(),
            block_chunk_counts: Vec::new(),
            chunk_hashes: Vec::new(),
            chunk_sizes: Vec::new(),
        }
    }

    /// Index over already stored blocks, in the given order
    pub fn from_blocks(
        hash_identifier: u32,
        max_block_size: u32,
        max_chunks_per_block: u32,
        blocks: &[BlockIndex],
    ) -> Result<Self> {
        let mut index = Self::empty(hash_identifier, max_block_size, max_chunks_per_block);
        for block in blocks {
            if block.hash_identifier != hash_identifier {
                return Err(Error::invalid(format!(
                    "block {} uses hash identifier {:#x}, expected {:#x}",
                    crate::hash::to_hex(block.block_hash),
                    block.hash_identifier,
                    hash_identifier
                )));
            }
            index.push_block(block.block_hash, block.tag, &block.chunk_hashes, &block.chunk_sizes);
        }
        Ok(index)
    }

    fn push_block(&mut self, hash: Hash, tag: u32, chunk_hashes: &[Hash], chunk_sizes: &[u32]) {
        self.block_hashes.push(hash);
        self.block_tags.push(tag);
        self.block_chunk_offsets.push(self.chunk_hashes.len() as u32);
        self.block_chunk_counts.push(chunk_hashes.len() as u32);
        self.chunk_hashes.extend_from_slice(chunk_hashes);
        self.chunk_sizes.extend_from_slice(chunk_sizes);
    }

    fn copy_block_from(&mut self, other: &StoreIndex, block: usize) {
        self.push_block(
            other.block_hashes[block],
            other.block_tags[block],
            other.block_chunk_hashes(block),
            other.block_chunk_sizes(block),
        );
    }

    pub fn hash_identifier(&self) -> u32 {
        self.hash_identifier
    }

    pub fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    pub fn max_chunks_per_block(&self) -> u32 {
        self.max_chunks_per_block
    }

    pub fn block_count(&self) -> usize {
        self.block_hashes.len()
    }

    /// Number of chunk entries over all blocks (a chunk may be listed twice)
    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_hashes.is_empty()
    }

    pub fn block_hash(&self, block: usize) -> Hash {
        self.block_hashes[block]
    }

    pub fn block_hashes(&self) -> &[Hash] {
        &self.block_hashes
    }

    pub fn block_tag(&self, block: usize) -> u32 {
        self.block_tags[block]
    }

    fn block_range(&self, block: usize) -> std::ops::Range<usize> {
        let start = self.block_chunk_offsets[block] as usize;
        start..start + self.block_chunk_counts[block] as usize
    }

    pub fn block_chunk_hashes(&self, block: usize) -> &[Hash] {
        &self.chunk_hashes[self.block_range(block)]
    }

    pub fn block_chunk_sizes(&self, block: usize) -> &[u32] {
        &self.chunk_sizes[self.block_range(block)]
    }

    /// Payload size of a block
    pub fn block_size(&self, block: usize) -> u64 {
        self.block_chunk_sizes(block).iter().map(|&s| u64::from(s)).sum()
    }

    pub fn block_index(&self, block: usize) -> BlockIndex {
        BlockIndex {
            block_hash: self.block_hashes[block],
            hash_identifier: self.hash_identifier,
            tag: self.block_tags[block],
            chunk_hashes: self.block_chunk_hashes(block).to_vec(),
            chunk_sizes: self.block_chunk_sizes(block).to_vec(),
        }
    }

    pub fn find_block(&self, hash: Hash) -> Option<usize> {
        self.block_hashes.iter().position(|&h| h == hash)
    }

    /// First location of every chunk in the store
    pub fn chunk_locations(&self) -> AHashMap<Hash, ChunkLocation> {
        let mut map = AHashMap::with_capacity(self.chunk_hashes.len());
        for block in 0..self.block_count() {
            let mut offset = 0u64;
            let range = self.block_range(block);
            for (i, c) in range.enumerate() {
                let size = self.chunk_sizes[c];
                map.entry(self.chunk_hashes[c]).or_insert(ChunkLocation {
                    block,
                    chunk_in_block: i,
                    offset,
                    size,
                });
                offset += u64::from(size);
            }
        }
        map
    }

    pub fn contains_chunk(&self, hash: Hash) -> bool {
        self.chunk_hashes.contains(&hash)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let blocks = self.block_count();
        let mut out = Vec::with_capacity(24 + blocks * 20 + self.chunk_count() * 12);
        out.put_slice(MAGIC);
        out.put_u32_le(self.hash_identifier);
        out.put_u32_le(self.max_block_size);
        out.put_u32_le(self.max_chunks_per_block);
        out.put_u32_le(blocks as u32);
        out.put_u32_le(self.chunk_count() as u32);
        put_u64s(&mut out, &self.block_hashes);
        put_u32s(&mut out, &self.block_tags);
        put_u32s(&mut out, &self.block_chunk_offsets);
        put_u32s(&mut out, &self.block_chunk_counts);
        put_u64s(&mut out, &self.chunk_hashes);
        put_u32s(&mut out, &self.chunk_sizes);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "store index");
        r.magic(MAGIC)?;
        let hash_identifier = r.u32()?;
        let max_block_size = r.u32()?;
        let max_chunks_per_block = r.u32()?;
        let blocks = r.u32()? as usize;
        let chunks = r.u32()? as usize;
        let index = Self {
            hash_identifier,
            max_block_size,
            max_chunks_per_block,
            block_hashes: r.u64s(blocks)?,
            block_tags: r.u32s(blocks)?,
            block_chunk_offsets: r.u32s(blocks)?,
            block_chunk_counts: r.u32s(blocks)?,
            chunk_hashes: r.u64s(chunks)?,
            chunk_sizes: r.u32s(chunks)?,
        };
        r.finish()?;
        for block in 0..blocks {
            let start = index.block_chunk_offsets[block] as usize;
            let end = start + index.block_chunk_counts[block] as usize;
            if end > chunks {
                return Err(Error::invalid(format!("store index block {} chunk range out of bounds", block)));
            }
        }
        Ok(index)
    }
}

pub fn write_store_index(storage: &dyn Storage, path: &str, index: &StoreIndex) -> Result<()> {
    atomic_write(storage, path, &index.to_bytes())
}

pub fn read_store_index(storage: &dyn Storage, path: &str) -> Result<StoreIndex> {
    StoreIndex::from_bytes(&read_all(storage, path)?)
}

fn check_hash_identifiers(hasher: &dyn ContentHasher, store: &StoreIndex, version: &VersionIndex) -> Result<()> {
    if hasher.identifier() != version.hash_identifier() {
        return Err(Error::invalid(format!(
            "hasher {:#x} does not match version index hash identifier {:#x}",
            hasher.identifier(),
            version.hash_identifier()
        )));
    }
    if !store.is_empty() && store.hash_identifier() != version.hash_identifier() {
        return Err(Error::invalid(format!(
            "store index hash identifier {:#x} does not match version index {:#x}",
            store.hash_identifier(),
            version.hash_identifier()
        )));
    }
    Ok(())
}

struct OpenBlock {
    tag: u32,
    bytes: u64,
    chunk_hashes: Vec<Hash>,
    chunk_sizes: Vec<u32>,
}

impl OpenBlock {
    fn new(tag: u32) -> Self {
        Self {
            tag,
            bytes: 0,
            chunk_hashes: Vec::new(),
            chunk_sizes: Vec::new(),
        }
    }
}

/// Pack the chunks of `version` that `store` does not hold into new blocks
///
/// Chunks are visited in asset order, then chunk order, first occurrence
/// only. Each tag has one open block that is closed when the next chunk
/// would exceed `max_block_size` bytes or `max_chunks_per_block` chunks
/// (next-fit). A chunk larger than `max_block_size` gets a block of its own.
/// Blocks appear in the order they are closed; the remaining open blocks
/// follow in order of first tag use.
pub fn create_missing_content(
    hasher: &dyn ContentHasher,
    store: &StoreIndex,
    version: &VersionIndex,
    max_block_size: u32,
    max_chunks_per_block: u32,
) -> Result<StoreIndex> {
    if max_block_size == 0 || max_chunks_per_block == 0 {
        return Err(Error::invalid("block budgets must be non-zero"));
    }
    check_hash_identifiers(hasher, store, version)?;

    let stored: AHashSet<Hash> = store.chunk_hashes.iter().copied().collect();
    let mut out = StoreIndex::empty(version.hash_identifier(), max_block_size, max_chunks_per_block);
    let mut open: SmallVec<[OpenBlock; 4]> = SmallVec::new();
    let mut seen = vec![false; version.chunk_count()];

    let emit = |out: &mut StoreIndex, block: OpenBlock| {
        let hash = block_hash(hasher, block.tag, &block.chunk_hashes);
        out.push_block(hash, block.tag, &block.chunk_hashes, &block.chunk_sizes);
    };

    for asset in 0..version.asset_count() {
        for &c in version.asset_chunk_indexes(asset) {
            let c = c as usize;
            if std::mem::replace(&mut seen[c], true) {
                continue;
            }
            let hash = version.chunk_hash(c);
            if stored.contains(&hash) {
                continue;
            }
            let size = version.chunk_size(c);
            let tag = version.chunk_tag(c);

            if size > max_block_size {
                let mut single = OpenBlock::new(tag);
                single.chunk_hashes.push(hash);
                single.chunk_sizes.push(size);
                emit(&mut out, single);
                continue;
            }

            let slot = match open.iter().position(|b| b.tag == tag) {
                Some(slot) => slot,
                None => {
                    open.push(OpenBlock::new(tag));
                    open.len() - 1
                }
            };
            let current = &mut open[slot];
            let full = !current.chunk_hashes.is_empty()
                && (current.bytes + u64::from(size) > u64::from(max_block_size)
                    || current.chunk_hashes.len() >= max_chunks_per_block as usize);
            if full {
                let closed = std::mem::replace(current, OpenBlock::new(tag));
                emit(&mut out, closed);
            }
            let current = &mut open[slot];
            current.bytes += u64::from(size);
            current.chunk_hashes.push(hash);
            current.chunk_sizes.push(size);
        }
    }
    for block in open {
        if !block.chunk_hashes.is_empty() {
            emit(&mut out, block);
        }
    }

    tracing::debug!(
        blocks = out.block_count(),
        chunks = out.chunk_count(),
        "packed missing content"
    );
    Ok(out)
}

/// Pack every chunk of `version` into blocks
pub fn create_store_index(
    hasher: &dyn ContentHasher,
    version: &VersionIndex,
    max_block_size: u32,
    max_chunks_per_block: u32,
) -> Result<StoreIndex> {
    let empty = StoreIndex::empty(version.hash_identifier(), max_block_size, max_chunks_per_block);
    create_missing_content(hasher, &empty, version, max_block_size, max_chunks_per_block)
}

/// Blocks of `store` worth fetching for `chunk_hashes`
///
/// Candidates are ranked by the share of their bytes that is requested,
/// highest first, ties in store order. A candidate is taken when it still
/// contributes at least one uncovered chunk and those uncovered bytes make up
/// at least `min_block_usage_percent` of the block. 0 takes any overlap.
pub fn get_existing_content(
    store: &StoreIndex,
    chunk_hashes: &[Hash],
    min_block_usage_percent: u32,
) -> Result<StoreIndex> {
    if min_block_usage_percent > 100 {
        return Err(Error::invalid(format!(
            "block usage percent {} exceeds 100",
            min_block_usage_percent
        )));
    }
    let wanted: AHashSet<Hash> = chunk_hashes.iter().copied().collect();

    struct Candidate {
        block: usize,
        used: u64,
        total: u64,
    }
    let mut candidates: Vec<Candidate> = (0..store.block_count())
        .filter_map(|block| {
            let mut used = 0u64;
            let mut hit = false;
            for (h, &s) in store.block_chunk_hashes(block).iter().zip(store.block_chunk_sizes(block)) {
                if wanted.contains(h) {
                    used += u64::from(s);
                    hit = true;
                }
            }
            hit.then(|| Candidate {
                block,
                used,
                total: store.block_size(block),
            })
        })
        .collect();
    // used_a / total_a > used_b / total_b, cross multiplied; stable sort keeps store order on ties
    candidates.sort_by(|a, b| {
        let lhs = u128::from(a.used) * u128::from(b.total.max(1));
        let rhs = u128::from(b.used) * u128::from(a.total.max(1));
        rhs.cmp(&lhs)
    });

    let mut covered: AHashSet<Hash> = AHashSet::with_capacity(wanted.len());
    let mut out = StoreIndex::empty(store.hash_identifier, store.max_block_size, store.max_chunks_per_block);
    for candidate in candidates {
        let hashes = store.block_chunk_hashes(candidate.block);
        let sizes = store.block_chunk_sizes(candidate.block);
        let mut fresh_bytes = 0u64;
        let mut fresh = false;
        for (h, &s) in hashes.iter().zip(sizes) {
            if wanted.contains(h) && !covered.contains(h) {
                fresh_bytes += u64::from(s);
                fresh = true;
            }
        }
        if !fresh {
            continue;
        }
        let meets = candidate.total == 0
            || u128::from(fresh_bytes) * 100 >= u128::from(min_block_usage_percent) * u128::from(candidate.total);
        if !meets {
            continue;
        }
        covered.extend(hashes.iter().filter(|h| wanted.contains(*h)).copied());
        out.copy_block_from(store, candidate.block);
    }
    Ok(out)
}

/// Requested chunks the store does not list, in request order without repeats
pub fn get_missing_chunks(store: &StoreIndex, chunk_hashes: &[Hash]) -> Vec<Hash> {
    let stored: AHashSet<Hash> = store.chunk_hashes.iter().copied().collect();
    let mut seen = AHashSet::new();
    chunk_hashes
        .iter()
        .copied()
        .filter(|h| !stored.contains(h) && seen.insert(*h))
        .collect()
}

/// Union of two indexes; blocks of `local` first, duplicates of a block hash dropped
pub fn merge(local: &StoreIndex, new: &StoreIndex) -> Result<StoreIndex> {
    let hash_identifier = match (local.is_empty(), new.is_empty()) {
        (true, _) if new.hash_identifier != 0 => new.hash_identifier,
        (_, true) => local.hash_identifier,
        _ if local.hash_identifier == new.hash_identifier => local.hash_identifier,
        _ => {
            return Err(Error::invalid(format!(
                "cannot merge store indexes with hash identifiers {:#x} and {:#x}",
                local.hash_identifier, new.hash_identifier
            )))
        }
    };
    let mut out = StoreIndex::empty(
        hash_identifier,
        local.max_block_size.max(new.max_block_size),
        local.max_chunks_per_block.max(new.max_chunks_per_block),
    );
    let mut seen = AHashSet::new();
    for (index, block) in (0..local.block_count())
        .map(|b| (local, b))
        .chain((0..new.block_count()).map(|b| (new, b)))
    {
        if seen.insert(index.block_hashes[block]) {
            out.copy_block_from(index, block);
        }
    }
    Ok(out)
}

/// Keep only the blocks listed in `keep_block_hashes`
pub fn prune(store: &StoreIndex, keep_block_hashes: &[Hash]) -> StoreIndex {
    let keep: AHashSet<Hash> = keep_block_hashes.iter().copied().collect();
    let mut out = StoreIndex::empty(store.hash_identifier, store.max_block_size, store.max_chunks_per_block);
    for block in 0..store.block_count() {
        if keep.contains(&store.block_hashes[block]) {
            out.copy_block_from(store, block);
        }
    }
    out
}

/// `NotFound` unless every chunk of `version` is listed in `store`
pub fn validate_version(store: &StoreIndex, version: &VersionIndex) -> Result<()> {
    if !store.is_empty() && store.hash_identifier() != version.hash_identifier() {
        return Err(Error::invalid("store index and version index use different hashes"));
    }
    let missing = get_missing_chunks(store, version.chunk_hashes());
    if !missing.is_empty() {
        return Err(Error::not_found(format!(
            "{} of {} chunks are missing from the store, first {}",
            missing.len(),
            version.chunk_count(),
            crate::hash::to_hex(missing[0])
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Blake3Hasher, BLAKE3_HASH_ID};
    use crate::version_index::{ChunkRef, VersionIndexBuilder};
    use crate::ErrorKind;

    fn chunk(id: u64, size: u32, tag: u32) -> ChunkRef {
        ChunkRef {
            hash: 0x1000 + id,
            size,
            tag,
        }
    }

    fn version(assets: &[(&str, Vec<ChunkRef>)]) -> VersionIndex {
        let mut builder = VersionIndexBuilder::new(BLAKE3_HASH_ID, 64);
        for (path, chunks) in assets {
            builder.add_asset(&Blake3Hasher, path, 0o644, chunks).unwrap();
        }
        builder.finish()
    }

    fn all_chunks(index: &StoreIndex) -> Vec<Hash> {
        (0..index.block_count())
            .flat_map(|b| index.block_chunk_hashes(b).to_vec())
            .collect()
    }

    #[test]
    fn test_pack_respects_budgets_and_order() {
        let v = version(&[(
            "a",
            (0..10).map(|i| chunk(i, 300, 0)).collect(),
        )]);
        let packed = create_store_index(&Blake3Hasher, &v, 1000, 2).unwrap();
        for b in 0..packed.block_count() {
            assert!(packed.block_size(b) <= 1000);
            assert!(packed.block_chunk_hashes(b).len() <= 2);
        }
        assert_eq!(packed.block_count(), 5);
        assert_eq!(all_chunks(&packed), v.chunk_hashes_in_asset_order());
    }

    #[test]
    fn test_oversize_chunk_gets_own_block() {
        let v = version(&[("a", vec![chunk(1, 100, 0), chunk(2, 5000, 0), chunk(3, 100, 0)])]);
        let packed = create_store_index(&Blake3Hasher, &v, 1000, 16).unwrap();
        assert_eq!(packed.block_count(), 2);
        assert_eq!(packed.block_chunk_hashes(0), &[0x1002]);
        assert_eq!(packed.block_chunk_hashes(1), &[0x1001, 0x1003]);
    }

    #[test]
    fn test_tags_are_bucketed_separately() {
        let v = version(&[
            ("a", vec![chunk(1, 10, 1), chunk(2, 10, 2)]),
            ("b", vec![chunk(3, 10, 1)]),
        ]);
        let packed = create_store_index(&Blake3Hasher, &v, 1000, 16).unwrap();
        assert_eq!(packed.block_count(), 2);
        assert_eq!(packed.block_tag(0), 1);
        assert_eq!(packed.block_chunk_hashes(0), &[0x1001, 0x1003]);
        assert_eq!(packed.block_chunk_hashes(1), &[0x1002]);
    }

    #[test]
    fn test_missing_content_covers_every_chunk() {
        let v1 = version(&[("a", (0..6).map(|i| chunk(i, 100, 0)).collect())]);
        let store = create_store_index(&Blake3Hasher, &v1, 250, 8).unwrap();
        let v2 = version(&[
            ("a", (0..6).map(|i| chunk(i, 100, 0)).collect()),
            ("b", (6..9).map(|i| chunk(i, 100, 0)).collect()),
            ("c", vec![chunk(2, 100, 0), chunk(7, 100, 0)]),
        ]);
        let missing = create_missing_content(&Blake3Hasher, &store, &v2, 250, 8).unwrap();
        let missing_chunks = all_chunks(&missing);
        assert_eq!(missing_chunks, vec![0x1006, 0x1007, 0x1008]);
        for &h in v2.chunk_hashes() {
            assert!(store.contains_chunk(h) || missing.contains_chunk(h));
        }
        let merged = merge(&store, &missing).unwrap();
        validate_version(&merged, &v2).unwrap();
        assert_eq!(validate_version(&store, &v2).err().unwrap().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_block_hash_is_stable() {
        let v = version(&[("a", vec![chunk(1, 10, 0), chunk(2, 10, 0)])]);
        let a = create_store_index(&Blake3Hasher, &v, 100, 8).unwrap();
        let b = create_store_index(&Blake3Hasher, &v, 100, 8).unwrap();
        assert_eq!(a.block_hash(0), b.block_hash(0));
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let v = version(&[("a", vec![chunk(1, 10, 0)])]);
        assert_eq!(
            create_store_index(&Blake3Hasher, &v, 0, 8).err().unwrap().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(create_store_index(&Blake3Hasher, &v, 8, 0).is_err());
    }

    #[test]
    fn test_existing_content_threshold() {
        // block 0: chunks 0..4 (400 bytes), block 1: chunks 4..8
        let v = version(&[("a", (0..8).map(|i| chunk(i, 100, 0)).collect())]);
        let store = create_store_index(&Blake3Hasher, &v, 400, 16).unwrap();
        assert_eq!(store.block_count(), 2);

        let wanted = [0x1000, 0x1004, 0x1005, 0x1006];
        let any = get_existing_content(&store, &wanted, 0).unwrap();
        assert_eq!(any.block_count(), 2);
        // block 1 (75%) ranks before block 0 (25%)
        assert_eq!(any.block_hash(0), store.block_hash(1));

        let half = get_existing_content(&store, &wanted, 50).unwrap();
        assert_eq!(half.block_count(), 1);
        assert_eq!(half.block_hash(0), store.block_hash(1));

        let full = get_existing_content(&store, &[0x1000, 0x1001, 0x1002, 0x1003], 100).unwrap();
        assert_eq!(full.block_count(), 1);
        assert!(get_existing_content(&store, &wanted, 101).is_err());
    }

    #[test]
    fn test_existing_content_skips_redundant_blocks() {
        let mut a = StoreIndex::empty(BLAKE3_HASH_ID, 1000, 16);
        a.push_block(1, 0, &[10, 11], &[50, 50]);
        a.push_block(2, 0, &[10], &[50]);
        let subset = get_existing_content(&a, &[10, 11], 0).unwrap();
        assert_eq!(subset.block_hashes(), &[1]);
    }

    #[test]
    fn test_prune_and_locations() {
        let v = version(&[("a", (0..4).map(|i| chunk(i, 100, 0)).collect())]);
        let store = create_store_index(&Blake3Hasher, &v, 200, 16).unwrap();
        let locations = store.chunk_locations();
        let loc = locations[&0x1001];
        assert_eq!((loc.block, loc.chunk_in_block, loc.offset), (0, 1, 100));

        let kept = prune(&store, &[store.block_hash(1)]);
        assert_eq!(kept.block_count(), 1);
        assert_eq!(kept.block_chunk_hashes(0), &[0x1002, 0x1003]);
    }

    #[test]
    fn test_roundtrip() {
        let v = version(&[("a", (0..5).map(|i| chunk(i, 100 + i as u32, 0)).collect())]);
        let store = create_store_index(&Blake3Hasher, &v, 250, 16).unwrap();
        let bytes = store.to_bytes();
        assert_eq!(StoreIndex::from_bytes(&bytes).unwrap(), store);
        assert_eq!(
            StoreIndex::from_bytes(&bytes[..bytes.len() - 2]).err().unwrap().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_merge_rejects_mismatched_hashes() {
        let mut a = StoreIndex::empty(1, 10, 10);
        a.push_block(1, 0, &[1], &[1]);
        let mut b = StoreIndex::empty(2, 10, 10);
        b.push_block(2, 0, &[2], &[1]);
        assert!(merge(&a, &b).is_err());
        assert_eq!(merge(&a, &a).unwrap().block_count(), 1);
    }
}
