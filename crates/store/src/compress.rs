//! Per-tag block compression
//!
//! The block tag selects the codec. Compressed payloads are framed as
//! `raw_len u32 LE` followed by the codec output; chunk hashes and the block
//! hash always describe the raw bytes.

use crate::stats::BlockStoreStats;
use crate::{run_blocking, BlockStore};
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use depot_core::hash::{fourcc, to_hex};
use depot_core::{Error, Hash, Result, StoreIndex, StoredBlock};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::trace;

pub const ZSTD_MIN: u32 = fourcc(b"zstm");
pub const ZSTD_DEFAULT: u32 = fourcc(b"zstd");
pub const ZSTD_MAX: u32 = fourcc(b"zstx");
pub const DEFLATE_FAST: u32 = fourcc(b"defm");
pub const DEFLATE_DEFAULT: u32 = fourcc(b"defl");
pub const DEFLATE_BEST: u32 = fourcc(b"defx");

pub trait Codec: Send + Sync {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of [`compress`](Codec::compress); `raw_len` is the expected output size
    fn decompress(&self, compressed: &[u8], raw_len: usize) -> Result<Vec<u8>>;
}

pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Codec for ZstdCodec {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(raw, self.level).map_err(|e| Error::from_io(e, "zstd compress"))
    }

    fn decompress(&self, compressed: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(compressed, raw_len).map_err(|e| Error::from_io(e, "zstd decompress"))
    }
}

pub struct DeflateCodec {
    level: flate2::Compression,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level),
        }
    }
}

impl Codec for DeflateCodec {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2), self.level);
        encoder
            .write_all(raw)
            .map_err(|e| Error::from_io(e, "deflate compress"))?;
        encoder.finish().map_err(|e| Error::from_io(e, "deflate compress"))
    }

    fn decompress(&self, compressed: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(raw_len);
        DeflateDecoder::new(compressed)
            .take(raw_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::from_io(e, "deflate decompress"))?;
        if out.len() > raw_len {
            return Err(Error::invalid(format!("deflate payload inflates past {} bytes", raw_len)));
        }
        Ok(out)
    }
}

/// Codecs by block tag
#[derive(Clone, Default)]
pub struct CompressionRegistry {
    codecs: AHashMap<u32, Arc<dyn Codec>>,
}

impl CompressionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// zstd and deflate at three levels each
    pub fn full() -> Self {
        let mut registry = Self::new();
        registry.register(ZSTD_MIN, Arc::new(ZstdCodec::new(1)));
        registry.register(ZSTD_DEFAULT, Arc::new(ZstdCodec::new(zstd::DEFAULT_COMPRESSION_LEVEL)));
        registry.register(ZSTD_MAX, Arc::new(ZstdCodec::new(19)));
        registry.register(DEFLATE_FAST, Arc::new(DeflateCodec::new(1)));
        registry.register(DEFLATE_DEFAULT, Arc::new(DeflateCodec::new(6)));
        registry.register(DEFLATE_BEST, Arc::new(DeflateCodec::new(9)));
        registry
    }

    pub fn register(&mut self, tag: u32, codec: Arc<dyn Codec>) {
        self.codecs.insert(tag, codec);
    }

    pub fn get(&self, tag: u32) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&tag).cloned()
    }

    /// Tag for a configuration name such as `"zstd"` or `"deflate-best"`
    pub fn tag_for_name(name: &str) -> Result<u32> {
        match name {
            "none" => Ok(0),
            "zstd-min" => Ok(ZSTD_MIN),
            "zstd" => Ok(ZSTD_DEFAULT),
            "zstd-max" => Ok(ZSTD_MAX),
            "deflate-fast" => Ok(DEFLATE_FAST),
            "deflate" => Ok(DEFLATE_DEFAULT),
            "deflate-best" => Ok(DEFLATE_BEST),
            other => Err(Error::invalid(format!("unknown compression {:?}", other))),
        }
    }
}

fn compress_block(codec: &dyn Codec, block: &StoredBlock) -> Result<StoredBlock> {
    let packed = codec.compress(&block.data)?;
    let mut data = Vec::with_capacity(4 + packed.len());
    data.put_u32_le(block.data.len() as u32);
    data.put_slice(&packed);
    Ok(StoredBlock {
        index: block.index.clone(),
        data: Bytes::from(data),
        compressed: true,
    })
}

fn decompress_block(codec: &dyn Codec, block: &StoredBlock) -> Result<StoredBlock> {
    let short = || Error::invalid(format!("block {} has a truncated compressed payload", to_hex(block.block_hash())));
    let header: [u8; 4] = block.data.get(..4).and_then(|h| h.try_into().ok()).ok_or_else(short)?;
    let raw_len = u32::from_le_bytes(header) as usize;
    if raw_len as u64 != block.index.data_size() {
        return Err(Error::invalid(format!(
            "block {} declares {} raw bytes but its index holds {}",
            to_hex(block.block_hash()),
            raw_len,
            block.index.data_size()
        )));
    }
    let raw = codec.decompress(&block.data[4..], raw_len)?;
    if raw.len() != raw_len {
        return Err(short());
    }
    let out = StoredBlock {
        index: block.index.clone(),
        data: Bytes::from(raw),
        compressed: false,
    };
    out.validate()?;
    Ok(out)
}

/// Compresses blocks on put and decompresses them on get
pub struct CompressBlockStore {
    inner: Arc<dyn BlockStore>,
    registry: CompressionRegistry,
}

impl CompressBlockStore {
    pub fn new(inner: Arc<dyn BlockStore>, registry: CompressionRegistry) -> Self {
        Self { inner, registry }
    }
}

#[async_trait]
impl BlockStore for CompressBlockStore {
    async fn put_stored_block(&self, block: Arc<StoredBlock>) -> Result<()> {
        let codec = match self.registry.get(block.tag()) {
            Some(codec) if !block.compressed => codec,
            _ => return self.inner.put_stored_block(block).await,
        };
        let raw_len = block.data.len();
        let packed = run_blocking(move || compress_block(codec.as_ref(), &block)).await?;
        trace!(block = %to_hex(packed.block_hash()), raw_len, packed_len = packed.data.len(), "compressed block");
        self.inner.put_stored_block(Arc::new(packed)).await
    }

    async fn preflight_get(&self, chunk_hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.inner.preflight_get(chunk_hashes).await
    }

    async fn get_stored_block(&self, block_hash: Hash) -> Result<Arc<StoredBlock>> {
        let block = self.inner.get_stored_block(block_hash).await?;
        if !block.compressed {
            return Ok(block);
        }
        let codec = self.registry.get(block.tag()).ok_or_else(|| {
            Error::not_supported(format!(
                "no codec for tag {:#x} of block {}",
                block.tag(),
                to_hex(block_hash)
            ))
        })?;
        let raw = run_blocking(move || decompress_block(codec.as_ref(), &block)).await?;
        Ok(Arc::new(raw))
    }

    async fn get_existing_content(
        &self,
        chunk_hashes: &[Hash],
        min_block_usage_percent: u32,
    ) -> Result<StoreIndex> {
        self.inner
            .get_existing_content(chunk_hashes, min_block_usage_percent)
            .await
    }

    async fn prune_blocks(&self, keep_block_hashes: &[Hash]) -> Result<u32> {
        self.inner.prune_blocks(keep_block_hashes).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    fn get_stats(&self) -> BlockStoreStats {
        self.inner.get_stats()
    }
}
