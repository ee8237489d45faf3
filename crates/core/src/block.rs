//! Immutable bundles of chunks
//!
//! Block file format (`DBK1`, little-endian):
//! ```text
//! magic "DBK1"
//! hash_identifier u32, block_hash u64, tag u32, flags u32 (bit0 = compressed)
//! chunk_count u32
//! chunk_hashes [u64; n], chunk_sizes [u32; n]
//! payload_len u32, payload [u8; payload_len]
//! ```

use crate::error::{Error, Result};
use crate::hash::{to_hex, ContentHasher, Hash};
use crate::wire::{put_u32s, put_u64s, Reader};
use bytes::{BufMut, Bytes};

const MAGIC: &[u8; 4] = b"DBK1";
const FLAG_COMPRESSED: u32 = 0b0000_0001;

/// Block hash over the tag and the ordered chunk hashes
///
/// The same grouping of chunks always yields the same block hash.
pub fn block_hash(hasher: &dyn ContentHasher, tag: u32, chunk_hashes: &[Hash]) -> Hash {
    let mut ctx = hasher.context();
    ctx.update(&tag.to_le_bytes());
    for h in chunk_hashes {
        ctx.update(&h.to_le_bytes());
    }
    ctx.finalize()
}

/// Description of a block without its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    pub block_hash: Hash,
    pub hash_identifier: u32,
    pub tag: u32,
    pub chunk_hashes: Vec<Hash>,
    pub chunk_sizes: Vec<u32>,
}

impl BlockIndex {
    /// Uncompressed payload size
    pub fn data_size(&self) -> u64 {
        self.chunk_sizes.iter().map(|&s| u64::from(s)).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }
}

/// A block with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub index: BlockIndex,
    /// Chunk bytes back to back, or the codec output when `compressed`
    pub data: Bytes,
    pub compressed: bool,
}

impl StoredBlock {
    /// Assemble a block from raw chunk payloads
    pub fn from_chunks(hasher: &dyn ContentHasher, tag: u32, chunks: &[&[u8]]) -> Self {
        let chunk_hashes: Vec<Hash> = chunks.iter().map(|c| hasher.hash(c)).collect();
        let chunk_sizes: Vec<u32> = chunks.iter().map(|c| c.len() as u32).collect();
        let mut data = Vec::with_capacity(chunk_sizes.iter().map(|&s| s as usize).sum());
        for chunk in chunks {
            data.extend_from_slice(chunk);
        }
        Self {
            index: BlockIndex {
                block_hash: block_hash(hasher, tag, &chunk_hashes),
                hash_identifier: hasher.identifier(),
                tag,
                chunk_hashes,
                chunk_sizes,
            },
            data: Bytes::from(data),
            compressed: false,
        }
    }

    pub fn block_hash(&self) -> Hash {
        self.index.block_hash
    }

    pub fn tag(&self) -> u32 {
        self.index.tag
    }

    /// Byte offset of chunk `i` in the uncompressed payload
    pub fn chunk_offset(&self, i: usize) -> u64 {
        self.index.chunk_sizes[..i].iter().map(|&s| u64::from(s)).sum()
    }

    pub fn find_chunk(&self, hash: Hash) -> Option<usize> {
        self.index.chunk_hashes.iter().position(|&h| h == hash)
    }

    /// Payload of chunk `i`; fails on compressed blocks
    pub fn chunk_data(&self, i: usize) -> Result<Bytes> {
        if self.compressed {
            return Err(Error::invalid(format!(
                "block {} is still compressed",
                to_hex(self.block_hash())
            )));
        }
        let size = *self
            .index
            .chunk_sizes
            .get(i)
            .ok_or_else(|| Error::invalid(format!("chunk {} out of range", i)))? as usize;
        let start = self.chunk_offset(i) as usize;
        if start + size > self.data.len() {
            return Err(Error::invalid(format!(
                "block {} payload is shorter than its chunk table",
                to_hex(self.block_hash())
            )));
        }
        Ok(self.data.slice(start..start + size))
    }

    /// Structural check: chunk sizes must add up to the raw payload
    pub fn validate(&self) -> Result<()> {
        if self.index.chunk_hashes.len() != self.index.chunk_sizes.len() {
            return Err(Error::invalid("block chunk table columns differ in length"));
        }
        if !self.compressed && self.index.data_size() != self.data.len() as u64 {
            return Err(Error::invalid(format!(
                "block {} payload is {} bytes, chunk table says {}",
                to_hex(self.block_hash()),
                self.data.len(),
                self.index.data_size()
            )));
        }
        Ok(())
    }

    /// Recompute chunk and block hashes
    pub fn verify(&self, hasher: &dyn ContentHasher) -> Result<()> {
        self.validate()?;
        if hasher.identifier() != self.index.hash_identifier {
            return Err(Error::invalid("block hash identifier does not match hasher"));
        }
        if block_hash(hasher, self.index.tag, &self.index.chunk_hashes) != self.index.block_hash {
            return Err(Error::invalid(format!("block {} hash mismatch", to_hex(self.block_hash()))));
        }
        if !self.compressed {
            for i in 0..self.index.chunk_count() {
                if hasher.hash(&self.chunk_data(i)?) != self.index.chunk_hashes[i] {
                    return Err(Error::invalid(format!(
                        "chunk {} of block {} hash mismatch",
                        i,
                        to_hex(self.block_hash())
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.index.chunk_count();
        let mut out = Vec::with_capacity(32 + n * 12 + self.data.len());
        out.put_slice(MAGIC);
        out.put_u32_le(self.index.hash_identifier);
        out.put_u64_le(self.index.block_hash);
        out.put_u32_le(self.index.tag);
        out.put_u32_le(if self.compressed { FLAG_COMPRESSED } else { 0 });
        out.put_u32_le(n as u32);
        put_u64s(&mut out, &self.index.chunk_hashes);
        put_u32s(&mut out, &self.index.chunk_sizes);
        out.put_u32_le(self.data.len() as u32);
        out.put_slice(&self.data);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "block");
        r.magic(MAGIC)?;
        let hash_identifier = r.u32()?;
        let block_hash = r.u64()?;
        let tag = r.u32()?;
        let flags = r.u32()?;
        let n = r.count(12)?;
        let chunk_hashes = r.u64s(n)?;
        let chunk_sizes = r.u32s(n)?;
        let len = r.u32()? as usize;
        let data = Bytes::copy_from_slice(r.bytes(len)?);
        r.finish()?;
        let block = Self {
            index: BlockIndex {
                block_hash,
                hash_identifier,
                tag,
                chunk_hashes,
                chunk_sizes,
            },
            data,
            compressed: flags & FLAG_COMPRESSED != 0,
        };
        block.validate()?;
        Ok(block)
    }
}
