//! Content-defined chunking
//!
//! FastCDC style cut detection over a Gear rolling hash. The hash is
//! `h = (h << 1) + GEAR[byte]`, so bit `k` of `h` depends on the last `k + 1`
//! bytes; the cut condition tests the top bits, which gives a 64 byte window.
//! Normalized chunking uses a harder mask before the average size and an
//! easier one after it, tightening the size distribution around the target.

use crate::error::{Error, Result};
use std::io::Read;
use std::sync::OnceLock;

type GearTable = [u64; 256];

/// Gear table derived from BLAKE3 of each single byte value
fn gear_table() -> &'static GearTable {
    static TABLE: OnceLock<GearTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u64; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let hash = blake3::hash(&[i as u8]);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&hash.as_bytes()[..8]);
            *slot = u64::from_le_bytes(bytes);
        }
        table
    })
}

fn top_mask(bits: u32) -> u64 {
    let bits = bits.clamp(1, 63);
    ((1u64 << bits) - 1) << (64 - bits)
}

/// Parameters for the chunking algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerParams {
    /// Minimum chunk size in bytes (only the final chunk may be smaller)
    pub min_size: usize,
    /// Target average chunk size
    pub avg_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Mask for positions before average
    pub mask_s: u64,
    /// Mask for positions at/after average
    pub mask_l: u64,
}

impl ChunkerParams {
    /// Derive parameters from a target average chunk size
    ///
    /// `min = target / 4`, `max = target * 4`.
    pub fn from_target(target_chunk_size: u32) -> Result<Self> {
        if target_chunk_size == 0 {
            return Err(Error::invalid("target chunk size must be non-zero"));
        }
        let avg = target_chunk_size as usize;
        let bits = usize::BITS - 1 - avg.leading_zeros();
        Ok(Self {
            min_size: (avg / 4).max(1),
            avg_size: avg,
            max_size: avg.saturating_mul(4),
            mask_s: top_mask(bits + 1),
            mask_l: top_mask(bits.saturating_sub(1)),
        })
    }

    /// Length of the next chunk at the start of `data`
    ///
    /// `data` must hold at least `max_size` bytes unless it is the tail of
    /// the stream; the result only depends on the first `max_size` bytes.
    pub fn cut_point(&self, data: &[u8]) -> usize {
        if data.len() <= self.min_size {
            return data.len();
        }
        let gear = gear_table();
        let end = self.max_size.min(data.len());
        let mut hash = 0u64;
        for (i, &byte) in data.iter().enumerate().take(end).skip(self.min_size) {
            hash = (hash << 1).wrapping_add(gear[byte as usize]);
            let mask = if i < self.avg_size { self.mask_s } else { self.mask_l };
            if hash & mask == 0 {
                return i + 1;
            }
        }
        end
    }
}

/// A chunk boundary with start and end offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    /// Start offset (inclusive)
    pub start: usize,
    /// End offset (exclusive)
    pub end: usize,
}

impl ChunkBoundary {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

/// One chunk produced by a [`ChunkStream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the chunk inside the stream
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Deterministic content-defined chunker
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    params: ChunkerParams,
}

impl Chunker {
    pub fn new(params: ChunkerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChunkerParams {
        &self.params
    }

    /// Chunk boundaries of an in-memory buffer; empty input yields no chunks
    pub fn boundaries(&self, data: &[u8]) -> Vec<ChunkBoundary> {
        let mut out = Vec::with_capacity(data.len() / self.params.avg_size + 1);
        let mut pos = 0;
        while pos < data.len() {
            let len = self.params.cut_point(&data[pos..]);
            out.push(ChunkBoundary {
                start: pos,
                end: pos + len,
            });
            pos += len;
        }
        out
    }

    /// Lazily chunk a stream; restart by calling again with a fresh reader
    pub fn chunks<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream {
            reader,
            params: self.params,
            buffer: Vec::with_capacity(self.params.max_size * 2),
            pos: 0,
            offset: 0,
            eof: false,
            failed: false,
        }
    }
}

/// Streaming chunk iterator over any [`Read`]
pub struct ChunkStream<R: Read> {
    reader: R,
    params: ChunkerParams,
    buffer: Vec<u8>,
    pos: usize,
    offset: u64,
    eof: bool,
    failed: bool,
}

impl<R: Read> ChunkStream<R> {
    /// Keep at least `max_size` unread bytes buffered until EOF
    fn fill(&mut self) -> Result<()> {
        if self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        let want = self.params.max_size;
        let mut scratch = [0u8; 64 * 1024];
        while !self.eof && self.buffer.len() < want {
            let limit = scratch.len().min(want - self.buffer.len()).max(1);
            match self.reader.read(&mut scratch[..limit]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e, "chunk stream")),
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.len() - self.pos < self.params.max_size && !self.eof {
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let available = &self.buffer[self.pos..];
        if available.is_empty() {
            return None;
        }
        let len = self.params.cut_point(available);
        let chunk = Chunk {
            offset: self.offset,
            data: available[..len].to_vec(),
        };
        self.pos += len;
        self.offset += len as u64;
        Some(Ok(chunk))
    }
}
