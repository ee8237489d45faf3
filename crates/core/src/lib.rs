//! Core primitives for depot
//!
//! This crate provides:
//! - Content-defined chunking and 64-bit content hashing
//! - The filesystem abstraction used for all engine I/O
//! - Flat version and store indexes with their binary formats
//! - Block packing, existing-content selection and version diffs

pub mod block;
pub mod chunker;
pub mod diff;
pub mod error;
pub mod hash;
pub mod job;
pub mod scan;
pub mod storage;
pub mod store_index;
pub mod version_index;

mod wire;

pub use block::{block_hash, BlockIndex, StoredBlock};
pub use chunker::{Chunk, ChunkBoundary, Chunker, ChunkerParams};
pub use diff::{create_version_diff, VersionDiff};
pub use error::{Error, ErrorKind, Result};
pub use hash::{Blake3Hasher, ContentHasher, Hash, HashRegistry, Sha1Hasher};
pub use job::{with_current_dispatch, CancelToken, JobPool, Progress, ProgressTracker};
pub use scan::{get_files_recursively, FileInfos, GlobFilter, PathFilter};
pub use storage::{FsStorage, MemStorage, Storage};
pub use store_index::{
    create_missing_content, create_store_index, get_existing_content, StoreIndex,
};
pub use version_index::{
    create_version_index, read_version_index, write_version_index, VersionIndex, VersionIndexOptions,
};
