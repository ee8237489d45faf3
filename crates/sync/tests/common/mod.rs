//! Shared fixtures for the sync integration tests

#![allow(dead_code)]

use anyhow::Result;
use depot_core::{FsStorage, Storage};
use depot_sync::{Engine, EngineConfig};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Small budgets so a few kilobytes of data span several chunks and blocks
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.worker_count = 4;
    config.engine.log_level = "warn".to_string();
    config.chunking.target_chunk_size = 512;
    config.blocks.max_block_size = 2048;
    config.store.retry_backoff_ms = 1;
    config.store.lru_block_count = 8;
    config
}

pub fn engine() -> Engine {
    Engine::new(test_config()).expect("engine")
}

pub fn fs_storage() -> Arc<dyn Storage> {
    Arc::new(FsStorage::new())
}

pub fn path_str(path: &Path) -> String {
    path.to_str().expect("utf-8 temp path").to_string()
}

/// Reproducible pseudo-random bytes
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Write `files` (relative path, bytes) below `root`, creating parents
pub fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) -> Result<()> {
    for (path, data) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, data)?;
    }
    Ok(())
}

/// Every regular file below `root` with its contents
pub fn snapshot(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root)?.to_string_lossy().replace('\\', "/");
            files.insert(rel, fs::read(entry.path())?);
        }
    }
    Ok(files)
}

/// Temp workspace with a source tree, a remote store, a local cache and an install dir
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("src"))?;
        Ok(Self { dir })
    }

    pub fn src(&self) -> std::path::PathBuf {
        self.dir.path().join("src")
    }

    pub fn install(&self) -> std::path::PathBuf {
        self.dir.path().join("install")
    }

    pub fn remote(&self) -> String {
        path_str(&self.dir.path().join("remote"))
    }

    pub fn cache(&self) -> String {
        path_str(&self.dir.path().join("cache"))
    }
}
