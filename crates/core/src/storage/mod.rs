//! Filesystem abstraction
//!
//! All engine I/O goes through [`Storage`]. Paths are `/` separated strings;
//! [`FsStorage`] maps them straight onto the host filesystem and
//! [`MemStorage`] keeps a tree in memory for tests and staging.

mod fs;
mod mem;

pub use fs::FsStorage;
pub use mem::MemStorage;

use crate::error::{Error, Result};

/// Random-access reader for one open file
pub trait ReadHandle: Send {
    /// Size of the file when it was opened
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`; short files are an I/O error
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Random-access writer for one open file
pub trait WriteHandle: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Flush to durable storage
    fn flush(&mut self) -> Result<()>;
}

/// Held advisory lock; released on drop
pub trait LockGuard: Send {}

/// One entry returned by [`Storage::list_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub permissions: u16,
    pub is_dir: bool,
}

/// Operations the engine needs from a filesystem
pub trait Storage: Send + Sync {
    fn open_read(&self, path: &str) -> Result<Box<dyn ReadHandle>>;

    /// Create or truncate `path`; the parent directory must exist
    fn open_write(&self, path: &str) -> Result<Box<dyn WriteHandle>>;

    /// Create one directory; succeeds if it already exists
    fn create_dir(&self, path: &str) -> Result<()>;

    /// Remove an empty directory
    fn remove_dir(&self, path: &str) -> Result<()>;

    fn remove_file(&self, path: &str) -> Result<()>;

    /// Move `from` to `to`, replacing an existing file at `to`
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn is_dir(&self, path: &str) -> bool;

    fn is_file(&self, path: &str) -> bool;

    /// Entries of a directory in unspecified order
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Permission bits (`0o7777` mask)
    fn permissions(&self, path: &str) -> Result<u16>;

    fn set_permissions(&self, path: &str, permissions: u16) -> Result<()>;

    /// Block until an exclusive advisory lock on `path` is held
    fn lock_file(&self, path: &str) -> Result<Box<dyn LockGuard>>;

    /// Concatenate two path fragments
    fn join(&self, base: &str, name: &str) -> String {
        join_path(base, name)
    }

    /// Parent of `path`, `None` at the root
    fn parent(&self, path: &str) -> Option<String> {
        parent_path(path)
    }
}

pub fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        return name.to_string();
    }
    let base = base.trim_end_matches('/');
    if name.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, name)
}

pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(pos) => Some(trimmed[..pos].to_string()),
        None => Some(String::new()),
    }
}

/// Create `path` and any missing parents
pub fn create_dir_all(storage: &dyn Storage, path: &str) -> Result<()> {
    let path = path.trim_end_matches('/');
    if path.is_empty() || storage.is_dir(path) {
        return Ok(());
    }
    if let Some(parent) = storage.parent(path) {
        if !parent.is_empty() && parent != "/" {
            create_dir_all(storage, &parent)?;
        }
    }
    storage.create_dir(path)
}

/// Read a whole file
pub fn read_all(storage: &dyn Storage, path: &str) -> Result<Vec<u8>> {
    let mut handle = storage.open_read(path)?;
    let size = usize::try_from(handle.size())
        .map_err(|_| Error::OutOfMemory(format!("{} does not fit in memory", path)))?;
    let mut data = vec![0u8; size];
    handle.read_at(0, &mut data)?;
    Ok(data)
}

/// Atomic write helper
///
/// Writes to a uniquely named temporary file next to `target`, flushes it,
/// then renames it over `target`. Readers see either the old file or the new
/// one, never a partial write.
pub fn atomic_write(storage: &dyn Storage, target: &str, data: &[u8]) -> Result<()> {
    let tmp = format!("{}.{}.tmp", target, uuid::Uuid::new_v4().simple());
    let written = (|| {
        let mut handle = storage.open_write(&tmp)?;
        handle.write_at(0, data)?;
        handle.flush()
    })();
    if let Err(e) = written {
        let _ = storage.remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = storage.rename(&tmp, target) {
        let _ = storage.remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Normalize a relative asset path
///
/// - Uses `/` separators
/// - Rejects `..` components and absolute paths
/// - Removes `./` components and duplicate separators
/// - Keeps a trailing `/` (directory marker)
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(Error::invalid(format!("absolute path not allowed: {}", path)));
    }
    let is_dir = unified.ends_with('/');
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(Error::invalid(format!("parent component not allowed: {}", path)));
            }
            other => parts.push(other),
        }
    }
    let mut out = parts.join("/");
    if is_dir && !out.is_empty() {
        out.push('/');
    }
    Ok(out)
}
