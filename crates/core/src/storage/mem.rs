//! In-memory filesystem backend

use super::{parent_path, DirEntry, LockGuard, ReadHandle, Storage, WriteHandle};
use crate::error::{Error, Result};
use ahash::AHashSet;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_FILE_PERMISSIONS: u16 = 0o644;
const DEFAULT_DIR_PERMISSIONS: u16 = 0o755;

#[derive(Clone)]
enum Node {
    File {
        data: Arc<Mutex<Vec<u8>>>,
        permissions: u16,
    },
    Dir {
        permissions: u16,
    },
}

#[derive(Default)]
struct Inner {
    nodes: RwLock<BTreeMap<String, Node>>,
    locks: Mutex<AHashSet<String>>,
    released: Condvar,
}

/// [`Storage`] kept entirely in memory
///
/// The empty path is the root directory. Cloning shares the same tree.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<Inner>,
}

fn key(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_parent(nodes: &BTreeMap<String, Node>, path: &str) -> Result<()> {
        match parent_path(path) {
            Some(parent) if !parent.is_empty() && parent != "/" => match nodes.get(&key(&parent)) {
                Some(Node::Dir { .. }) => Ok(()),
                _ => Err(Error::not_found(format!("parent directory of {}", path))),
            },
            _ => Ok(()),
        }
    }

    fn is_direct_child(parent: &str, candidate: &str) -> bool {
        if parent.is_empty() {
            return !candidate.contains('/');
        }
        candidate
            .strip_prefix(parent)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| !rest.is_empty() && !rest.contains('/'))
            .unwrap_or(false)
    }
}

struct MemReadHandle {
    data: Vec<u8>,
    path: String,
}

impl ReadHandle for MemReadHandle {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::io(format!(
                "read {}: range {}..{} past end {}",
                self.path,
                start,
                end,
                self.data.len()
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

struct MemWriteHandle {
    data: Arc<Mutex<Vec<u8>>>,
}

impl WriteHandle for MemWriteHandle {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemLock {
    path: String,
    inner: Arc<Inner>,
}

impl LockGuard for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.inner.locks.lock().remove(&self.path);
        self.inner.released.notify_all();
    }
}

impl Storage for MemStorage {
    fn open_read(&self, path: &str) -> Result<Box<dyn ReadHandle>> {
        let nodes = self.inner.nodes.read();
        match nodes.get(&key(path)) {
            Some(Node::File { data, .. }) => Ok(Box::new(MemReadHandle {
                data: data.lock().clone(),
                path: path.to_string(),
            })),
            Some(Node::Dir { .. }) => Err(Error::invalid(format!("{} is a directory", path))),
            None => Err(Error::not_found(path.to_string())),
        }
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn WriteHandle>> {
        let mut nodes = self.inner.nodes.write();
        Self::check_parent(&nodes, path)?;
        let k = key(path);
        let permissions = match nodes.get(&k) {
            Some(Node::Dir { .. }) => {
                return Err(Error::invalid(format!("{} is a directory", path)));
            }
            Some(Node::File { permissions, .. }) if permissions & 0o200 == 0 => {
                return Err(Error::PermissionDenied(path.to_string()));
            }
            Some(Node::File { permissions, .. }) => *permissions,
            None => DEFAULT_FILE_PERMISSIONS,
        };
        let data = Arc::new(Mutex::new(Vec::new()));
        nodes.insert(
            k,
            Node::File {
                data: data.clone(),
                permissions,
            },
        );
        Ok(Box::new(MemWriteHandle { data }))
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        let mut nodes = self.inner.nodes.write();
        let k = key(path);
        match nodes.get(&k) {
            Some(Node::Dir { .. }) => return Ok(()),
            Some(Node::File { .. }) => return Err(Error::AlreadyExists(path.to_string())),
            None => {}
        }
        if k.is_empty() {
            return Ok(());
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(
            k,
            Node::Dir {
                permissions: DEFAULT_DIR_PERMISSIONS,
            },
        );
        Ok(())
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let mut nodes = self.inner.nodes.write();
        let k = key(path);
        match nodes.get(&k) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(Error::invalid(format!("{} is a file", path))),
            None => return Err(Error::not_found(path.to_string())),
        }
        let prefix = format!("{}/", k);
        if nodes.range(prefix.clone()..).next().is_some_and(|(p, _)| p.starts_with(&prefix)) {
            return Err(Error::io(format!("directory not empty: {}", path)));
        }
        nodes.remove(&k);
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let mut nodes = self.inner.nodes.write();
        let k = key(path);
        match nodes.get(&k) {
            Some(Node::File { .. }) => {
                nodes.remove(&k);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(Error::invalid(format!("{} is a directory", path))),
            None => Err(Error::not_found(path.to_string())),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut nodes = self.inner.nodes.write();
        let from_key = key(from);
        let to_key = key(to);
        let node = nodes
            .get(&from_key)
            .cloned()
            .ok_or_else(|| Error::not_found(from.to_string()))?;
        Self::check_parent(&nodes, to)?;
        if let Node::Dir { .. } = node {
            let prefix = format!("{}/", from_key);
            let children: Vec<String> = nodes
                .range(prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
                .map(|(p, _)| p.clone())
                .collect();
            for child in children {
                if let Some(moved) = nodes.remove(&child) {
                    let renamed = format!("{}/{}", to_key, &child[prefix.len()..]);
                    nodes.insert(renamed, moved);
                }
            }
        }
        nodes.remove(&from_key);
        nodes.insert(to_key, node);
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        let k = key(path);
        k.is_empty() || matches!(self.inner.nodes.read().get(&k), Some(Node::Dir { .. }))
    }

    fn is_file(&self, path: &str) -> bool {
        matches!(self.inner.nodes.read().get(&key(path)), Some(Node::File { .. }))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        if !self.is_dir(path) {
            return Err(Error::not_found(path.to_string()));
        }
        let parent = key(path);
        let nodes = self.inner.nodes.read();
        let entries = nodes
            .iter()
            .filter(|(p, _)| Self::is_direct_child(&parent, p))
            .map(|(p, node)| {
                let name = p.rsplit('/').next().unwrap_or(p).to_string();
                match node {
                    Node::File { data, permissions } => DirEntry {
                        name,
                        size: data.lock().len() as u64,
                        permissions: *permissions,
                        is_dir: false,
                    },
                    Node::Dir { permissions } => DirEntry {
                        name,
                        size: 0,
                        permissions: *permissions,
                        is_dir: true,
                    },
                }
            })
            .collect();
        Ok(entries)
    }

    fn permissions(&self, path: &str) -> Result<u16> {
        match self.inner.nodes.read().get(&key(path)) {
            Some(Node::File { permissions, .. }) | Some(Node::Dir { permissions }) => Ok(*permissions),
            None => Err(Error::not_found(path.to_string())),
        }
    }

    fn set_permissions(&self, path: &str, value: u16) -> Result<()> {
        match self.inner.nodes.write().get_mut(&key(path)) {
            Some(Node::File { permissions, .. }) | Some(Node::Dir { permissions }) => {
                *permissions = value & 0o7777;
                Ok(())
            }
            None => Err(Error::not_found(path.to_string())),
        }
    }

    fn lock_file(&self, path: &str) -> Result<Box<dyn LockGuard>> {
        let k = key(path);
        let mut locks = self.inner.locks.lock();
        while locks.contains(&k) {
            self.inner.released.wait(&mut locks);
        }
        locks.insert(k.clone());
        Ok(Box::new(MemLock {
            path: k,
            inner: self.inner.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_write_requires_parent() {
        let storage = MemStorage::new();
        let err = storage.open_write("missing/file").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        storage.create_dir("missing").unwrap();
        assert!(storage.open_write("missing/file").is_ok());
    }

    #[test]
    fn test_read_only_file_rejects_write() {
        let storage = MemStorage::new();
        storage.open_write("f").unwrap().write_at(0, b"x").unwrap();
        storage.set_permissions("f", 0o444).unwrap();
        let err = storage.open_write("f").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_remove_dir_requires_empty() {
        let storage = MemStorage::new();
        storage.create_dir("d").unwrap();
        storage.open_write("d/f").unwrap();
        assert_eq!(storage.remove_dir("d").err().unwrap().kind(), ErrorKind::Io);
        storage.remove_file("d/f").unwrap();
        storage.remove_dir("d").unwrap();
        assert!(!storage.is_dir("d"));
    }

    #[test]
    fn test_rename_moves_children() {
        let storage = MemStorage::new();
        storage.create_dir("a").unwrap();
        storage.create_dir("a/b").unwrap();
        storage.open_write("a/b/c").unwrap().write_at(0, b"z").unwrap();
        storage.rename("a", "moved").unwrap();
        assert!(storage.is_file("moved/b/c"));
        assert!(!storage.is_dir("a"));
    }

    #[test]
    fn test_list_dir_direct_children_only() {
        let storage = MemStorage::new();
        storage.create_dir("a").unwrap();
        storage.create_dir("a/b").unwrap();
        storage.open_write("a/b/deep").unwrap();
        storage.open_write("a/top").unwrap();
        storage.open_write("ab").unwrap();
        let mut names: Vec<_> = storage.list_dir("a").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["b", "top"]);
        assert_eq!(storage.list_dir("").unwrap().len(), 2);
    }

    #[test]
    fn test_lock_blocks_until_released() {
        let storage = MemStorage::new();
        let guard = storage.lock_file("store.lock").unwrap();
        let other = storage.clone();
        let handle = std::thread::spawn(move || {
            let _g = other.lock_file("store.lock").unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }
}
