//! Host filesystem backend

use super::{DirEntry, LockGuard, ReadHandle, Storage, WriteHandle};
use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::os::unix::io::AsRawFd;

/// Files at or above this size are memory mapped for reading
const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// [`Storage`] over `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

enum FsReader {
    File(File),
    Mapped(Mmap),
}

struct FsReadHandle {
    path: String,
    size: u64,
    reader: FsReader,
}

impl ReadHandle for FsReadHandle {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &self.reader {
            FsReader::File(file) => file
                .read_exact_at(buf, offset)
                .map_err(|e| Error::from_io(e, format!("read {}", self.path))),
            FsReader::Mapped(map) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > map.len() {
                    return Err(Error::io(format!(
                        "read {}: range {}..{} past end {}",
                        self.path,
                        start,
                        end,
                        map.len()
                    )));
                }
                buf.copy_from_slice(&map[start..end]);
                Ok(())
            }
        }
    }
}

struct FsWriteHandle {
    path: String,
    file: File,
}

impl WriteHandle for FsWriteHandle {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::from_io(e, format!("write {}", self.path)))
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|e| Error::from_io(e, format!("truncate {}", self.path)))
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::from_io(e, format!("sync {}", self.path)))
    }
}

struct FsLock {
    _file: File,
}

impl LockGuard for FsLock {}

impl Storage for FsStorage {
    fn open_read(&self, path: &str) -> Result<Box<dyn ReadHandle>> {
        let file = File::open(path).map_err(|e| Error::from_io(e, path))?;
        let size = file.metadata().map_err(|e| Error::from_io(e, path))?.len();
        let reader = if size >= MMAP_THRESHOLD {
            // SAFETY: the map is read-only and sized from the open file; callers
            // must not truncate files that are being indexed.
            let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::from_io(e, path))?;
            FsReader::Mapped(map)
        } else {
            FsReader::File(file)
        };
        Ok(Box::new(FsReadHandle {
            path: path.to_string(),
            size,
            reader,
        }))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn WriteHandle>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::from_io(e, path))?;
        Ok(Box::new(FsWriteHandle {
            path: path.to_string(),
            file,
        }))
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && self.is_dir(path) => Ok(()),
            Err(e) => Err(Error::from_io(e, path)),
        }
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        fs::remove_dir(path).map_err(|e| Error::from_io(e, path))
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        fs::remove_file(path).map_err(|e| Error::from_io(e, path))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(from, to).map_err(|e| Error::from_io(e, format!("rename {} -> {}", from, to)))
    }

    fn is_dir(&self, path: &str) -> bool {
        fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    fn is_file(&self, path: &str) -> bool {
        fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| Error::from_io(e, path))? {
            let entry = entry.map_err(|e| Error::from_io(e, path))?;
            let metadata = entry.metadata().map_err(|e| Error::from_io(e, path))?;
            // Symlinks and special files are not assets
            if !metadata.is_dir() && !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(dir = path, "skipping entry with non UTF-8 name");
                continue;
            };
            entries.push(DirEntry {
                name,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                permissions: (metadata.permissions().mode() & 0o7777) as u16,
                is_dir: metadata.is_dir(),
            });
        }
        Ok(entries)
    }

    fn permissions(&self, path: &str) -> Result<u16> {
        let metadata = fs::metadata(path).map_err(|e| Error::from_io(e, path))?;
        Ok((metadata.permissions().mode() & 0o7777) as u16)
    }

    fn set_permissions(&self, path: &str, permissions: u16) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(u32::from(permissions)))
            .map_err(|e| Error::from_io(e, path))
    }

    fn lock_file(&self, path: &str) -> Result<Box<dyn LockGuard>> {
        use nix::fcntl::{flock, FlockArg};

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from_io(e, path))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)?;
        Ok(Box::new(FsLock { _file: file }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use anyhow::Result;
    use tempfile::TempDir;

    fn path_str(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = FsStorage::new();
        let path = path_str(&dir, "file.bin");

        let mut writer = storage.open_write(&path)?;
        writer.write_at(0, b"hello")?;
        writer.write_at(5, b" world")?;
        writer.flush()?;
        drop(writer);

        let mut reader = storage.open_read(&path)?;
        assert_eq!(reader.size(), 11);
        let mut buf = [0u8; 5];
        reader.read_at(6, &mut buf)?;
        assert_eq!(&buf, b"world");
        Ok(())
    }

    #[test]
    fn test_large_file_is_mapped() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = FsStorage::new();
        let path = path_str(&dir, "large.bin");
        let data: Vec<u8> = (0..MMAP_THRESHOLD as usize + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data)?;

        let mut reader = storage.open_read(&path)?;
        let mut tail = [0u8; 17];
        reader.read_at(MMAP_THRESHOLD, &mut tail)?;
        assert_eq!(&tail[..], &data[MMAP_THRESHOLD as usize..]);
        assert!(reader.read_at(MMAP_THRESHOLD + 1, &mut tail).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let storage = FsStorage::new();
        let err = storage.open_read("/definitely/not/here").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_permissions_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = FsStorage::new();
        let path = path_str(&dir, "perm.txt");
        fs::write(&path, b"x")?;

        storage.set_permissions(&path, 0o640)?;
        assert_eq!(storage.permissions(&path)?, 0o640);
        Ok(())
    }

    #[test]
    fn test_list_dir_and_lock() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = FsStorage::new();
        let root = dir.path().to_string_lossy().into_owned();
        storage.create_dir(&path_str(&dir, "sub"))?;
        storage.create_dir(&path_str(&dir, "sub"))?;
        fs::write(path_str(&dir, "a.txt"), b"abc")?;

        let mut entries = storage.list_dir(&root)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 3);
        assert!(entries[1].is_dir);

        let guard = storage.lock_file(&path_str(&dir, "store.lock"))?;
        drop(guard);
        let _again = storage.lock_file(&path_str(&dir, "store.lock"))?;
        Ok(())
    }
}
