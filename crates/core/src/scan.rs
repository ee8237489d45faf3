//! Recursive directory scanning with include/exclude filters

use crate::error::{Error, Result};
use crate::job::CancelToken;
use crate::storage::Storage;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Relative paths, sizes and permissions of a scanned tree
///
/// Sorted by path. Directory paths end with `/` and have size 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfos {
    pub paths: Vec<String>,
    pub sizes: Vec<u64>,
    pub permissions: Vec<u16>,
}

impl FileInfos {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn push(&mut self, path: String, size: u64, permissions: u16) {
        self.paths.push(path);
        self.sizes.push(size);
        self.permissions.push(permissions);
    }

    /// Total size of all files
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().sum()
    }

    fn sort(&mut self) {
        let mut order: Vec<usize> = (0..self.paths.len()).collect();
        order.sort_by(|&a, &b| self.paths[a].cmp(&self.paths[b]));
        self.paths = order.iter().map(|&i| std::mem::take(&mut self.paths[i])).collect();
        self.sizes = order.iter().map(|&i| self.sizes[i]).collect();
        self.permissions = order.iter().map(|&i| self.permissions[i]).collect();
    }
}

/// Decides which assets a scan includes
///
/// `asset_path` is relative to `root`; directories end with `/`. Excluding
/// a directory also skips everything below it.
pub trait PathFilter: Send + Sync {
    fn include(&self, root: &str, asset_path: &str, is_dir: bool, size: u64, permissions: u16) -> bool;
}

impl<F> PathFilter for F
where
    F: Fn(&str, bool) -> bool + Send + Sync,
{
    fn include(&self, _root: &str, asset_path: &str, is_dir: bool, _size: u64, _permissions: u16) -> bool {
        self(asset_path, is_dir)
    }
}

/// Gitignore-style exclude patterns
///
/// Matching patterns exclude; `!pattern` re-includes.
pub struct GlobFilter {
    matcher: Gitignore,
}

impl GlobFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            builder
                .add_line(None, pattern.as_ref())
                .map_err(|e| Error::invalid(format!("bad pattern {}: {}", pattern.as_ref(), e)))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| Error::invalid(format!("bad pattern set: {}", e)))?;
        Ok(Self { matcher })
    }
}

impl PathFilter for GlobFilter {
    fn include(&self, _root: &str, asset_path: &str, is_dir: bool, _size: u64, _permissions: u16) -> bool {
        let path = asset_path.trim_end_matches('/');
        !self
            .matcher
            .matched_path_or_any_parents(Path::new(path), is_dir)
            .is_ignore()
    }
}

/// Recursively list `root` through `storage`
pub fn get_files_recursively(
    storage: &dyn Storage,
    root: &str,
    filter: Option<&dyn PathFilter>,
    cancel: Option<&CancelToken>,
) -> Result<FileInfos> {
    if !storage.is_dir(root) {
        return Err(Error::not_found(format!("scan root {}", root)));
    }

    let mut infos = FileInfos::default();
    let mut pending = vec![String::new()];
    while let Some(relative) = pending.pop() {
        if let Some(token) = cancel {
            token.check()?;
        }
        let dir = storage.join(root, &relative);
        for entry in storage.list_dir(&dir)? {
            let asset_path = if entry.is_dir {
                format!("{}{}/", relative, entry.name)
            } else {
                format!("{}{}", relative, entry.name)
            };
            if let Some(filter) = filter {
                if !filter.include(root, &asset_path, entry.is_dir, entry.size, entry.permissions) {
                    tracing::trace!(path = %asset_path, "excluded by filter");
                    continue;
                }
            }
            if entry.is_dir {
                pending.push(asset_path.clone());
            }
            infos.push(asset_path, entry.size, entry.permissions);
        }
    }
    infos.sort();
    tracing::debug!(root, assets = infos.len(), bytes = infos.total_size(), "scanned");
    Ok(infos)
}
