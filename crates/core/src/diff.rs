//! Asset-level delta between two version indexes

use crate::error::{Error, Result};
use crate::hash::ContentHasher;
use crate::version_index::VersionIndex;
use ahash::AHashMap;

/// Indexes into the source and target [`VersionIndex`]
///
/// Removed assets are ordered deepest path first so directories follow their
/// contents; added assets are ordered so parents precede children. Modified
/// lists are paired position by position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDiff {
    pub source_removed: Vec<u32>,
    pub target_added: Vec<u32>,
    pub source_content_modified: Vec<u32>,
    pub target_content_modified: Vec<u32>,
    pub source_permissions_modified: Vec<u32>,
    pub target_permissions_modified: Vec<u32>,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
    }

    /// Number of assets touched by the diff
    pub fn change_count(&self) -> usize {
        self.source_removed.len()
            + self.target_added.len()
            + self.target_content_modified.len()
            + self.target_permissions_modified.len()
    }
}

fn check_hasher(hasher: &dyn ContentHasher, index: &VersionIndex, which: &str) -> Result<()> {
    if index.asset_count() > 0 && index.hash_identifier() != hasher.identifier() {
        return Err(Error::invalid(format!(
            "{} index hash identifier {:#x} does not match hasher {:#x}",
            which,
            index.hash_identifier(),
            hasher.identifier()
        )));
    }
    Ok(())
}

/// Compare `source` to `target` by asset path
///
/// Same chunk sequence and permissions: unchanged. Different chunk sequence:
/// content modified. Same sequence with different permissions: permissions
/// modified.
pub fn create_version_diff(
    hasher: &dyn ContentHasher,
    source: &VersionIndex,
    target: &VersionIndex,
) -> Result<VersionDiff> {
    check_hasher(hasher, source, "source")?;
    check_hasher(hasher, target, "target")?;

    let source_by_path: AHashMap<&str, usize> =
        (0..source.asset_count()).map(|i| (source.asset_path(i), i)).collect();
    let mut matched = vec![false; source.asset_count()];

    let mut added = Vec::new();
    let mut content = Vec::new();
    let mut permissions = Vec::new();
    for t in 0..target.asset_count() {
        let path = target.asset_path(t);
        let Some(&s) = source_by_path.get(path) else {
            added.push(t);
            continue;
        };
        matched[s] = true;
        let same_content = source.asset_size(s) == target.asset_size(t)
            && source.asset_chunk_hashes(s).eq(target.asset_chunk_hashes(t));
        if !same_content {
            content.push((s, t));
        } else if source.asset_permissions(s) != target.asset_permissions(t) {
            permissions.push((s, t));
        }
    }
    let mut removed: Vec<usize> = (0..source.asset_count()).filter(|&s| !matched[s]).collect();

    removed.sort_by(|&a, &b| source.asset_path(b).cmp(source.asset_path(a)));
    added.sort_by(|&a, &b| target.asset_path(a).cmp(target.asset_path(b)));
    content.sort_by(|a, b| target.asset_path(a.1).cmp(target.asset_path(b.1)));
    permissions.sort_by(|a, b| target.asset_path(a.1).cmp(target.asset_path(b.1)));

    let diff = VersionDiff {
        source_removed: removed.into_iter().map(|i| i as u32).collect(),
        target_added: added.into_iter().map(|i| i as u32).collect(),
        source_content_modified: content.iter().map(|&(s, _)| s as u32).collect(),
        target_content_modified: content.iter().map(|&(_, t)| t as u32).collect(),
        source_permissions_modified: permissions.iter().map(|&(s, _)| s as u32).collect(),
        target_permissions_modified: permissions.iter().map(|&(_, t)| t as u32).collect(),
    };
    tracing::debug!(
        removed = diff.source_removed.len(),
        added = diff.target_added.len(),
        modified = diff.target_content_modified.len(),
        permissions = diff.target_permissions_modified.len(),
        "version diff"
    );
    Ok(diff)
}
