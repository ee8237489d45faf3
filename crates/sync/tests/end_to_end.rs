//! Upload a tree, then rebuild it elsewhere from the block store

mod common;

use anyhow::Result;
use common::{engine, fs_storage, path_str, random_bytes, snapshot, write_tree, Workspace};
use depot_core::{create_missing_content, create_version_diff, Blake3Hasher, ContentHasher, StoreIndex, VersionIndex};
use depot_sync::CallOptions;
use std::fs;
use std::sync::Arc;

fn publish_and_install(ws: &Workspace, current: &VersionIndex) -> Result<(VersionIndex, VersionIndex)> {
    let engine = engine();
    let call = CallOptions::default();
    let remote = engine.open_block_store(fs_storage(), &ws.remote())?;
    let uploaded = engine.upload_version(fs_storage(), &path_str(&ws.src()), None, remote.clone(), &call)?;
    let target = Arc::new(uploaded.version);
    engine.update_version(
        fs_storage(),
        &ws.cache(),
        remote,
        fs_storage(),
        &path_str(&ws.install()),
        Arc::new(current.clone()),
        target.clone(),
        true,
        &call,
    )?;
    let installed = engine.get_current_version_index(fs_storage(), &path_str(&ws.install()), None, target.clone(), &call)?;
    Ok(((*target).clone(), installed))
}

#[test]
fn test_small_files_roundtrip() -> Result<()> {
    let ws = Workspace::new()?;
    write_tree(
        &ws.src(),
        &[
            ("empty.bin", Vec::new()),
            ("small.bin", random_bytes(1, 500)),
            ("nested/large.bin", random_bytes(2, 5000)),
        ],
    )?;

    let empty = VersionIndex::empty(Blake3Hasher.identifier(), 512);
    let (target, installed) = publish_and_install(&ws, &empty)?;

    assert_eq!(snapshot(&ws.install())?, snapshot(&ws.src())?);
    assert_eq!(installed, target);
    assert!(ws.install().join("nested").is_dir());
    Ok(())
}

#[test]
fn test_missing_content_against_empty_store_lists_every_chunk() -> Result<()> {
    let ws = Workspace::new()?;
    write_tree(&ws.src(), &[("a", random_bytes(3, 5000)), ("b", random_bytes(4, 500))])?;
    let engine = engine();
    let call = CallOptions::default();
    let storage = fs_storage();
    let src = path_str(&ws.src());
    let infos = engine.get_files_recursively(storage.as_ref(), &src, None, &call)?;
    let version = engine.create_version_index(storage.as_ref(), &src, &infos, &call)?;

    let empty = StoreIndex::empty(version.hash_identifier(), 2048, 1024);
    let missing = create_missing_content(&Blake3Hasher, &empty, &version, 2048, 1024)?;
    assert_eq!(missing.chunk_count(), version.chunk_count());
    for block in 0..missing.block_count() {
        assert!(missing.block_size(block) <= 2048);
    }
    Ok(())
}

#[test]
fn test_incremental_update() -> Result<()> {
    let ws = Workspace::new()?;
    let shared = random_bytes(10, 20_000);
    write_tree(
        &ws.src(),
        &[
            ("keep.bin", shared.clone()),
            ("edit.bin", random_bytes(11, 8000)),
            ("old/gone.bin", random_bytes(12, 3000)),
        ],
    )?;
    let empty = VersionIndex::empty(Blake3Hasher.identifier(), 512);
    let (v1, installed) = publish_and_install(&ws, &empty)?;
    assert_eq!(installed, v1);

    // Append to one file, drop a directory, add another
    let mut edited = random_bytes(11, 8000);
    edited.extend(random_bytes(13, 1000));
    fs::write(ws.src().join("edit.bin"), &edited)?;
    fs::remove_dir_all(ws.src().join("old"))?;
    write_tree(&ws.src(), &[("new/added.bin", random_bytes(14, 700))])?;

    let (v2, installed) = publish_and_install(&ws, &v1)?;
    let diff = create_version_diff(&Blake3Hasher, &v1, &v2)?;
    assert_eq!(diff.target_content_modified.len(), 1);
    assert!(!diff.source_removed.is_empty());
    assert!(!diff.target_added.is_empty());

    assert_eq!(installed, v2);
    assert_eq!(snapshot(&ws.install())?, snapshot(&ws.src())?);
    assert!(!ws.install().join("old").exists());
    Ok(())
}

#[test]
fn test_update_reuses_local_cache() -> Result<()> {
    let ws = Workspace::new()?;
    write_tree(&ws.src(), &[("data.bin", random_bytes(20, 6000))])?;
    let engine = engine();
    let call = CallOptions::default();
    let remote = engine.open_block_store(fs_storage(), &ws.remote())?;
    let uploaded = engine.upload_version(fs_storage(), &path_str(&ws.src()), None, remote.clone(), &call)?;
    let target = Arc::new(uploaded.version);
    let empty = Arc::new(VersionIndex::empty(target.hash_identifier(), target.target_chunk_size()));

    let first = engine.update_version(
        fs_storage(),
        &ws.cache(),
        remote.clone(),
        fs_storage(),
        &path_str(&ws.dir.path().join("one")),
        empty.clone(),
        target.clone(),
        true,
        &call,
    )?;
    let second = engine.update_version(
        fs_storage(),
        &ws.cache(),
        remote,
        fs_storage(),
        &path_str(&ws.dir.path().join("two")),
        empty,
        target,
        true,
        &call,
    )?;
    assert!(first.block_get_count > 0);
    assert_eq!(second.block_get_count, first.block_get_count);
    assert_eq!(snapshot(&ws.dir.path().join("one"))?, snapshot(&ws.dir.path().join("two"))?);
    Ok(())
}
