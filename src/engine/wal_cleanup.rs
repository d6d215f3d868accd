//! Retires WAL segments whose contents are durably reflected in table
//! files. The flush path deletes segments eagerly; this sweep catches any
//! it missed (a crash between manifest install and file deletion).

use std::collections::HashSet;

use super::state::LsmState;
use super::store::LsmTree;
use crate::error::Result;

/// Segment IDs that the manifest records as flushed, minus the segments
/// still backing live memtables.
pub fn deletable_wals(state: &LsmState) -> Result<Vec<u64>> {
    let manifest_state = {
        let manifest = state.manifest.read().unwrap();
        match manifest.as_ref() {
            Some(manifest) => manifest.replay()?,
            None => return Ok(Vec::new()),
        }
    };

    let mut live: HashSet<u64> = HashSet::new();
    live.insert(state.active_memtable.read().unwrap().wal_id());
    for memtable in state.frozen_memtables.read().unwrap().iter() {
        live.insert(memtable.wal_id());
    }

    let mut deletable: Vec<u64> = manifest_state
        .flushed_wals
        .into_iter()
        .filter(|id| !live.contains(id))
        .collect();
    deletable.sort_unstable();
    deletable.dedup();
    Ok(deletable)
}

pub async fn cleanup_wals(tree: &LsmTree) -> Result<()> {
    let deletable = deletable_wals(&tree.state)?;
    if deletable.is_empty() {
        return Ok(());
    }

    tracing::debug!(segments = ?deletable, "Cleaning up flushed WAL segments");

    for wal_id in deletable {
        let wal_path = super::wal_path(&tree.config.dir, wal_id);
        match std::fs::remove_file(&wal_path) {
            Ok(()) => {
                tracing::info!(wal_id = wal_id, "Deleted WAL segment");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(wal_id = wal_id, error = %e, "Failed to delete WAL segment");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::tmpfs::TempDir;

    #[tokio::test]
    async fn test_fresh_store_has_no_deletable_wals() {
        let dir = TempDir::new().expect("temp dir");
        let store = LsmTree::open(dir.path(), Options::default()).expect("open");

        assert!(store.deletable_wals().expect("deletable").is_empty());
        store.cleanup_wals().await.expect("cleanup");
    }

    #[tokio::test]
    async fn test_cleanup_after_flush_is_harmless() {
        let dir = TempDir::new().expect("temp dir");
        let store = LsmTree::open(dir.path(), Options::default()).expect("open");

        for i in 0..10 {
            let key = format!("key_{:03}", i);
            store.put(key.as_bytes(), b"v".to_vec(), false).expect("put");
        }
        store.freeze_active_memtable().expect("freeze");
        assert!(store.flush_memtable().await.expect("flush"));

        // The flush already removed its segment; the sweep finds nothing
        // live to delete and data stays readable.
        store.cleanup_wals().await.expect("cleanup");
        for i in 0..10 {
            let key = format!("key_{:03}", i);
            assert!(store.get(key.as_bytes()).expect("get").is_some());
        }
    }

    #[tokio::test]
    async fn test_cleanup_removes_orphaned_segment() {
        let dir = TempDir::new().expect("temp dir");
        let store = LsmTree::open(dir.path(), Options::default()).expect("open");

        store.put(b"key", b"v".to_vec(), false).expect("put");
        let flushed_wal = store.state.active_memtable.read().unwrap().wal_id();
        store.freeze_active_memtable().expect("freeze");
        assert!(store.flush_memtable().await.expect("flush"));

        // Simulate the crash window: recreate the already-flushed segment.
        let orphan = super::super::wal_path(dir.path(), flushed_wal);
        crate::wal::Wal::new(&orphan).expect("wal");
        assert!(orphan.exists());

        assert_eq!(store.deletable_wals().expect("deletable"), vec![flushed_wal]);
        store.cleanup_wals().await.expect("cleanup");
        assert!(!orphan.exists());
    }
}
