//! Rebuilds memtables from the WAL directory on startup.
//!
//! Segments are ordered by their numeric ID. All but the newest become
//! frozen memtables queued for flushing; the newest is reopened as the
//! active memtable and keeps accepting appends.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::memtable::{ActiveMemtable, FrozenMemtable};
use crate::wal::WalOptions;

pub const WAL_DIR: &str = "wal";

pub type MemtableRecovery = (ActiveMemtable, VecDeque<Arc<FrozenMemtable>>, u64);

/// Lists WAL segment paths under `dir/wal`, sorted by segment ID.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let wal_dir = dir.join(WAL_DIR);
    if !wal_dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<(u64, PathBuf)> = std::fs::read_dir(&wal_dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension()?.to_str()? != "wal" {
                return None;
            }
            let id = path.file_stem()?.to_str()?.parse::<u64>().ok()?;
            Some((id, path))
        })
        .collect();

    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Recovers memtables from the WAL directory of a read-write instance.
pub fn recover_memtables(
    dir: &Path,
    wal_options: impl Fn() -> WalOptions,
    comparator: Arc<dyn Comparator>,
) -> Result<MemtableRecovery> {
    let wal_dir = dir.join(WAL_DIR);
    std::fs::create_dir_all(&wal_dir)?;

    let segments = list_segments(dir)?;

    let mut frozen_memtables = VecDeque::new();
    let mut next_wal_id = 0;

    // All but the newest segment become frozen memtables.
    if segments.len() > 1 {
        for (wal_id, path) in &segments[..segments.len() - 1] {
            next_wal_id = next_wal_id.max(wal_id + 1);
            let frozen = FrozenMemtable::recover(path, *wal_id, comparator.clone())?;
            frozen_memtables.push_back(Arc::new(frozen));
        }
    }

    // The newest segment resumes as the active memtable.
    let active_memtable = match segments.last() {
        Some((wal_id, path)) => {
            next_wal_id = next_wal_id.max(wal_id + 1);
            ActiveMemtable::recover(path, *wal_id, wal_options(), comparator)?
        }
        None => {
            let wal_id = next_wal_id;
            next_wal_id += 1;
            let path = wal_dir.join(format!("{}.wal", wal_id));
            ActiveMemtable::new(path, wal_id, wal_options(), comparator)?
        }
    };

    Ok((active_memtable, frozen_memtables, next_wal_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::entry::{Entry, Operation};
    use crate::tmpfs::TempDir;
    use crate::wal::Wal;

    fn comparator() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn write_segment(dir: &Path, wal_id: u64, entries: &[Entry]) {
        let wal_dir = dir.join(WAL_DIR);
        std::fs::create_dir_all(&wal_dir).expect("create wal dir");
        let wal = Wal::new(wal_dir.join(format!("{}.wal", wal_id))).expect("wal");
        for entry in entries {
            wal.append(entry).expect("append");
        }
        wal.flush().expect("flush");
    }

    fn put(key: &[u8], seq: u64, value: &[u8]) -> Entry {
        Entry::new(key.to_vec(), seq, Operation::Put(value.to_vec()))
    }

    #[test]
    fn test_recover_empty_dir_creates_fresh_active() {
        let dir = TempDir::new().expect("temp dir");
        let (active, frozen, next_id) =
            recover_memtables(dir.path(), WalOptions::default, comparator()).expect("recover");

        assert!(frozen.is_empty());
        assert_eq!(next_id, 1);
        assert_eq!(active.size(), 0);
        assert_eq!(active.wal_id(), 0);
    }

    #[test]
    fn test_recover_single_segment_becomes_active() {
        let dir = TempDir::new().expect("temp dir");
        write_segment(dir.path(), 0, &[put(b"key1", 1, b"value1")]);

        let (active, frozen, next_id) =
            recover_memtables(dir.path(), WalOptions::default, comparator()).expect("recover");

        assert!(frozen.is_empty());
        assert_eq!(next_id, 1);
        assert_eq!(
            active.first_visible(b"key1", u64::MAX),
            Some((1, Operation::Put(b"value1".to_vec())))
        );
    }

    #[test]
    fn test_recover_multiple_segments() {
        let dir = TempDir::new().expect("temp dir");
        write_segment(dir.path(), 0, &[put(b"key0", 1, b"v0")]);
        write_segment(dir.path(), 1, &[put(b"key1", 2, b"v1")]);
        write_segment(dir.path(), 2, &[put(b"key2", 3, b"v2")]);

        let (active, frozen, next_id) =
            recover_memtables(dir.path(), WalOptions::default, comparator()).expect("recover");

        // All but the newest segment become frozen memtables, oldest first.
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen[0].wal_id(), 0);
        assert_eq!(frozen[1].wal_id(), 1);
        assert_eq!(next_id, 3);
        assert_eq!(
            active.first_visible(b"key2", u64::MAX),
            Some((3, Operation::Put(b"v2".to_vec())))
        );
    }

    #[test]
    fn test_recovered_active_accepts_writes() {
        let dir = TempDir::new().expect("temp dir");
        write_segment(dir.path(), 5, &[put(b"key", 1, b"v")]);

        let (active, _, next_id) =
            recover_memtables(dir.path(), WalOptions::default, comparator()).expect("recover");

        assert_eq!(next_id, 6);
        active.put(put(b"key2", 2, b"v2")).expect("put");
        active.sync().expect("sync");
    }
}
