//! The LSM-tree engine: write path, read path, flush/compaction machinery,
//! recovery, and the secondary catch-up coordinator.

pub mod compaction;
pub mod flush;
pub mod iterator;
pub mod metrics;
pub mod properties;
pub mod recovery;
pub mod secondary;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod tasks;
pub mod wal_cleanup;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::manifest::{LevelMeta, Manifest, Version, VersionEdit};

pub use iterator::{CompactionIterator, MergeIterator, ReadResolver};
pub use snapshot::Snapshot;
pub use state::{LsmState, StateMetrics};
pub use store::LsmTree;

pub const SST_DIR: &str = "sst";

pub(crate) fn table_path(dir: &Path, table_id: u64) -> PathBuf {
    dir.join(SST_DIR).join(format!("{:08}.sst", table_id))
}

pub(crate) fn wal_path(dir: &Path, wal_id: u64) -> PathBuf {
    dir.join(crate::wal::recovery::WAL_DIR)
        .join(format!("{}.wal", wal_id))
}

/// Appends a full-state snapshot edit when enough incremental edits have
/// accumulated, keeping manifest replay bounded.
pub(crate) fn maybe_write_manifest_snapshot(
    manifest: &Manifest,
    version: &Version,
    state: &LsmState,
) -> Result<()> {
    if !manifest.should_snapshot() {
        return Ok(());
    }

    let levels: Vec<LevelMeta> = version
        .levels()
        .iter()
        .map(|level| LevelMeta {
            level: level.level_num,
            tables: level
                .tables
                .iter()
                .map(|table| table.meta(level.level_num))
                .collect(),
        })
        .collect();

    let seq = manifest.next_seq();
    manifest.append(VersionEdit::Snapshot {
        seq,
        levels,
        next_table_id: state.next_table_id.load(Ordering::SeqCst),
    })?;
    manifest.sync()?;
    manifest.note_snapshot_written();

    tracing::debug!(seq = seq, "Wrote manifest snapshot");
    Ok(())
}
