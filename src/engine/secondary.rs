//! Secondary catch-up: a read-only instance tails the primary's manifest
//! and WAL segments to refresh its local view.
//!
//! The coordinator is a two-state machine (idle / catching-up) guarded by
//! an atomic flag: a catch-up requested while one is in flight is rejected
//! immediately, never queued. Catch-up rebuilds a complete candidate view
//! first and swaps it in atomically at the end, so readers on the secondary
//! always see either the old state or the new one. Nothing under the
//! primary's path is ever created, modified, or deleted.
//!
//! Races with the primary are expected: a table or WAL segment can rotate
//! away between listing and opening. Those surface as a recoverable
//! stale-version error and the caller simply retries.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::recovery::version_from_manifest_state;
use super::store::LsmTree;
use crate::error::{Error, Result};
use crate::manifest::{self, MANIFEST_FILE};
use crate::memtable::FrozenMemtable;
use crate::wal::recovery::list_segments;

/// Refreshes the secondary's view from the primary. Rejected with
/// [`Error::CatchUpInProgress`] while another catch-up is running.
pub fn catch_up(tree: &LsmTree) -> Result<()> {
    if !tree.is_secondary() {
        return Err(Error::NotSupported(
            "catch-up is only supported on a secondary instance".to_string(),
        ));
    }

    if tree.state.catch_up_running.swap(true, Ordering::SeqCst) {
        return Err(Error::CatchUpInProgress);
    }
    let _guard = CatchUpGuard { tree };

    do_catch_up(tree)
}

struct CatchUpGuard<'a> {
    tree: &'a LsmTree,
}

impl Drop for CatchUpGuard<'_> {
    fn drop(&mut self) {
        self.tree
            .state
            .catch_up_running
            .store(false, Ordering::SeqCst);
    }
}

fn do_catch_up(tree: &LsmTree) -> Result<()> {
    let state = &tree.state;
    let primary_dir = &tree.config.dir;

    // 1. Replay the primary's manifest read-only. A torn trailing edit
    //    (the primary mid-append) ends the replay; the next catch-up picks
    //    it up.
    let manifest_path = primary_dir.join(MANIFEST_FILE);
    let manifest_state = match manifest::replay_read_only(&manifest_path) {
        Ok(manifest_state) => manifest_state,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Config(format!(
                "no primary database at {}",
                primary_dir.display()
            )));
        }
        Err(e) => return Err(e),
    };

    // 2. Open every referenced table. A table compacted away since the
    //    replay is a stale reference; report it and let the caller retry.
    let version = match version_from_manifest_state(&tree.config, &manifest_state) {
        Ok(version) => version,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::StaleVersion(
                "table file rotated away during catch-up".to_string(),
            ));
        }
        Err(e) => return Err(e),
    };
    let table_max_seq = version.max_table_seq();

    // 3. Rebuild read-only memtables from WAL segments holding entries
    //    newer than any table.
    let mut frozen = VecDeque::new();
    let mut max_seq = table_max_seq;

    for (wal_id, path) in list_segments(primary_dir)? {
        let memtable = match FrozenMemtable::recover(&path, wal_id, state.comparator.clone()) {
            Ok(memtable) => memtable,
            Err(Error::Corruption { detail, .. }) => {
                // The primary is writing this segment's header right now;
                // its entries arrive on the next catch-up.
                tracing::debug!(wal_id = wal_id, detail = %detail, "Skipping torn WAL segment");
                continue;
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StaleVersion(
                    "WAL segment rotated away during catch-up".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        // Fully flushed segments carry nothing the tables do not.
        if memtable.max_seq() <= table_max_seq {
            continue;
        }

        max_seq = max_seq.max(memtable.max_seq());
        frozen.push_back(Arc::new(memtable));
    }

    // 4. Swap the candidate view in atomically.
    *state.frozen_memtables.write().unwrap() = frozen;
    state.install_version(version);
    state.advance_seq_floor(max_seq);

    tracing::info!(
        tables = state.current_version().table_count(),
        wal_memtables = state.frozen_memtables.read().unwrap().len(),
        caught_up_seq = max_seq,
        "Secondary caught up with primary"
    );

    Ok(())
}
