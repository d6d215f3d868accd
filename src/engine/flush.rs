//! Flush: convert the oldest frozen memtable into a level-0 table file.
//!
//! The memtable stays in the frozen queue (and keeps serving reads) until
//! the table is fully built and the new version installed, so there is no
//! window where its data is invisible. A failed flush leaves the manifest
//! untouched; the scheduler retries on the next tick.

use std::sync::Arc;

use super::store::LsmTree;
use super::{maybe_write_manifest_snapshot, table_path};
use crate::error::{Error, Result};
use crate::manifest::{SSTable, TableMeta, VersionEdit};

/// Flushes the oldest frozen memtable. Returns `false` when there was
/// nothing to flush or another flush already claimed the slot.
pub async fn flush_memtable(tree: &LsmTree) -> Result<bool> {
    if !tree.state.needs_flush() || !tree.state.try_mark_flush_pending() {
        return Ok(false);
    }

    let result = do_flush(tree);
    tree.state.mark_flush_completed();
    result
}

fn do_flush(tree: &LsmTree) -> Result<bool> {
    let state = &tree.state;
    let config = &tree.config;

    // Peek rather than pop: the memtable must keep serving reads until the
    // table file is installed.
    let memtable = match state.frozen_memtables.read().unwrap().front().cloned() {
        Some(memtable) => memtable,
        None => return Ok(false),
    };

    let wal_id = memtable.wal_id();
    let table_id = state.next_table_id();
    let path = table_path(&config.dir, table_id);

    let mut builder = crate::sstable::TableBuilder::new(
        &path,
        state.comparator.clone(),
        config.options.block_size,
        config.options.bloom_bits_per_key,
    )?;

    for entry in memtable.scan(.., u64::MAX) {
        builder.add(&entry?)?;
    }

    // An empty memtable (all its writes raced into the next one) produces
    // no table; just retire it.
    if builder.entry_count() == 0 {
        drop(builder);
        let _ = std::fs::remove_file(&path);
        state.frozen_memtables.write().unwrap().pop_front();
        remove_wal_file(tree, wal_id);
        return Ok(true);
    }

    let summary = builder.finish()?;
    let table_meta = TableMeta {
        id: table_id,
        level: 0,
        size: summary.file_size,
        entry_count: summary.entry_count,
        min_key: summary.min_key,
        max_key: summary.max_key,
        max_seq: summary.max_seq,
    };

    // Durably record the new table before making it visible.
    {
        let manifest = state.manifest.read().unwrap();
        let manifest = manifest.as_ref().ok_or_else(|| {
            Error::NotSupported("flush on a read-only instance".to_string())
        })?;
        let seq = manifest.next_seq();
        manifest.append(VersionEdit::Flush {
            seq,
            table: table_meta.clone(),
            wal_id,
        })?;
        manifest.sync()?;
    }

    let sstable = Arc::new(SSTable::open(path, &table_meta, state.comparator.clone())?);
    let new_version = state.current_version().with_flushed(sstable);
    state.install_version(new_version);

    // The table is visible; the memtable and its WAL segment can go.
    state.frozen_memtables.write().unwrap().pop_front();
    remove_wal_file(tree, wal_id);

    {
        let manifest = state.manifest.read().unwrap();
        if let Some(manifest) = manifest.as_ref() {
            maybe_write_manifest_snapshot(manifest, &state.current_version(), state)?;
        }
    }

    tracing::info!(
        table_id = table_id,
        wal_id = wal_id,
        entries = table_meta.entry_count,
        size = table_meta.size,
        "Flushed memtable to table file"
    );

    if let Err(e) = state.validate_consistency() {
        tracing::warn!(error = %e, "State inconsistency detected after flush");
    }

    Ok(true)
}

fn remove_wal_file(tree: &LsmTree, wal_id: u64) {
    let wal_path = super::wal_path(&tree.config.dir, wal_id);
    match std::fs::remove_file(&wal_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(wal_id = wal_id, error = %e, "Failed to delete WAL segment");
        }
    }
}
