//! Tiered compaction.
//!
//! Levels hold exponentially growing runs of table files. Level 0 collects
//! flushed memtables whose key ranges overlap freely; deeper levels hold
//! progressively larger, older data. Compaction merges one level into the
//! next when it has too many tables (level 0 and the last level) or grows
//! too large relative to the level below it (the size-ratio rule), bounding
//! how many files a read must consult.
//!
//! A compaction never mutates visible state until its outputs are durable:
//! inputs are read through `Arc` references, outputs are written and
//! recorded in the manifest, and only then does the version swap make them
//! visible and retire the inputs. Readers holding the old version keep
//! their files until they finish; a failed job leaves everything as it was.

use std::sync::Arc;

use super::iterator::{CompactionIterator, EntryIterator, MergeIterator, OwningTableIter};
use super::store::LsmTree;
use super::{maybe_write_manifest_snapshot, table_path};
use crate::config::MutableOptions;
use crate::error::{Error, Result};
use crate::manifest::{SSTable, TableMeta, Version, VersionEdit};
use crate::sstable::TableBuilder;

/// Whether any level currently needs compaction (and none is running).
pub fn needs_compaction(state: &super::LsmState) -> bool {
    if !state.compaction_idle() {
        return false;
    }
    let mutable = state.mutable.read().unwrap().clone();
    find_compaction_level(&state.current_version(), &mutable).is_some()
}

/// Picks the level to compact, if any:
/// 1. Level 0 first, once its table count passes the threshold, since its
///    overlapping tables are the biggest read-cost multiplier.
/// 2. An intermediate level whose size dwarfs the next level by the
///    configured ratio.
/// 3. The last level, by table count, since it has no level below to
///    compare against.
pub fn find_compaction_level(version: &Version, config: &MutableOptions) -> Option<u32> {
    let levels = version.levels();

    if !levels.is_empty() && levels[0].table_count() > config.level0_compaction_threshold {
        return Some(0);
    }

    for (level_idx, current_level) in levels.iter().enumerate().skip(1) {
        if current_level.table_count() < config.max_tables_per_level {
            continue;
        }

        let level_num = level_idx as u32;

        let is_last_level = level_idx == levels.len() - 1;
        if is_last_level {
            return Some(level_num);
        }

        let current_size = current_level.size();
        let next_size = levels[level_idx + 1].size().max(1);
        if current_size / next_size >= config.size_ratio_threshold as u64 {
            return Some(level_num);
        }
    }

    None
}

/// Runs one round of tiered compaction if any level needs it.
pub async fn compact(tree: &LsmTree) -> Result<()> {
    let state = &tree.state;
    let config = &tree.config;
    let _guard = state.start_compaction();

    let mutable = state.mutable.read().unwrap().clone();
    let version = state.current_version();

    let source_level = match find_compaction_level(&version, &mutable) {
        Some(level) => level,
        None => return Ok(()),
    };
    let target_level = source_level + 1;

    let source_tables: Vec<Arc<SSTable>> = version.levels()[source_level as usize].tables.clone();
    if source_tables.is_empty() {
        return Ok(());
    }
    let source_ids: Vec<u64> = source_tables.iter().map(|t| t.id).collect();

    tracing::info!(
        source_level = source_level,
        target_level = target_level,
        source_tables = source_tables.len(),
        "Starting tiered compaction"
    );

    // Merge all inputs; duplicate keys resolve by sequence number inside
    // the compaction iterator regardless of which file they came from.
    let mut iterators: Vec<EntryIterator> = Vec::new();
    for table in &source_tables {
        iterators.push(Box::new(OwningTableIter::new(
            table.clone(),
            (std::ops::Bound::Unbounded, std::ops::Bound::Unbounded),
        )?));
    }

    let merged = MergeIterator::new(iterators, state.comparator.clone());
    let compaction_iter = CompactionIterator::new(
        merged,
        state.comparator.clone(),
        version.is_bottom_level(target_level),
        state.min_active_snapshot(),
        state.merge_operator.clone(),
    );

    // Write outputs, cutting a new file at the target size.
    let target_file_size = (mutable.write_buffer_size as u64).saturating_mul(2);
    let mut outputs: Vec<TableMeta> = Vec::new();
    let mut builder: Option<(u64, TableBuilder)> = None;

    for entry in compaction_iter {
        let entry = entry?;

        // Cut the output only at key boundaries so every version of a key
        // lands in one file, keeping deeper levels non-overlapping.
        let should_cut = builder.as_ref().is_some_and(|(_, b)| {
            b.estimated_size() >= target_file_size
                && b.last_user_key().is_some_and(|last| {
                    state.comparator.compare(last, &entry.key) != std::cmp::Ordering::Equal
                })
        });
        if should_cut {
            let (table_id, finished) = builder.take().unwrap();
            outputs.push(finish_output(finished, table_id, target_level)?);
        }

        if builder.is_none() {
            let table_id = state.next_table_id();
            let path = table_path(&config.dir, table_id);
            builder = Some((
                table_id,
                TableBuilder::new(
                    &path,
                    state.comparator.clone(),
                    config.options.block_size,
                    config.options.bloom_bits_per_key,
                )?,
            ));
        }

        builder.as_mut().unwrap().1.add(&entry)?;
    }

    if let Some((table_id, finished)) = builder.take() {
        outputs.push(finish_output(finished, table_id, target_level)?);
    }

    // Durably record the job, then swap the version.
    let job_id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;

    {
        let manifest = state.manifest.read().unwrap();
        let manifest = manifest.as_ref().ok_or_else(|| {
            Error::NotSupported("compaction on a read-only instance".to_string())
        })?;

        let begin_seq = manifest.next_seq();
        manifest.append(VersionEdit::BeginCompaction {
            seq: begin_seq,
            job_id,
            source_level,
            target_level,
        })?;

        let commit_seq = manifest.next_seq();
        manifest.append(VersionEdit::CommitCompaction {
            seq: commit_seq,
            job_id,
            source_level,
            deleted_tables: source_ids.clone(),
            target_level,
            added_tables: outputs.clone(),
        })?;
        manifest.sync()?;
    }

    let mut added = Vec::with_capacity(outputs.len());
    for meta in &outputs {
        let path = table_path(&config.dir, meta.id);
        added.push(Arc::new(SSTable::open(
            path,
            meta,
            state.comparator.clone(),
        )?));
    }

    // Base the swap on the freshest version: a concurrent flush may have
    // appended level-0 tables that must survive.
    let new_version = state.current_version().with_compacted(
        source_level,
        &source_ids,
        target_level,
        added,
        state.comparator.as_ref(),
    );
    state.install_version(new_version);

    // Input files disappear once the last reader lets go of them.
    for table in &source_tables {
        table.mark_obsolete();
    }

    {
        let manifest = state.manifest.read().unwrap();
        if let Some(manifest) = manifest.as_ref() {
            maybe_write_manifest_snapshot(manifest, &state.current_version(), state)?;
        }
    }

    tracing::info!(
        source_level = source_level,
        target_level = target_level,
        source_tables = source_ids.len(),
        output_tables = outputs.len(),
        "Completed tiered compaction"
    );

    if let Err(e) = state.validate_consistency() {
        tracing::warn!(error = %e, "State inconsistency detected after compaction");
    }

    Ok(())
}

fn finish_output(builder: TableBuilder, table_id: u64, target_level: u32) -> Result<TableMeta> {
    let summary = builder.finish()?;
    Ok(TableMeta {
        id: table_id,
        level: target_level,
        size: summary.file_size,
        entry_count: summary.entry_count,
        min_key: summary.min_key,
        max_key: summary.max_key,
        max_seq: summary.max_seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::merge::AppendOperator;
    use crate::tmpfs::TempDir;

    fn test_options() -> Options {
        Options::default()
            .level0_compaction_threshold(2)
            .size_ratio_threshold(2)
            .max_tables_per_level(3)
    }

    fn create_store(dir: &TempDir) -> LsmTree {
        LsmTree::open(dir.path(), test_options()).expect("Failed to open store")
    }

    async fn populate_tables(store: &LsmTree, table_count: usize) {
        for table_idx in 0..table_count {
            for i in 0..100 {
                let key = format!("key_{:03}_{:03}", table_idx, i);
                store
                    .put(key.as_bytes(), format!("value_{}", i).into_bytes(), false)
                    .expect("put");
            }
            store.freeze_active_memtable().expect("freeze");
            while store.flush_memtable().await.expect("flush") {}
        }
    }

    fn verify_scan_integrity(store: &LsmTree, expected_entries: usize) {
        let entries: Vec<_> = store
            .scan(..)
            .expect("scan")
            .collect::<Result<Vec<_>>>()
            .expect("entries");

        assert_eq!(entries.len(), expected_entries);
        for pair in entries.windows(2) {
            assert!(pair[0].0 < pair[1].0, "scan must stay key-ordered");
        }
    }

    #[tokio::test]
    async fn test_l0_to_l1_compaction() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        populate_tables(&store, 3).await;

        {
            let version = store.state.current_version();
            assert!(version.levels()[0].table_count() >= 3);
        }
        assert!(store.needs_compaction());

        store.compact().await.expect("compact");

        {
            let version = store.state.current_version();
            assert!(version.level_count() >= 2);
            assert_eq!(version.levels()[0].table_count(), 0);
            assert!(version.levels()[1].table_count() > 0);
        }

        verify_scan_integrity(&store, 300);
    }

    #[tokio::test]
    async fn test_compaction_resolves_overlapping_keys() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        // The same keys written three times, each into its own table.
        for round in 0..3 {
            for i in 0..50 {
                let key = format!("key_{:03}", i);
                let value = format!("value_{}_{}", round, i);
                store
                    .put(key.as_bytes(), value.into_bytes(), false)
                    .expect("put");
            }
            store.freeze_active_memtable().expect("freeze");
            while store.flush_memtable().await.expect("flush") {}
        }

        store.compact().await.expect("compact");

        for i in 0..50 {
            let key = format!("key_{:03}", i);
            assert_eq!(
                store.get(key.as_bytes()).expect("get"),
                Some(format!("value_2_{}", i).into_bytes()),
                "latest write must win for {}",
                key
            );
        }
    }

    #[tokio::test]
    async fn test_compaction_drops_deleted_keys_at_bottom() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        for i in 0..20 {
            let key = format!("key_{:03}", i);
            store.put(key.as_bytes(), b"v".to_vec(), false).expect("put");
        }
        store.freeze_active_memtable().expect("freeze");
        while store.flush_memtable().await.expect("flush") {}

        for i in 0..10 {
            let key = format!("key_{:03}", i);
            store.delete(key.as_bytes(), false).expect("delete");
        }
        store.freeze_active_memtable().expect("freeze");
        while store.flush_memtable().await.expect("flush") {}

        // One more table to pass the L0 threshold.
        store.put(b"other", b"v".to_vec(), false).expect("put");
        store.freeze_active_memtable().expect("freeze");
        while store.flush_memtable().await.expect("flush") {}

        store.compact().await.expect("compact");

        for i in 0..10 {
            let key = format!("key_{:03}", i);
            assert_eq!(store.get(key.as_bytes()).expect("get"), None);
        }
        for i in 10..20 {
            let key = format!("key_{:03}", i);
            assert!(store.get(key.as_bytes()).expect("get").is_some());
        }

        // Deleted keys are physically gone, not just masked.
        let entries: Vec<_> = store
            .scan(..)
            .expect("scan")
            .collect::<Result<Vec<_>>>()
            .expect("entries");
        assert_eq!(entries.len(), 11);
    }

    #[tokio::test]
    async fn test_compaction_preserves_snapshot_versions() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        store.put(b"key", b"old".to_vec(), false).expect("put");
        store.freeze_active_memtable().expect("freeze");
        while store.flush_memtable().await.expect("flush") {}

        let snapshot = store.snapshot();

        for round in 0..3 {
            store
                .put(b"key", format!("new_{}", round).into_bytes(), false)
                .expect("put");
            store.freeze_active_memtable().expect("freeze");
            while store.flush_memtable().await.expect("flush") {}
        }

        store.compact().await.expect("compact");

        assert_eq!(
            store.get_at(b"key", snapshot.seq()).expect("get"),
            Some(b"old".to_vec()),
            "snapshot reads must survive compaction"
        );
        assert_eq!(store.get(b"key").expect("get"), Some(b"new_2".to_vec()));
    }

    #[tokio::test]
    async fn test_compaction_folds_merge_operands() {
        let dir = TempDir::new().expect("temp dir");
        let options = test_options().merge_operator(Arc::new(AppendOperator::default()));
        let store = LsmTree::open(dir.path(), options).expect("open");

        store.put(b"key", b"base".to_vec(), false).expect("put");
        store.freeze_active_memtable().expect("freeze");
        while store.flush_memtable().await.expect("flush") {}

        for operand in ["one", "two"] {
            store
                .merge(b"key", operand.as_bytes().to_vec(), false)
                .expect("merge");
            store.freeze_active_memtable().expect("freeze");
            while store.flush_memtable().await.expect("flush") {}
        }

        let before = store.get(b"key").expect("get");
        store.compact().await.expect("compact");
        let after = store.get(b"key").expect("get");

        // Physically folding the operands must not change the answer.
        assert_eq!(before, after);
        assert_eq!(after, Some(b"base,one,two".to_vec()));
    }

    #[tokio::test]
    async fn test_compaction_noop_below_thresholds() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        store.put(b"key", b"v".to_vec(), false).expect("put");
        store.freeze_active_memtable().expect("freeze");
        while store.flush_memtable().await.expect("flush") {}

        let before = store.state.current_version().table_count();
        store.compact().await.expect("compact");
        let after = store.state.current_version().table_count();

        assert_eq!(before, after);
        assert!(store.state.current_version().level_count() <= 1);
    }

    #[tokio::test]
    async fn test_concurrent_compaction_excluded() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        let _guard = store.state.start_compaction();
        assert!(!store.needs_compaction());
    }

    #[tokio::test]
    async fn test_compaction_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");

        {
            let store = create_store(&dir);
            populate_tables(&store, 3).await;
            store.compact().await.expect("compact");
        }

        let store = create_store(&dir);
        {
            let version = store.state.current_version();
            assert!(version.level_count() >= 2);
            assert!(version.levels()[1].table_count() > 0);
        }
        verify_scan_integrity(&store, 300);
    }

    #[tokio::test]
    async fn test_obsolete_input_files_are_removed() {
        let dir = TempDir::new().expect("temp dir");
        let store = create_store(&dir);

        populate_tables(&store, 3).await;

        let input_paths: Vec<_> = {
            let version = store.state.current_version();
            version.levels()[0]
                .tables
                .iter()
                .map(|t| t.path.clone())
                .collect()
        };
        assert!(input_paths.iter().all(|p| p.exists()));

        store.compact().await.expect("compact");

        // No readers hold the old version; the inputs must be gone.
        for path in input_paths {
            assert!(!path.exists(), "{} should be deleted", path.display());
        }
    }
}
