//! The engine handle: open/recover, the write path, the point-lookup and
//! scan read paths, and the maintenance entry points the background tasks
//! and the outer handle drive.

use std::collections::HashMap;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::iterator::{ByteRange, EntryIterator, MergeIterator, OwningTableIter, ReadResolver};
use super::snapshot::Snapshot;
use super::state::LsmState;
use super::{compaction, flush, metrics, properties, recovery, secondary, wal_cleanup};
use crate::config::{LsmConfig, MutableOptions, Options};
use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::memtable::ActiveMemtable;
use crate::wal::recovery::WAL_DIR;

const LOCK_FILE: &str = "emberdb.lock";

/// The LSM tree. Interior mutability throughout: every operation takes
/// `&self` and is safe to call from concurrent threads.
pub struct LsmTree {
    pub(crate) config: LsmConfig,
    lock: Mutex<Option<FileLock>>,
    pub(crate) state: Arc<LsmState>,
    read_only: bool,
    secondary_path: Option<PathBuf>,
}

impl LsmTree {
    /// Opens (or creates) a read-write instance at `dir`.
    pub fn open(dir: impl Into<PathBuf>, options: Options) -> Result<Self> {
        options.validate()?;

        let config = LsmConfig::new(dir, options);
        std::fs::create_dir_all(&config.dir)?;
        std::fs::create_dir_all(config.dir.join(WAL_DIR))?;
        std::fs::create_dir_all(config.dir.join(super::SST_DIR))?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;
        let state = Arc::new(recovery::recover_state(&config)?);

        Ok(Self {
            config,
            lock: Mutex::new(Some(lock)),
            state,
            read_only: false,
            secondary_path: None,
        })
    }

    /// Opens a read-only secondary instance against a primary at `dir`.
    /// Bookkeeping (including the lock file) lives under `secondary_path`;
    /// nothing under the primary path is ever created or modified.
    pub fn open_secondary(
        dir: impl Into<PathBuf>,
        secondary_path: impl Into<PathBuf>,
        options: Options,
    ) -> Result<Self> {
        options.validate()?;

        let dir = dir.into();
        let secondary_path = secondary_path.into();
        if dir == secondary_path {
            return Err(Error::Config(
                "secondary_path must differ from the primary path".to_string(),
            ));
        }

        std::fs::create_dir_all(&secondary_path)?;
        let lock = FileLock::lock(secondary_path.join(LOCK_FILE))?;

        let comparator = options.comparator.clone();
        let config = LsmConfig::new(dir, options);
        let state = Arc::new(LsmState::new(
            &config.options,
            ActiveMemtable::detached(comparator),
            Default::default(),
            Default::default(),
            None,
            0,
            0,
            0,
        ));

        let tree = Self {
            config,
            lock: Mutex::new(Some(lock)),
            state,
            read_only: true,
            secondary_path: Some(secondary_path),
        };

        // Load the primary's current state so the instance is readable
        // immediately; later catch-ups refresh it on request.
        secondary::catch_up(&tree)?;

        Ok(tree)
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary_path.is_some()
    }

    pub fn secondary_path(&self) -> Option<&PathBuf> {
        self.secondary_path.as_ref()
    }

    // ===== Write path =====

    pub fn put(&self, key: &[u8], value: Vec<u8>, sync: bool) -> Result<()> {
        self.write_entry(key, Operation::Put(value), sync)
    }

    pub fn delete(&self, key: &[u8], sync: bool) -> Result<()> {
        self.write_entry(key, Operation::Delete, sync)
    }

    pub fn merge(&self, key: &[u8], operand: Vec<u8>, sync: bool) -> Result<()> {
        if self.state.merge_operator.is_none() {
            return Err(Error::NotSupported(
                "merge requires a merge operator configured at open".to_string(),
            ));
        }
        self.write_entry(key, Operation::Merge(operand), sync)
    }

    fn write_entry(&self, key: &[u8], op: Operation, sync: bool) -> Result<()> {
        if self.read_only {
            return Err(Error::NotSupported(
                "write on a read-only instance".to_string(),
            ));
        }

        loop {
            // Writes stall rather than queueing memtables without bound.
            {
                let frozen = self.state.frozen_memtables.read().unwrap();
                let max_frozen = self.state.mutable.read().unwrap().max_frozen_memtables;
                if frozen.len() >= max_frozen {
                    return Err(Error::ResourceExhausted(format!(
                        "{} frozen memtables awaiting flush",
                        frozen.len()
                    )));
                }
            }

            let active = self.state.active_memtable.read().unwrap().clone();
            let seq = self.state.next_seq();
            match active.put(Entry::new(key.to_vec(), seq, op.clone())) {
                Ok(()) => {
                    self.state.publish_seq(seq);
                    if sync {
                        active.sync()?;
                    }

                    let limit = self.state.mutable.read().unwrap().write_buffer_size;
                    if active.size() >= limit {
                        self.freeze_active_memtable()?;
                    }
                    return Ok(());
                }
                // Lost the race against a freeze; retry against the new
                // active memtable.
                Err(Error::MemtableFrozen) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Freezes the active memtable and starts a fresh one with a new WAL
    /// segment. A no-op when another freeze is already in flight.
    pub fn freeze_active_memtable(&self) -> Result<()> {
        let _guard = match self.state.try_start_freeze() {
            Some(guard) => guard,
            None => return Ok(()),
        };

        let new_wal_id = self.state.next_wal_id();
        let wal_path = super::wal_path(&self.config.dir, new_wal_id);
        let new_active = Arc::new(ActiveMemtable::new(
            wal_path,
            new_wal_id,
            self.config.options.wal_options(),
            self.state.comparator.clone(),
        )?);

        let old_active = {
            let mut active = self.state.active_memtable.write().unwrap();
            let frozen = active.freeze()?;
            *active = new_active;
            frozen
        };

        self.state
            .frozen_memtables
            .write()
            .unwrap()
            .push_back(Arc::new(old_active));

        Ok(())
    }

    // ===== Read path =====

    /// Point lookup at the latest visible state.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, self.state.visible_seq())
    }

    /// Point lookup at a fixed snapshot sequence. Probes the active
    /// memtable, frozen memtables newest-first, then table files by
    /// recency; the first base operation at or below the snapshot wins,
    /// with merge operands accumulated along the way.
    pub fn get_at(&self, key: &[u8], snapshot: u64) -> Result<Option<Vec<u8>>> {
        let mut operands: Vec<Vec<u8>> = Vec::new();

        let active = self.state.active_memtable.read().unwrap().clone();
        if let Some(base) = fold_source(active.versions(key, snapshot), &mut operands) {
            return self.finish_lookup(base, operands);
        }

        let frozen: Vec<_> = {
            let frozen = self.state.frozen_memtables.read().unwrap();
            frozen.iter().rev().cloned().collect()
        };
        for memtable in frozen {
            if let Some(base) = fold_source(memtable.versions(key, snapshot), &mut operands) {
                return self.finish_lookup(base, operands);
            }
        }

        let version = self.state.current_version();
        for table in version.tables_for_key(key) {
            if !table.may_contain(key) {
                continue;
            }
            if let Some(base) = fold_source(table.versions(key, snapshot)?, &mut operands) {
                return self.finish_lookup(base, operands);
            }
        }

        self.finish_lookup(None, operands)
    }

    fn finish_lookup(
        &self,
        base: Option<Vec<u8>>,
        operands: Vec<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        if operands.is_empty() {
            return Ok(base);
        }
        super::iterator::fold_operands(base, operands, self.state.merge_operator.as_deref())
            .map(Some)
    }

    /// Lightweight membership probe: memtable presence plus table filter
    /// checks, no data-block reads. False positives allowed, false
    /// negatives not.
    pub fn key_may_exist(&self, key: &[u8]) -> bool {
        let active = self.state.active_memtable.read().unwrap().clone();
        if !active.versions(key, u64::MAX).is_empty() {
            return true;
        }

        {
            let frozen = self.state.frozen_memtables.read().unwrap();
            for memtable in frozen.iter().rev() {
                if !memtable.versions(key, u64::MAX).is_empty() {
                    return true;
                }
            }
        }

        let version = self.state.current_version();
        version
            .tables_for_key(key)
            .iter()
            .any(|table| table.may_contain(key))
    }

    /// Ordered scan over the latest visible state.
    pub fn scan<R>(&self, range: R) -> Result<ReadResolver>
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.scan_at(range, self.state.visible_seq())
    }

    /// Ordered scan at a fixed snapshot sequence. The returned iterator
    /// pins the memtables and the version it started from, so concurrent
    /// flushes and compactions never change its results.
    pub fn scan_at<R>(&self, range: R, snapshot: u64) -> Result<ReadResolver>
    where
        R: RangeBounds<Vec<u8>>,
    {
        let byte_range: ByteRange = (
            range.start_bound().cloned(),
            range.end_bound().cloned(),
        );

        let mut iterators: Vec<EntryIterator> = Vec::new();

        let active = self.state.active_memtable.read().unwrap().clone();
        iterators.push(Box::new(active.scan(byte_range.clone(), snapshot)));

        {
            let frozen = self.state.frozen_memtables.read().unwrap();
            for memtable in frozen.iter().rev() {
                iterators.push(Box::new(memtable.scan(byte_range.clone(), snapshot)));
            }
        }

        let version = self.state.current_version();
        for table in version.all_tables_for_read() {
            iterators.push(Box::new(OwningTableIter::new(table, byte_range.clone())?));
        }

        let merged = MergeIterator::new(iterators, self.state.comparator.clone());
        Ok(ReadResolver::new(
            merged,
            self.state.comparator.clone(),
            snapshot,
            self.state.merge_operator.clone(),
        ))
    }

    /// Registers a snapshot of the current visible state. Reads and scans
    /// issued at its sequence are repeatable until it drops.
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    // ===== Maintenance =====

    /// Flushes the oldest frozen memtable into a level-0 table.
    pub async fn flush_memtable(&self) -> Result<bool> {
        flush::flush_memtable(self).await
    }

    pub fn needs_flush(&self) -> bool {
        self.state.needs_flush()
    }

    pub fn needs_compaction(&self) -> bool {
        compaction::needs_compaction(&self.state)
    }

    /// Runs one round of tiered compaction if any level needs it.
    pub async fn compact(&self) -> Result<()> {
        compaction::compact(self).await
    }

    pub fn deletable_wals(&self) -> Result<Vec<u64>> {
        wal_cleanup::deletable_wals(&self.state)
    }

    pub async fn cleanup_wals(&self) -> Result<()> {
        wal_cleanup::cleanup_wals(self).await
    }

    /// Refreshes a secondary's view from the primary's manifest and WAL.
    pub fn try_catch_up_with_primary(&self) -> Result<()> {
        secondary::catch_up(self)
    }

    pub fn collect_metrics(&self) -> Result<()> {
        metrics::collect_metrics(&self.state)
    }

    pub fn get_property(&self, name: &str) -> Option<String> {
        properties::get_property(&self.state, name)
    }

    /// Applies runtime-tunable options. Valid entries take effect even
    /// when others are rejected; the error lists each failed key.
    pub fn set_options(&self, entries: &HashMap<String, String>) -> Result<()> {
        let mut mutable = self.state.mutable.write().unwrap();
        let result = mutable.apply_all(entries);
        if result.is_ok() {
            tracing::info!(options = ?entries, "Applied runtime options");
        }
        result
    }

    /// The open-time options with current values of the mutable knobs.
    pub fn current_options(&self) -> Options {
        let mut options = self.config.options.clone();
        options.mutable = self.current_mutable_options();
        options
    }

    pub fn current_mutable_options(&self) -> MutableOptions {
        self.state.mutable.read().unwrap().clone()
    }

    /// Syncs the active WAL segment and the manifest.
    pub fn sync(&self) -> Result<()> {
        self.state.active_memtable.read().unwrap().sync()?;
        if let Some(manifest) = self.state.manifest.read().unwrap().as_ref() {
            manifest.sync()?;
        }
        Ok(())
    }

    /// Syncs and releases the directory lock. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        if let Some(lock) = self.lock.lock().unwrap().take() {
            let _ = lock.unlock();
        }
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.lock().unwrap().take() {
            let _ = lock.unlock();
        }
    }
}

/// Walks one source's versions of a key (newest first): merge operands
/// accumulate, the first put/delete resolves the base. `None` means the
/// source had no base and the lookup continues into older sources.
fn fold_source(
    versions: Vec<(u64, Operation)>,
    operands: &mut Vec<Vec<u8>>,
) -> Option<Option<Vec<u8>>> {
    for (_, op) in versions {
        match op {
            Operation::Put(value) => return Some(Some(value)),
            Operation::Delete => return Some(None),
            Operation::Merge(operand) => operands.push(operand),
        }
    }
    None
}
