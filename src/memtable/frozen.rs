use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use super::core::{Memtable, MemtableIterator};
use crate::comparator::Comparator;
use crate::entry::Operation;
use crate::error::Result;

/// A read-only memtable queued for flushing. The flush pipeline owns it
/// exclusively from freeze until the table file is installed.
pub struct FrozenMemtable {
    memtable: Arc<Memtable>,
    wal_id: u64,
}

impl FrozenMemtable {
    pub(super) fn new(memtable: Arc<Memtable>, wal_id: u64) -> Self {
        Self { memtable, wal_id }
    }

    /// Rebuilds a frozen memtable from a WAL segment found during recovery.
    pub fn recover(
        wal_path: impl AsRef<Path>,
        wal_id: u64,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let memtable = Arc::new(Memtable::replay_detached(wal_path, wal_id, comparator)?);
        Ok(Self { memtable, wal_id })
    }

    pub fn wal_id(&self) -> u64 {
        self.wal_id
    }

    pub fn versions(&self, key: &[u8], max_seq: u64) -> Vec<(u64, Operation)> {
        self.memtable.versions(key, max_seq)
    }

    pub fn first_visible(&self, key: &[u8], max_seq: u64) -> Option<(u64, Operation)> {
        self.memtable.first_visible(key, max_seq)
    }

    pub fn size(&self) -> usize {
        self.memtable.size()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.memtable.entry_count()
    }

    pub fn max_seq(&self) -> u64 {
        self.memtable.max_seq()
    }

    pub fn scan<R>(&self, range: R, max_seq: u64) -> MemtableIterator
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.memtable.scan(range, max_seq)
    }

    pub fn memtable(&self) -> &Arc<Memtable> {
        &self.memtable
    }
}
