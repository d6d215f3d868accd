use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use super::core::{Memtable, MemtableIterator};
use super::frozen::FrozenMemtable;
use crate::comparator::Comparator;
use crate::entry::{Entry, Operation};
use crate::error::Result;
use crate::wal::WalOptions;

/// The single writable memtable. Freezing converts it into a
/// [`FrozenMemtable`] exactly once and hands ownership of the data to the
/// flush pipeline.
pub struct ActiveMemtable {
    memtable: Arc<Memtable>,
    wal_id: u64,
}

impl ActiveMemtable {
    pub fn new(
        wal_path: impl AsRef<Path>,
        wal_id: u64,
        wal_options: WalOptions,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let memtable = Arc::new(Memtable::new(wal_path, wal_id, wal_options, comparator)?);
        Ok(Self { memtable, wal_id })
    }

    /// Reopens an existing WAL segment as the active memtable, replaying
    /// its records and truncating a corrupt tail.
    pub fn recover(
        wal_path: impl AsRef<Path>,
        wal_id: u64,
        wal_options: WalOptions,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let memtable = Arc::new(Memtable::recover(wal_path, wal_id, wal_options, comparator)?);
        Ok(Self { memtable, wal_id })
    }

    /// In-memory only active memtable for read-only instances.
    pub fn detached(comparator: Arc<dyn Comparator>) -> Self {
        Self {
            memtable: Arc::new(Memtable::detached(comparator)),
            wal_id: 0,
        }
    }

    pub fn freeze(&self) -> Result<FrozenMemtable> {
        self.memtable.freeze()?;
        Ok(FrozenMemtable::new(self.memtable.clone(), self.wal_id))
    }

    pub fn put(&self, entry: Entry) -> Result<()> {
        self.memtable.put(entry)
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

    pub fn max_seq(&self) -> u64 {
        self.memtable.max_seq()
    }

    pub fn wal_id(&self) -> u64 {
        self.wal_id
    }

    pub fn sync(&self) -> Result<()> {
        self.memtable.sync()
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
