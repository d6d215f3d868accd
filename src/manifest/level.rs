use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::meta::TableMeta;
use crate::comparator::Comparator;
use crate::entry::Operation;
use crate::error::Result;
use crate::sstable::{ReadableTable, ScanIterator};

/// An open table file plus its manifest metadata.
///
/// Shared read-only across versions and iterators via `Arc`. When a
/// compaction retires the table it is marked obsolete; the underlying file
/// is unlinked only when the last reference drops, so readers holding an
/// older version never lose the file out from under them.
pub struct SSTable {
    pub id: u64,
    pub path: PathBuf,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub max_seq: u64,
    table: ReadableTable,
    comparator: Arc<dyn Comparator>,
    obsolete: AtomicBool,
}

impl SSTable {
    pub fn open(
        path: PathBuf,
        meta: &TableMeta,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let table = ReadableTable::open(&path, comparator.clone())?;
        Ok(Self {
            id: meta.id,
            path,
            size: meta.size,
            entry_count: meta.entry_count,
            min_key: meta.min_key.clone(),
            max_key: meta.max_key.clone(),
            max_seq: meta.max_seq,
            table,
            comparator,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Whether `key` falls inside this table's key range.
    pub fn covers(&self, key: &[u8]) -> bool {
        use std::cmp::Ordering::{Greater, Less};
        self.comparator.compare(key, &self.min_key) != Less
            && self.comparator.compare(key, &self.max_key) != Greater
    }

    /// Filter-only membership probe: key range plus Bloom filter, no block
    /// reads. False positives allowed, false negatives not.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.covers(key) && self.table.may_contain(key)
    }

    /// All versions of `key` at or below `max_seq`, newest first.
    pub fn versions(&self, key: &[u8], max_seq: u64) -> Result<Vec<(u64, Operation)>> {
        if !self.covers(key) {
            return Ok(Vec::new());
        }
        self.table.versions(key, max_seq)
    }

    pub fn scan<R>(&self, range: R) -> Result<ScanIterator<R>>
    where
        R: RangeBounds<Vec<u8>> + Clone,
    {
        self.table.scan(range)
    }

    pub fn meta(&self, level: u32) -> TableMeta {
        TableMeta {
            id: self.id,
            level,
            size: self.size,
            entry_count: self.entry_count,
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
            max_seq: self.max_seq,
        }
    }

    /// Marks the table retired. The file is removed when the last
    /// reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(table_id = self.id, error = %e, "Failed to delete obsolete table file");
                }
            }
        }
    }
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("entry_count", &self.entry_count)
            .field("max_seq", &self.max_seq)
            .finish()
    }
}

/// One level of the tree. Level 0 tables may overlap (each is a flushed
/// memtable, newest last); levels 1 and up hold non-overlapping tables
/// sorted by min key.
#[derive(Debug, Clone, Default)]
pub struct Level {
    pub level_num: u32,
    pub tables: Vec<Arc<SSTable>>,
}

impl Level {
    pub fn new(level_num: u32) -> Self {
        Self {
            level_num,
            tables: Vec::new(),
        }
    }

    /// Total bytes across the level's tables.
    pub fn size(&self) -> u64 {
        self.tables.iter().map(|table| table.size).sum()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables in read order: newest first for level 0, key order otherwise.
    pub fn tables_for_read(&self) -> Vec<Arc<SSTable>> {
        if self.level_num == 0 {
            self.tables.iter().rev().cloned().collect()
        } else {
            self.tables.to_vec()
        }
    }
}
