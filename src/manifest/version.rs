//! Immutable, reference-counted snapshots of the live table set.
//!
//! Readers clone an `Arc<Version>` and keep a consistent view of the tree
//! for as long as they hold it; installs build a new `Version` (sharing
//! unchanged `Arc<SSTable>`s) and swap it in under the state's install
//! lock. A retired table's file outlives every version that references it.

use std::cmp::Ordering;
use std::sync::Arc;

use super::level::{Level, SSTable};
use crate::comparator::Comparator;

#[derive(Debug, Clone, Default)]
pub struct Version {
    levels: Vec<Level>,
}

impl Version {
    pub fn empty() -> Self {
        Self { levels: Vec::new() }
    }

    pub fn from_levels(levels: Vec<Level>) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(|level| level.table_count()).sum()
    }

    /// Highest data sequence number any table holds.
    pub fn max_table_seq(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|level| &level.tables)
            .map(|table| table.max_seq)
            .max()
            .unwrap_or(0)
    }

    /// Whether `target_level` is the deepest level holding any data, which
    /// permits compaction to drop tombstones outright.
    pub fn is_bottom_level(&self, target_level: u32) -> bool {
        self.levels
            .iter()
            .skip(target_level as usize + 1)
            .all(|level| level.is_empty())
    }

    /// A new version with one more level-0 table (a finished flush).
    pub fn with_flushed(&self, table: Arc<SSTable>) -> Version {
        let mut levels = self.levels.clone();
        if levels.is_empty() {
            levels.push(Level::new(0));
        }
        levels[0].tables.push(table);
        Version { levels }
    }

    /// A new version with a committed compaction applied: the source
    /// tables removed and the outputs installed at the target level in key
    /// order.
    pub fn with_compacted(
        &self,
        source_level: u32,
        removed: &[u64],
        target_level: u32,
        added: Vec<Arc<SSTable>>,
        comparator: &dyn Comparator,
    ) -> Version {
        let mut levels = self.levels.clone();

        if let Some(level) = levels.get_mut(source_level as usize) {
            level.tables.retain(|table| !removed.contains(&table.id));
        }

        while levels.len() <= target_level as usize {
            let level_num = levels.len() as u32;
            levels.push(Level::new(level_num));
        }

        let target = &mut levels[target_level as usize];
        target.tables.extend(added);
        if target_level > 0 {
            target
                .tables
                .sort_by(|a, b| comparator.compare(&a.min_key, &b.min_key));
        }

        Version { levels }
    }

    /// Tables that may hold `key`, in recency order: level 0 newest-first,
    /// then deeper levels.
    pub fn tables_for_key(&self, key: &[u8]) -> Vec<Arc<SSTable>> {
        let mut tables = Vec::new();
        for level in &self.levels {
            for table in level.tables_for_read() {
                if table.covers(key) {
                    tables.push(table);
                }
            }
        }
        tables
    }

    /// Every table, in the same recency order as [`Version::tables_for_key`].
    pub fn all_tables_for_read(&self) -> Vec<Arc<SSTable>> {
        self.levels
            .iter()
            .flat_map(|level| level.tables_for_read())
            .collect()
    }

    /// Validates that no table ID appears twice and that levels above 0
    /// are sorted and non-overlapping.
    pub fn validate(&self, comparator: &dyn Comparator) -> crate::error::Result<()> {
        use crate::error::Error;

        let mut seen = std::collections::HashSet::new();
        for level in &self.levels {
            for table in &level.tables {
                if !seen.insert(table.id) {
                    return Err(Error::InvalidState(format!(
                        "duplicate table id {} at level {}",
                        table.id, level.level_num
                    )));
                }
            }

            if level.level_num == 0 {
                continue;
            }
            for pair in level.tables.windows(2) {
                if comparator.compare(&pair[1].min_key, &pair[0].max_key) != Ordering::Greater {
                    return Err(Error::InvalidState(format!(
                        "overlapping tables {} and {} at level {}",
                        pair[0].id, pair[1].id, level.level_num
                    )));
                }
            }
        }
        Ok(())
    }
}
