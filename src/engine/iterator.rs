//! Merging and resolving iterators.
//!
//! [`MergeIterator`] interleaves any number of sorted entry sources into a
//! single internal-key-ordered stream (key ascending, sequence descending),
//! dropping exact duplicates that appear in two sources during the brief
//! window where a flushed memtable and its level-0 table coexist.
//!
//! [`ReadResolver`] turns that stream into user-visible `(key, value)`
//! pairs at a snapshot: the newest visible version of each key wins,
//! tombstones suppress the key, and merge operands fold through the
//! configured operator from the oldest operand up.
//!
//! [`CompactionIterator`] rewrites the stream for a compaction output:
//! versions of a key collapse to one entry when no live snapshot can
//! observe the older ones, merge operands fold eagerly (partially, when the
//! base value lives in a deeper level), and tombstones vanish at the bottom
//! level.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::ops::Bound;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};
use crate::manifest::SSTable;
use crate::merge::MergeOperator;

/// Concrete range type used across the engine so iterator types stay
/// nameable.
pub type ByteRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

pub type EntryIterator = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Keeps the backing table alive for as long as its scan iterator runs.
pub struct OwningTableIter {
    _table: Arc<SSTable>,
    iter: crate::sstable::ScanIterator<ByteRange>,
}

impl OwningTableIter {
    pub fn new(table: Arc<SSTable>, range: ByteRange) -> Result<Self> {
        let iter = table.scan(range)?;
        Ok(Self {
            _table: table,
            iter,
        })
    }
}

impl Iterator for OwningTableIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

struct HeapEntry {
    entry: Entry,
    source: usize,
    iterator: EntryIterator,
    comparator: Arc<dyn Comparator>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the maximum, so "greater" means "emitted sooner":
    // smaller key first, then higher sequence, then lower source index.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.comparator.compare(&self.entry.key, &other.entry.key) {
            CmpOrdering::Equal => match self.entry.seq.cmp(&other.entry.seq) {
                CmpOrdering::Equal => other.source.cmp(&self.source),
                ord => ord,
            },
            ord => ord.reverse(),
        }
    }
}

/// K-way merge of sorted entry sources into internal-key order.
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    comparator: Arc<dyn Comparator>,
    last_emitted: Option<(Vec<u8>, u64)>,
    pending_error: Option<Error>,
}

impl MergeIterator {
    pub fn new(iterators: Vec<EntryIterator>, comparator: Arc<dyn Comparator>) -> Self {
        let mut merged = Self {
            heap: BinaryHeap::new(),
            comparator,
            last_emitted: None,
            pending_error: None,
        };
        for (source, mut iterator) in iterators.into_iter().enumerate() {
            match iterator.next() {
                Some(Ok(entry)) => merged.heap.push(HeapEntry {
                    entry,
                    source,
                    iterator,
                    comparator: merged.comparator.clone(),
                }),
                Some(Err(e)) => merged.pending_error = Some(e),
                None => {}
            }
        }
        merged
    }

    fn refill(&mut self, mut iterator: EntryIterator, source: usize) {
        match iterator.next() {
            Some(Ok(entry)) => self.heap.push(HeapEntry {
                entry,
                source,
                iterator,
                comparator: self.comparator.clone(),
            }),
            Some(Err(e)) => self.pending_error = Some(e),
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.pending_error.take() {
                return Some(Err(e));
            }

            let top = self.heap.pop()?;
            let HeapEntry {
                entry,
                source,
                iterator,
                ..
            } = top;
            self.refill(iterator, source);

            // The same (key, seq) pair can surface from both a frozen
            // memtable and its freshly installed table; keep one.
            if let Some((last_key, last_seq)) = &self.last_emitted {
                if *last_seq == entry.seq
                    && self.comparator.compare(last_key, &entry.key) == CmpOrdering::Equal
                {
                    continue;
                }
            }

            self.last_emitted = Some((entry.key.clone(), entry.seq));
            return Some(Ok(entry));
        }
    }
}

/// Groups a merged stream by user key. Each group carries the versions in
/// sequence-descending order.
struct KeyGroups {
    inner: MergeIterator,
    comparator: Arc<dyn Comparator>,
    peeked: Option<Entry>,
}

impl KeyGroups {
    fn new(inner: MergeIterator, comparator: Arc<dyn Comparator>) -> Self {
        Self {
            inner,
            comparator,
            peeked: None,
        }
    }

    fn next_group(&mut self) -> Result<Option<(Vec<u8>, Vec<(u64, Operation)>)>> {
        let first = match self.peeked.take() {
            Some(entry) => entry,
            None => match self.inner.next() {
                Some(entry) => entry?,
                None => return Ok(None),
            },
        };

        let key = first.key.clone();
        let mut versions = vec![(first.seq, first.op)];

        loop {
            match self.inner.next() {
                Some(Ok(entry)) => {
                    if self.comparator.compare(&entry.key, &key) == CmpOrdering::Equal {
                        versions.push((entry.seq, entry.op));
                    } else {
                        self.peeked = Some(entry);
                        break;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        Ok(Some((key, versions)))
    }
}

/// Resolves a merged stream into the user-visible `(key, value)` pairs at a
/// snapshot.
pub struct ReadResolver {
    groups: KeyGroups,
    snapshot_seq: u64,
    merge_operator: Option<Arc<dyn MergeOperator>>,
}

impl ReadResolver {
    pub fn new(
        inner: MergeIterator,
        comparator: Arc<dyn Comparator>,
        snapshot_seq: u64,
        merge_operator: Option<Arc<dyn MergeOperator>>,
    ) -> Self {
        Self {
            groups: KeyGroups::new(inner, comparator),
            snapshot_seq,
            merge_operator,
        }
    }

    fn resolve_group(&self, versions: Vec<(u64, Operation)>) -> Result<Option<Vec<u8>>> {
        let mut operands: Vec<Vec<u8>> = Vec::new();
        let mut base: Option<Option<Vec<u8>>> = None;

        for (seq, op) in versions {
            if seq > self.snapshot_seq {
                continue;
            }
            match op {
                Operation::Put(value) => {
                    base = Some(Some(value));
                    break;
                }
                Operation::Delete => {
                    base = Some(None);
                    break;
                }
                Operation::Merge(operand) => operands.push(operand),
            }
        }

        if operands.is_empty() {
            return Ok(base.flatten());
        }

        fold_operands(base.flatten(), operands, self.merge_operator.as_deref()).map(Some)
    }
}

impl Iterator for ReadResolver {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, versions) = match self.groups.next_group() {
                Ok(Some(group)) => group,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };

            // A group whose versions are all newer than the snapshot, or
            // whose visible base is a tombstone, yields nothing.
            match self.resolve_group(versions) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Folds merge operands (newest-first, as collected) onto a base value,
/// applying them oldest-first as the operator contract requires.
pub(crate) fn fold_operands(
    base: Option<Vec<u8>>,
    operands: Vec<Vec<u8>>,
    operator: Option<&dyn MergeOperator>,
) -> Result<Vec<u8>> {
    let operator = operator.ok_or_else(|| {
        Error::NotSupported("merge requires a merge operator configured at open".to_string())
    })?;

    let mut acc = base;
    for operand in operands.into_iter().rev() {
        acc = Some(operator.combine(acc.as_deref(), &operand));
    }
    // At least one operand exists, so the fold produced a value.
    Ok(acc.unwrap_or_default())
}

/// Rewrites a merged stream for a compaction output.
pub struct CompactionIterator {
    groups: KeyGroups,
    /// No level below the target holds data, so tombstones and absent-base
    /// merge chains can resolve fully.
    bottom_level: bool,
    /// Oldest sequence any live snapshot observes; collapsing is only legal
    /// for keys whose newest version is at or below it.
    min_snapshot: Option<u64>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    output: std::collections::VecDeque<Entry>,
}

impl CompactionIterator {
    pub fn new(
        inner: MergeIterator,
        comparator: Arc<dyn Comparator>,
        bottom_level: bool,
        min_snapshot: Option<u64>,
        merge_operator: Option<Arc<dyn MergeOperator>>,
    ) -> Self {
        Self {
            groups: KeyGroups::new(inner, comparator),
            bottom_level,
            min_snapshot,
            merge_operator,
            output: std::collections::VecDeque::new(),
        }
    }

    fn process_group(&mut self, key: Vec<u8>, versions: Vec<(u64, Operation)>) -> Result<()> {
        let newest_seq = versions[0].0;

        // A snapshot older than the newest version may still need the older
        // versions, and a merge chain without an operator cannot fold; both
        // cases keep the group untouched.
        let collapse_ok = self.min_snapshot.map_or(true, |snap| snap >= newest_seq);
        let has_merge = versions
            .iter()
            .any(|(_, op)| matches!(op, Operation::Merge(_)));
        if !collapse_ok || (has_merge && self.merge_operator.is_none()) {
            for (seq, op) in versions {
                self.output.push_back(Entry::new(key.clone(), seq, op));
            }
            return Ok(());
        }

        let mut operands: Vec<Vec<u8>> = Vec::new();
        let mut base: Option<Option<Vec<u8>>> = None;

        for (_, op) in versions {
            match op {
                Operation::Put(value) => {
                    base = Some(Some(value));
                    break;
                }
                Operation::Delete => {
                    base = Some(None);
                    break;
                }
                Operation::Merge(operand) => operands.push(operand),
            }
        }

        if operands.is_empty() {
            match base {
                Some(Some(value)) => {
                    self.output
                        .push_back(Entry::new(key, newest_seq, Operation::Put(value)));
                }
                Some(None) => {
                    // Tombstone: at the bottom level nothing deeper can
                    // resurface the key, so it disappears entirely.
                    if !self.bottom_level {
                        self.output
                            .push_back(Entry::new(key, newest_seq, Operation::Delete));
                    }
                }
                None => {}
            }
            return Ok(());
        }

        // Operands present implies an operator: the guard above kept the
        // group verbatim otherwise.
        let operator = self.merge_operator.clone().expect("operator checked above");

        let base_found = base.is_some();
        if base_found || self.bottom_level {
            // The full history of the key is in hand (or nothing deeper
            // exists): fold to a concrete value.
            let value = fold_operands(base.flatten(), operands, Some(operator.as_ref()))?;
            self.output
                .push_back(Entry::new(key, newest_seq, Operation::Put(value)));
        } else {
            // The base may live in a deeper level: associativity lets the
            // operand run collapse into a single partial operand.
            let mut iter = operands.into_iter().rev();
            let mut acc = iter.next().unwrap_or_default();
            for operand in iter {
                acc = operator.combine(Some(&acc), &operand);
            }
            self.output
                .push_back(Entry::new(key, newest_seq, Operation::Merge(acc)));
        }

        Ok(())
    }
}

impl Iterator for CompactionIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.output.pop_front() {
                return Some(Ok(entry));
            }
            match self.groups.next_group() {
                Ok(Some((key, versions))) => {
                    if let Err(e) = self.process_group(key, versions) {
                        return Some(Err(e));
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::merge::AppendOperator;

    fn comparator() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn boxed(entries: Vec<Entry>) -> EntryIterator {
        Box::new(entries.into_iter().map(Ok))
    }

    fn put(key: &[u8], seq: u64, value: &[u8]) -> Entry {
        Entry::new(key.to_vec(), seq, Operation::Put(value.to_vec()))
    }

    fn merge(key: &[u8], seq: u64, operand: &[u8]) -> Entry {
        Entry::new(key.to_vec(), seq, Operation::Merge(operand.to_vec()))
    }

    fn delete(key: &[u8], seq: u64) -> Entry {
        Entry::new(key.to_vec(), seq, Operation::Delete)
    }

    #[test]
    fn test_merge_iterator_orders_by_key_then_seq() {
        let source_a = boxed(vec![put(b"a", 5, b"new"), put(b"c", 1, b"vc")]);
        let source_b = boxed(vec![put(b"a", 2, b"old"), put(b"b", 3, b"vb")]);

        let merged: Vec<_> = MergeIterator::new(vec![source_a, source_b], comparator())
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let flattened: Vec<(&[u8], u64)> = merged
            .iter()
            .map(|e| (e.key.as_slice(), e.seq))
            .collect();
        assert_eq!(
            flattened,
            vec![
                (b"a".as_slice(), 5),
                (b"a".as_slice(), 2),
                (b"b".as_slice(), 3),
                (b"c".as_slice(), 1),
            ]
        );
    }

    #[test]
    fn test_merge_iterator_drops_exact_duplicates() {
        // The same (key, seq) from a frozen memtable and its flushed table.
        let source_a = boxed(vec![put(b"k", 4, b"v")]);
        let source_b = boxed(vec![put(b"k", 4, b"v")]);

        let merged: Vec<_> = MergeIterator::new(vec![source_a, source_b], comparator())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_read_resolver_newest_version_wins() {
        let source = boxed(vec![put(b"k", 9, b"new"), put(b"k", 2, b"old")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let resolved: Vec<_> = ReadResolver::new(merged, comparator(), u64::MAX, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(resolved, vec![(b"k".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_read_resolver_respects_snapshot() {
        let source = boxed(vec![put(b"k", 9, b"new"), put(b"k", 2, b"old")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let resolved: Vec<_> = ReadResolver::new(merged, comparator(), 5, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(resolved, vec![(b"k".to_vec(), b"old".to_vec())]);
    }

    #[test]
    fn test_read_resolver_hides_deleted_keys() {
        let source = boxed(vec![
            delete(b"gone", 9),
            put(b"gone", 2, b"old"),
            put(b"kept", 3, b"v"),
        ]);
        let merged = MergeIterator::new(vec![source], comparator());
        let resolved: Vec<_> = ReadResolver::new(merged, comparator(), u64::MAX, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(resolved, vec![(b"kept".to_vec(), b"v".to_vec())]);
    }

    #[test]
    fn test_read_resolver_folds_merge_operands() {
        let source = boxed(vec![
            merge(b"k", 9, b"three"),
            merge(b"k", 5, b"two"),
            put(b"k", 2, b"one"),
        ]);
        let merged = MergeIterator::new(vec![source], comparator());
        let operator: Arc<dyn MergeOperator> = Arc::new(AppendOperator::default());
        let resolved: Vec<_> = ReadResolver::new(merged, comparator(), u64::MAX, Some(operator))
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(resolved, vec![(b"k".to_vec(), b"one,two,three".to_vec())]);
    }

    #[test]
    fn test_read_resolver_merge_without_operator_fails() {
        let source = boxed(vec![merge(b"k", 1, b"operand")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let mut resolved = ReadResolver::new(merged, comparator(), u64::MAX, None);

        assert!(matches!(
            resolved.next(),
            Some(Err(Error::NotSupported(_)))
        ));
    }

    #[test]
    fn test_compaction_collapses_versions() {
        let source = boxed(vec![
            put(b"k", 9, b"newest"),
            put(b"k", 5, b"middle"),
            put(b"k", 1, b"oldest"),
        ]);
        let merged = MergeIterator::new(vec![source], comparator());
        let compacted: Vec<_> = CompactionIterator::new(merged, comparator(), true, None, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(compacted, vec![put(b"k", 9, b"newest")]);
    }

    #[test]
    fn test_compaction_keeps_versions_needed_by_snapshot() {
        let source = boxed(vec![put(b"k", 9, b"new"), put(b"k", 2, b"old")]);
        let merged = MergeIterator::new(vec![source], comparator());
        // A snapshot at 5 still needs the version at seq 2.
        let compacted: Vec<_> = CompactionIterator::new(merged, comparator(), true, Some(5), None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(compacted.len(), 2);
    }

    #[test]
    fn test_compaction_drops_tombstones_at_bottom() {
        let source = boxed(vec![delete(b"gone", 9), put(b"gone", 2, b"old")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let compacted: Vec<_> = CompactionIterator::new(merged, comparator(), true, None, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert!(compacted.is_empty());
    }

    #[test]
    fn test_compaction_keeps_tombstones_above_bottom() {
        let source = boxed(vec![delete(b"gone", 9), put(b"gone", 2, b"old")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let compacted: Vec<_> = CompactionIterator::new(merged, comparator(), false, None, None)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(compacted, vec![delete(b"gone", 9)]);
    }

    #[test]
    fn test_compaction_folds_merges_onto_base() {
        let operator: Arc<dyn MergeOperator> = Arc::new(AppendOperator::default());
        let source = boxed(vec![
            merge(b"k", 9, b"two"),
            merge(b"k", 5, b"one"),
            put(b"k", 2, b"zero"),
        ]);
        let merged = MergeIterator::new(vec![source], comparator());
        let compacted: Vec<_> =
            CompactionIterator::new(merged, comparator(), false, None, Some(operator))
                .collect::<Result<Vec<_>>>()
                .unwrap();

        assert_eq!(compacted, vec![put(b"k", 9, b"zero,one,two")]);
    }

    #[test]
    fn test_compaction_partial_merge_without_base() {
        let operator: Arc<dyn MergeOperator> = Arc::new(AppendOperator::default());
        // No base in the inputs and not the bottom level: the operands
        // collapse into one operand for read-time resolution.
        let source = boxed(vec![merge(b"k", 9, b"two"), merge(b"k", 5, b"one")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let compacted: Vec<_> =
            CompactionIterator::new(merged, comparator(), false, None, Some(operator))
                .collect::<Result<Vec<_>>>()
                .unwrap();

        assert_eq!(compacted, vec![merge(b"k", 9, b"one,two")]);
    }

    #[test]
    fn test_compaction_merge_chain_resolves_at_bottom() {
        let operator: Arc<dyn MergeOperator> = Arc::new(AppendOperator::default());
        let source = boxed(vec![merge(b"k", 9, b"two"), merge(b"k", 5, b"one")]);
        let merged = MergeIterator::new(vec![source], comparator());
        let compacted: Vec<_> =
            CompactionIterator::new(merged, comparator(), true, None, Some(operator))
                .collect::<Result<Vec<_>>>()
                .unwrap();

        // At the bottom the absent base resolves the chain to a value.
        assert_eq!(compacted, vec![put(b"k", 9, b"one,two")]);
    }
}
