//! In-memory sorted table over a concurrent skip list.
//!
//! The memtable is the first stop for every write and the newest source on
//! the read path. It stores one skiplist entry per `(user key, sequence)`
//! pair, ordered key-ascending and sequence-descending, so a bounded range
//! scan yields the newest visible version of each key first. Multiple
//! versions of a key coexist until compaction discards the obsolete ones.
//!
//! `crossbeam-skiplist` gives lock-free concurrent readers: an entry
//! installs atomically and readers never observe a partially applied write.
//! Freezing flips an `AtomicBool` exactly once; the frozen memtable then
//! belongs to the flush pipeline until it is converted to a table file.
//!
//! Each writable memtable is paired with a WAL segment: a mutation is
//! appended there before it is installed here, so durability precedes
//! visibility. A detached memtable (no WAL) backs the read-only views a
//! secondary instance rebuilds during catch-up.

use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::comparator::Comparator;
use crate::entry::{Entry, InternalKey, Operation};
use crate::error::{Error, Result};
use crate::wal::{ReplayIterator, Wal, WalOptions};

pub struct Memtable {
    data: Arc<SkipMap<InternalKey, Operation>>,
    wal: Option<Arc<RwLock<Wal>>>,
    wal_id: u64,
    comparator: Arc<dyn Comparator>,
    size: AtomicUsize,
    max_seq: AtomicU64,
    frozen: AtomicBool,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("wal_id", &self.wal_id)
            .field("entries", &self.data.len())
            .field("size", &self.size.load(Ordering::SeqCst))
            .field("frozen", &self.frozen.load(Ordering::SeqCst))
            .finish()
    }
}

impl Memtable {
    /// Creates an empty memtable backed by a fresh WAL segment.
    pub fn new(
        wal_path: impl AsRef<Path>,
        wal_id: u64,
        wal_options: WalOptions,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let wal = Wal::with_options(wal_path, wal_options)?;
        Ok(Self {
            data: Arc::new(SkipMap::new()),
            wal: Some(Arc::new(RwLock::new(wal))),
            wal_id,
            comparator,
            size: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        })
    }

    /// Creates an empty memtable with no WAL. Used for the read-only views
    /// a secondary instance builds; writes against it still work in memory
    /// but carry no durability.
    pub fn detached(comparator: Arc<dyn Comparator>) -> Self {
        Self {
            data: Arc::new(SkipMap::new()),
            wal: None,
            wal_id: 0,
            comparator,
            size: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Rebuilds a memtable from an existing WAL segment, keeping the
    /// segment open for further appends.
    ///
    /// A corrupt record mid-file truncates the segment back to the last
    /// intact record: everything before it is recovered, everything after
    /// is unrecoverable anyway because records are length-chained.
    pub fn recover(
        wal_path: impl AsRef<Path>,
        wal_id: u64,
        wal_options: WalOptions,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let wal_path = wal_path.as_ref();
        let entries = Self::replay_segment(wal_path, true)?;

        let wal = Wal::with_options(wal_path, wal_options)?;
        let memtable = Self {
            data: Arc::new(SkipMap::new()),
            wal: Some(Arc::new(RwLock::new(wal))),
            wal_id,
            comparator,
            size: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        };
        for entry in entries {
            memtable.install(entry);
        }
        Ok(memtable)
    }

    /// Rebuilds a detached, frozen memtable from a WAL segment without
    /// opening it for writes or modifying it. This is the secondary
    /// instance's view of the primary's log; a torn trailing record (the
    /// primary may be appending concurrently) ends the replay early.
    pub fn replay_detached(
        wal_path: impl AsRef<Path>,
        wal_id: u64,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        let entries = Self::replay_segment(wal_path.as_ref(), false)?;
        let memtable = Self {
            data: Arc::new(SkipMap::new()),
            wal: None,
            wal_id,
            comparator,
            size: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
        };
        for entry in entries {
            memtable.install(entry);
        }
        memtable.frozen.store(true, Ordering::SeqCst);
        Ok(memtable)
    }

    fn replay_segment(path: &Path, truncate_on_corruption: bool) -> Result<Vec<Entry>> {
        let mut iter = ReplayIterator::open(path)?;
        let mut entries = Vec::new();
        let mut last_good = iter.offset();

        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    entries.push(entry);
                    last_good = iter.offset();
                }
                Some(Err(Error::Corruption { detail, .. })) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = last_good,
                        detail = %detail,
                        "Discarding trailing corrupt WAL records"
                    );
                    if truncate_on_corruption {
                        let file = std::fs::OpenOptions::new().write(true).open(path)?;
                        file.set_len(last_good)?;
                        file.sync_all()?;
                    }
                    break;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        Ok(entries)
    }

    fn install(&self, entry: Entry) {
        let charge = entry.charge();
        let key = InternalKey::new(entry.key, entry.seq, self.comparator.clone());
        self.max_seq.fetch_max(entry.seq, Ordering::SeqCst);
        self.data.insert(key, entry.op);
        self.size.fetch_add(charge, Ordering::SeqCst);
    }

    /// Appends the mutation to the WAL, then installs it atomically.
    pub fn put(&self, entry: Entry) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::MemtableFrozen);
        }

        if let Some(wal) = &self.wal {
            wal.write()?.append(&entry)?;
        }
        self.install(entry);

        Ok(())
    }

    /// All versions of `key` at or below `max_seq`, newest first.
    pub fn versions(&self, key: &[u8], max_seq: u64) -> Vec<(u64, Operation)> {
        let start = InternalKey::new(key.to_vec(), max_seq, self.comparator.clone());
        let end = InternalKey::new(key.to_vec(), 0, self.comparator.clone());
        self.data
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|entry| (entry.key().seq, entry.value().clone()))
            .collect()
    }

    /// The newest version of `key` at or below `max_seq`, if any.
    pub fn first_visible(&self, key: &[u8], max_seq: u64) -> Option<(u64, Operation)> {
        let start = InternalKey::new(key.to_vec(), max_seq, self.comparator.clone());
        let end = InternalKey::new(key.to_vec(), 0, self.comparator.clone());
        self.data
            .range((Bound::Included(start), Bound::Included(end)))
            .next()
            .map(|entry| (entry.key().seq, entry.value().clone()))
    }

    /// Approximate memory charge of the table in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.data.len()
    }

    /// Highest sequence number installed.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    /// Marks the memtable read-only. Succeeds exactly once.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::MemtableFrozen);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn wal_id(&self) -> u64 {
        self.wal_id
    }

    pub fn wal(&self) -> Option<&Arc<RwLock<Wal>>> {
        self.wal.as_ref()
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }

    /// Syncs the paired WAL segment. A no-op for detached memtables.
    pub fn sync(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.write()?.flush()?;
        }
        Ok(())
    }

    /// Lazily iterates all versions within `range` at or below `max_seq`,
    /// ordered key-ascending then sequence-descending.
    pub fn scan<R>(self: &Arc<Self>, range: R, max_seq: u64) -> MemtableIterator
    where
        R: RangeBounds<Vec<u8>>,
    {
        let (start, end) = internal_bounds(&range, &self.comparator);
        MemtableIterator {
            memtable: self.clone(),
            last: None,
            start,
            end,
            max_seq,
            exhausted: false,
        }
    }
}

/// Maps a user-key range onto internal-key bounds. Within a key, versions
/// order newest first, so the first version of a key is `(key, u64::MAX)`
/// and the last is `(key, 0)`.
pub(crate) fn internal_bounds<R>(
    range: &R,
    comparator: &Arc<dyn Comparator>,
) -> (Bound<InternalKey>, Bound<InternalKey>)
where
    R: RangeBounds<Vec<u8>>,
{
    let start = match range.start_bound() {
        Bound::Included(key) => Bound::Included(InternalKey::new(
            key.clone(),
            u64::MAX,
            comparator.clone(),
        )),
        Bound::Excluded(key) => {
            Bound::Excluded(InternalKey::new(key.clone(), 0, comparator.clone()))
        }
        Bound::Unbounded => Bound::Unbounded,
    };
    let end = match range.end_bound() {
        Bound::Included(key) => {
            Bound::Included(InternalKey::new(key.clone(), 0, comparator.clone()))
        }
        Bound::Excluded(key) => Bound::Excluded(InternalKey::new(
            key.clone(),
            u64::MAX,
            comparator.clone(),
        )),
        Bound::Unbounded => Bound::Unbounded,
    };
    (start, end)
}

/// Lazy memtable iterator. Rather than holding a skiplist cursor across
/// calls, it re-ranges from the last returned key, which keeps it `'static`
/// and safe to interleave with concurrent writers.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    last: Option<InternalKey>,
    start: Bound<InternalKey>,
    end: Bound<InternalKey>,
    max_seq: u64,
    exhausted: bool,
}

impl Iterator for MemtableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            let lower = match &self.last {
                Some(key) => Bound::Excluded(key.clone()),
                None => self.start.clone(),
            };

            let next = self
                .memtable
                .data
                .range((lower, self.end.clone()))
                .next()
                .map(|entry| (entry.key().clone(), entry.value().clone()));

            match next {
                Some((ikey, op)) => {
                    let seq = ikey.seq;
                    self.last = Some(ikey.clone());
                    if seq <= self.max_seq {
                        return Some(Ok(Entry::new(ikey.user_key, seq, op)));
                    }
                    // Version newer than the snapshot; skip it.
                }
                None => {
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }
}
