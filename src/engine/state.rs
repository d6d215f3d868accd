//! All shared mutable state of the tree, with fine-grained locking.
//!
//! Locking layout: the active memtable handle, the frozen queue, and the
//! current version each sit behind their own `RwLock`; background
//! coordination runs on atomics with RAII guards; the version swap in
//! [`LsmState::install_version`] is the single serialization point for
//! table-set mutation. Sequence numbers are assigned from `next_seq` and
//! published to `last_visible_seq` only after the memtable install, so a
//! read snapshot never includes a half-applied write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::snapshot::{Snapshot, SnapshotRegistry};
use crate::comparator::Comparator;
use crate::config::{MutableOptions, Options};
use crate::error::Result;
use crate::manifest::{Manifest, Version};
use crate::memtable::{ActiveMemtable, FrozenMemtable};
use crate::merge::MergeOperator;

/// Consecutive background failures before the instance reports itself
/// degraded through the property registry.
const DEGRADED_THRESHOLD: u64 = 3;

pub struct LsmState {
    pub comparator: Arc<dyn Comparator>,
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    // Write path
    pub active_memtable: RwLock<Arc<ActiveMemtable>>,
    pub frozen_memtables: RwLock<VecDeque<Arc<FrozenMemtable>>>,

    // Read path
    version: RwLock<Arc<Version>>,

    // Metadata. `None` for read-only instances, which never append edits.
    pub manifest: RwLock<Option<Manifest>>,
    pub mutable: RwLock<MutableOptions>,
    pub next_table_id: AtomicU64,
    pub next_wal_id: AtomicU64,

    // Sequence numbers
    next_seq: AtomicU64,
    last_visible_seq: AtomicU64,
    snapshots: SnapshotRegistry,

    // Coordination flags
    pub flush_pending: AtomicBool,
    pub compaction_running: AtomicUsize,
    pub freeze_in_progress: AtomicBool,
    pub catch_up_running: AtomicBool,

    // Background health
    background_errors: AtomicU64,
    consecutive_background_failures: AtomicU64,
    last_background_error: RwLock<Option<String>>,
}

impl LsmState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: &Options,
        active_memtable: ActiveMemtable,
        frozen_memtables: VecDeque<Arc<FrozenMemtable>>,
        version: Version,
        manifest: Option<Manifest>,
        next_table_id: u64,
        next_wal_id: u64,
        last_seq: u64,
    ) -> Self {
        Self {
            comparator: options.comparator.clone(),
            merge_operator: options.merge_operator.clone(),
            active_memtable: RwLock::new(Arc::new(active_memtable)),
            frozen_memtables: RwLock::new(frozen_memtables),
            version: RwLock::new(Arc::new(version)),
            manifest: RwLock::new(manifest),
            mutable: RwLock::new(options.mutable.clone()),
            next_table_id: AtomicU64::new(next_table_id),
            next_wal_id: AtomicU64::new(next_wal_id),
            next_seq: AtomicU64::new(last_seq),
            last_visible_seq: AtomicU64::new(last_seq),
            snapshots: SnapshotRegistry::new(),
            flush_pending: AtomicBool::new(false),
            compaction_running: AtomicUsize::new(0),
            freeze_in_progress: AtomicBool::new(false),
            catch_up_running: AtomicBool::new(false),
            background_errors: AtomicU64::new(0),
            consecutive_background_failures: AtomicU64::new(0),
            last_background_error: RwLock::new(None),
        }
    }

    // ===== Sequence numbers =====

    /// Reserves the next sequence number. The write path calls this right
    /// before the WAL append, which makes the append the linearization
    /// point for writes.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publishes a sequence number as visible after its memtable install.
    pub fn publish_seq(&self, seq: u64) {
        self.last_visible_seq.fetch_max(seq, Ordering::SeqCst);
    }

    /// The snapshot boundary a fresh read should use.
    pub fn visible_seq(&self) -> u64 {
        self.last_visible_seq.load(Ordering::SeqCst)
    }

    /// Force-advances both counters, used by secondary catch-up after
    /// absorbing the primary's state.
    pub fn advance_seq_floor(&self, seq: u64) {
        self.next_seq.fetch_max(seq, Ordering::SeqCst);
        self.last_visible_seq.fetch_max(seq, Ordering::SeqCst);
    }

    // ===== Snapshots =====

    /// Registers a snapshot at the current visible sequence. Tombstone and
    /// version dropping during compaction respects every live snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.register(self.visible_seq())
    }

    pub fn min_active_snapshot(&self) -> Option<u64> {
        self.snapshots.min_active()
    }

    // ===== Version handling =====

    pub fn current_version(&self) -> Arc<Version> {
        self.version.read().unwrap().clone()
    }

    /// Swaps in a new version. This is the only place the live table set
    /// changes; readers holding the previous `Arc` are unaffected.
    pub fn install_version(&self, version: Version) {
        *self.version.write().unwrap() = Arc::new(version);
    }

    // ===== IDs =====

    pub fn next_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_wal_id(&self) -> u64 {
        self.next_wal_id.fetch_add(1, Ordering::SeqCst)
    }

    // ===== Flush/freeze/compaction coordination =====

    pub fn needs_flush(&self) -> bool {
        let frozen_count = self.frozen_memtables.read().unwrap().len();
        frozen_count > 0 && !self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn try_mark_flush_pending(&self) -> bool {
        !self.flush_pending.swap(true, Ordering::SeqCst)
    }

    pub fn mark_flush_completed(&self) {
        self.flush_pending.store(false, Ordering::SeqCst);
    }

    pub fn compaction_idle(&self) -> bool {
        self.compaction_running.load(Ordering::SeqCst) == 0
    }

    pub fn start_compaction(&self) -> CompactionGuard {
        self.compaction_running.fetch_add(1, Ordering::SeqCst);
        CompactionGuard { state: self }
    }

    pub fn try_start_freeze(&self) -> Option<FreezeGuard> {
        if !self.freeze_in_progress.swap(true, Ordering::SeqCst) {
            Some(FreezeGuard { state: self })
        } else {
            None
        }
    }

    // ===== Background health =====

    /// Records a background flush/compaction failure. Failures never take
    /// the instance down; they surface through the property registry.
    pub fn record_background_error(&self, error: &crate::error::Error) {
        self.background_errors.fetch_add(1, Ordering::SeqCst);
        self.consecutive_background_failures
            .fetch_add(1, Ordering::SeqCst);
        *self.last_background_error.write().unwrap() = Some(error.to_string());
    }

    pub fn note_background_success(&self) {
        self.consecutive_background_failures
            .store(0, Ordering::SeqCst);
    }

    pub fn background_errors(&self) -> u64 {
        self.background_errors.load(Ordering::SeqCst)
    }

    pub fn consecutive_background_failures(&self) -> u64 {
        self.consecutive_background_failures.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_background_failures() >= DEGRADED_THRESHOLD
    }

    pub fn last_background_error(&self) -> Option<String> {
        self.last_background_error.read().unwrap().clone()
    }

    // ===== Validation =====

    /// Cross-checks the in-memory version against a fresh manifest replay.
    pub fn validate_consistency(&self) -> Result<()> {
        use crate::error::Error;

        let manifest_state = {
            let manifest = self.manifest.read().unwrap();
            match manifest.as_ref() {
                Some(manifest) => manifest.replay()?,
                None => return Ok(()),
            }
        };

        let version = self.current_version();
        let manifest_tables: usize = manifest_state.levels.iter().map(|l| l.tables.len()).sum();
        if manifest_tables != version.table_count() {
            return Err(Error::InvalidState(format!(
                "table count mismatch: manifest has {}, memory has {}",
                manifest_tables,
                version.table_count()
            )));
        }

        version.validate(self.comparator.as_ref())
    }
}

/// RAII guard for a running compaction.
pub struct CompactionGuard<'a> {
    state: &'a LsmState,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.state.compaction_running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII guard for a running freeze.
pub struct FreezeGuard<'a> {
    state: &'a LsmState,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.state.freeze_in_progress.store(false, Ordering::SeqCst);
    }
}

/// Point-in-time metrics snapshot for logging and the property registry.
#[derive(Debug, Clone)]
pub struct StateMetrics {
    pub active_memtable_size: usize,
    pub frozen_memtable_count: usize,
    pub level_count: usize,
    pub total_table_count: usize,
    pub level_table_counts: Vec<usize>,
    pub level_sizes: Vec<u64>,
    pub last_visible_seq: u64,
    pub background_errors: u64,
    pub degraded: bool,
    pub compaction_running: usize,
    pub flush_pending: bool,
}

impl LsmState {
    pub fn metrics(&self) -> StateMetrics {
        let version = self.current_version();
        let levels = version.levels();

        StateMetrics {
            active_memtable_size: self.active_memtable.read().unwrap().size(),
            frozen_memtable_count: self.frozen_memtables.read().unwrap().len(),
            level_count: levels.len(),
            total_table_count: version.table_count(),
            level_table_counts: levels.iter().map(|l| l.table_count()).collect(),
            level_sizes: levels.iter().map(|l| l.size()).collect(),
            last_visible_seq: self.visible_seq(),
            background_errors: self.background_errors(),
            degraded: self.is_degraded(),
            compaction_running: self.compaction_running.load(Ordering::SeqCst),
            flush_pending: self.flush_pending.load(Ordering::SeqCst),
        }
    }
}
