//! The database handle: the boundary the dispatch/binding layer consumes.
//!
//! Every operation takes `&self`, returns a structured result, and is safe
//! to call from concurrent threads; a caller-side worker pool can dispatch
//! blocking calls here without any engine-side accommodation. Construction
//! validates all arguments before touching the filesystem. A read-write
//! handle runs its own background flush/compaction/cleanup/metrics tasks;
//! a secondary handle runs none and refreshes only on explicit catch-up.

use std::collections::HashMap;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{FlushOptions, Options, ReadOptions, WriteOptions};
use crate::engine::tasks::{CompactionTask, FlushTask, MetricsTask, WalCleanupTask};
use crate::engine::{LsmTree, ReadResolver, Snapshot};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

pub struct Db {
    tree: Arc<LsmTree>,
    scheduler: Mutex<Option<Scheduler>>,
    is_running: AtomicBool,
}

impl Db {
    /// Opens (or creates) a read-write database at `path` and starts its
    /// background maintenance tasks.
    ///
    /// Must be called within a tokio runtime; the background tasks run on
    /// it.
    pub fn open(path: impl Into<PathBuf>, options: Options) -> Result<Self> {
        options.validate()?;

        let tree = Arc::new(LsmTree::open(path, options)?);

        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(FlushTask::new(tree.clone())))
            .register(Arc::new(CompactionTask::new(tree.clone())))
            .register(Arc::new(WalCleanupTask::new(tree.clone())))
            .register(Arc::new(MetricsTask::new(tree.clone())));

        Ok(Self {
            tree,
            scheduler: Mutex::new(Some(scheduler)),
            is_running: AtomicBool::new(true),
        })
    }

    /// Opens a read-only secondary instance of the primary at `path`.
    /// `secondary_path` holds the secondary's own bookkeeping and must
    /// differ from the primary path; both are validated before any I/O.
    pub fn open_secondary(
        path: impl Into<PathBuf>,
        secondary_path: impl Into<PathBuf>,
        options: Options,
    ) -> Result<Self> {
        options.validate()?;

        let path = path.into();
        let secondary_path = secondary_path.into();
        if secondary_path == path {
            return Err(Error::Config(
                "secondary_path must differ from db_path".to_string(),
            ));
        }
        if secondary_path.as_os_str().is_empty() {
            return Err(Error::Config(
                "read-only mode requires a secondary_path".to_string(),
            ));
        }

        let tree = Arc::new(LsmTree::open_secondary(path, secondary_path, options)?);

        Ok(Self {
            tree,
            scheduler: Mutex::new(None),
            is_running: AtomicBool::new(true),
        })
    }

    /// Liveness flag; readable without blocking.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.tree.read_only() {
            return Err(Error::NotSupported(
                "write on a read-only instance".to_string(),
            ));
        }
        Ok(())
    }

    // ===== Reads =====

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        non_empty(key, "key")?;
        match options.snapshot {
            Some(seq) => self.tree.get_at(key, seq),
            None => self.tree.get(key),
        }
    }

    /// Filter-only membership probe: may return false positives, never
    /// false negatives.
    pub fn key_may_exist(&self, _options: &ReadOptions, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        non_empty(key, "key")?;
        Ok(self.tree.key_may_exist(key))
    }

    /// Ordered iterator over a key range. Restartable only by re-issuing
    /// with the same snapshot in `options`.
    pub fn scan<R>(&self, options: &ReadOptions, range: R) -> Result<ReadResolver>
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.check_open()?;
        match options.snapshot {
            Some(seq) => self.tree.scan_at(range, seq),
            None => self.tree.scan(range),
        }
    }

    /// Pins a consistent read view; pass its sequence in
    /// [`ReadOptions::snapshot`].
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.check_open()?;
        Ok(self.tree.snapshot())
    }

    // ===== Writes =====

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        non_empty(key, "key")?;
        non_empty(value, "value")?;
        self.tree.put(key, value.to_vec(), options.sync)
    }

    pub fn merge(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        non_empty(key, "key")?;
        non_empty(value, "value")?;
        self.tree.merge(key, value.to_vec(), options.sync)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        non_empty(key, "key")?;
        self.tree.delete(key, options.sync)
    }

    /// Freezes the active memtable and flushes everything frozen to table
    /// files. With `wait: false` the work continues in the background.
    pub async fn flush(&self, options: &FlushOptions) -> Result<()> {
        self.check_writable()?;

        if options.wait {
            flush_all(&self.tree).await
        } else {
            let tree = self.tree.clone();
            tokio::spawn(async move {
                if let Err(e) = flush_all(&tree).await {
                    tracing::warn!(error = %e, "Background flush failed");
                }
            });
            Ok(())
        }
    }

    // ===== Options & properties =====

    /// The open-time options with current values of the runtime-tunable
    /// knobs.
    pub fn get_options(&self) -> Result<Options> {
        self.check_open()?;
        Ok(self.tree.current_options())
    }

    /// Applies runtime-tunable options from string key/value pairs.
    /// Entries that validate are applied even when others fail; the error
    /// enumerates each rejected key.
    pub fn set_options(&self, entries: &HashMap<String, String>) -> Result<()> {
        self.check_writable()?;
        self.tree.set_options(entries)
    }

    /// Same registry as [`Db::set_options`], kept as a separate entry
    /// point for db-scoped tuning.
    pub fn set_db_options(&self, entries: &HashMap<String, String>) -> Result<()> {
        self.set_options(entries)
    }

    /// Named runtime property lookup; unknown names return `None`.
    pub fn get_property(&self, name: &str) -> Result<Option<String>> {
        self.check_open()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("property name must be non-empty".into()));
        }
        Ok(self.tree.get_property(name))
    }

    // ===== Secondary =====

    /// Makes a secondary instance catch up by tailing the primary's
    /// manifest and WAL. Only valid on a handle opened with
    /// [`Db::open_secondary`]; a concurrent catch-up is rejected, not
    /// queued.
    pub fn try_catch_up_with_primary(&self) -> Result<()> {
        self.check_open()?;
        self.tree.try_catch_up_with_primary()
    }

    // ===== Lifecycle =====

    /// Stops background tasks, syncs, and releases the directory lock.
    /// Calling close on an already-closed handle is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.is_running.swap(false, Ordering::SeqCst) {
            let scheduler = self.scheduler.lock().unwrap().take();
            if let Some(scheduler) = scheduler {
                scheduler.shutdown().await?;
            }
            self.tree.close()?;
            tracing::info!("Database closed");
        }
        Ok(())
    }
}

async fn flush_all(tree: &LsmTree) -> Result<()> {
    if !tree.state.active_memtable.read().unwrap().is_empty() {
        tree.freeze_active_memtable()?;
    }
    while tree.flush_memtable().await? {}
    Ok(())
}

fn non_empty(bytes: &[u8], what: &str) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::InvalidArgument(format!("{} must be non-empty", what)));
    }
    Ok(())
}
