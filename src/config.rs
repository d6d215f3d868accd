use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::error::{Error, Result};
use crate::merge::MergeOperator;

/// Immutable-at-open options. These shape the storage format and the
/// engine's capabilities; they are validated before any file I/O happens.
/// Runtime-tunable knobs live in [`MutableOptions`].
#[derive(Clone)]
pub struct Options {
    /// User-key ordering. The database must always be reopened with the
    /// comparator it was created with.
    pub comparator: Arc<dyn Comparator>,

    /// Optional merge operator; merges fail with a not-supported error when
    /// none is configured.
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Target size for table file data blocks (default: 4KB)
    pub block_size: usize,

    /// Bloom filter bits per key for table files; 0 disables filters
    /// (default: 10)
    pub bloom_bits_per_key: usize,

    /// Enable WAL direct I/O (default: false)
    pub wal_direct_io: bool,

    /// WAL buffer size (default: 64KB)
    pub wal_buffer_size: usize,

    /// How often to check for flush opportunities (default: 3s)
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,

    /// How often to clean up old WAL files (default: 30s)
    pub wal_cleanup_interval: Duration,

    /// How often to log engine metrics (default: 60s)
    pub metrics_interval: Duration,

    /// Worker threads the caller-side dispatch layer may use. The engine
    /// only validates the minimum (default: 1)
    pub workers: usize,

    /// Initial values for the runtime-tunable knobs.
    pub mutable: MutableOptions,
}

/// Runtime-tunable options, changed through `set_options` with string
/// key/value pairs validated against an allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableOptions {
    /// Maximum active memtable size before freezing (default: 64MB)
    pub write_buffer_size: usize,

    /// Frozen memtables allowed to queue before writes are rejected with a
    /// resource-exhaustion error (default: 8)
    pub max_frozen_memtables: usize,

    /// Level 0 table count threshold for compaction (default: 4)
    pub level0_compaction_threshold: usize,

    /// Size ratio threshold for tiered compaction (default: 10).
    /// When level N is size_ratio times larger than level N+1, level N is
    /// compacted into level N+1.
    pub size_ratio_threshold: u32,

    /// Maximum number of tables per level in tiered compaction (default: 10)
    pub max_tables_per_level: usize,
}

impl Default for MutableOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024 * 1024,
            max_frozen_memtables: 8,
            level0_compaction_threshold: 4,
            size_ratio_threshold: 10,
            max_tables_per_level: 10,
        }
    }
}

impl MutableOptions {
    /// Applies a single string-encoded entry. Unknown keys and malformed
    /// values are rejected without touching other fields.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_usize = |v: &str| {
            v.parse::<usize>()
                .map_err(|e| Error::InvalidArgument(format!("{}: {}", key, e)))
        };
        match key {
            "write_buffer_size" => {
                let size = parse_usize(value)?;
                if size == 0 {
                    return Err(Error::InvalidArgument(
                        "write_buffer_size must be non-zero".into(),
                    ));
                }
                self.write_buffer_size = size;
            }
            "max_frozen_memtables" => {
                let count = parse_usize(value)?;
                if count == 0 {
                    return Err(Error::InvalidArgument(
                        "max_frozen_memtables must be non-zero".into(),
                    ));
                }
                self.max_frozen_memtables = count;
            }
            "level0_compaction_threshold" => {
                self.level0_compaction_threshold = parse_usize(value)?;
            }
            "size_ratio_threshold" => {
                self.size_ratio_threshold = value
                    .parse::<u32>()
                    .map_err(|e| Error::InvalidArgument(format!("{}: {}", key, e)))?;
            }
            "max_tables_per_level" => {
                self.max_tables_per_level = parse_usize(value)?;
            }
            _ => {
                return Err(Error::InvalidArgument(format!("unknown option: {}", key)));
            }
        }
        Ok(())
    }

    /// Applies a batch of entries. Valid entries take effect even when
    /// others fail; the error lists every rejected key with its reason.
    pub fn apply_all(&mut self, entries: &HashMap<String, String>) -> Result<()> {
        let mut failures = Vec::new();
        for (key, value) in entries {
            if let Err(e) = self.apply(key, value) {
                failures.push((key.clone(), e.to_string()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(Error::InvalidOptions(failures))
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            merge_operator: None,
            block_size: 4096,
            bloom_bits_per_key: 10,
            wal_direct_io: false,
            wal_buffer_size: 64 * 1024,
            flush_interval: Duration::from_secs(3),
            compaction_interval: Duration::from_secs(10),
            wal_cleanup_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            workers: 1,
            mutable: MutableOptions::default(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("comparator", &self.comparator.name())
            .field(
                "merge_operator",
                &self.merge_operator.as_ref().map(|m| m.name()),
            )
            .field("block_size", &self.block_size)
            .field("bloom_bits_per_key", &self.bloom_bits_per_key)
            .field("wal_direct_io", &self.wal_direct_io)
            .field("wal_buffer_size", &self.wal_buffer_size)
            .field("workers", &self.workers)
            .field("mutable", &self.mutable)
            .finish()
    }
}

impl Options {
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn merge_operator(mut self, operator: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(operator);
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    pub fn wal_direct_io(mut self, enabled: bool) -> Self {
        self.wal_direct_io = enabled;
        self
    }

    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn wal_cleanup_interval(mut self, interval: Duration) -> Self {
        self.wal_cleanup_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.mutable.write_buffer_size = size;
        self
    }

    pub fn level0_compaction_threshold(mut self, threshold: usize) -> Self {
        self.mutable.level0_compaction_threshold = threshold;
        self
    }

    pub fn size_ratio_threshold(mut self, ratio: u32) -> Self {
        self.mutable.size_ratio_threshold = ratio;
        self
    }

    pub fn max_tables_per_level(mut self, max_tables: usize) -> Self {
        self.mutable.max_tables_per_level = max_tables;
        self
    }

    pub fn max_frozen_memtables(mut self, count: usize) -> Self {
        self.mutable.max_frozen_memtables = count;
        self
    }

    /// WAL write configuration derived from these options.
    pub(crate) fn wal_options(&self) -> crate::wal::WalOptions {
        crate::wal::WalOptions {
            use_direct_io: self.wal_direct_io,
            buffer_size: self.wal_buffer_size,
        }
    }

    /// Rejects invalid option combinations before any file I/O.
    pub fn validate(&self) -> Result<()> {
        if self.workers < 1 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be non-zero".into()));
        }
        if self.mutable.write_buffer_size == 0 {
            return Err(Error::Config("write_buffer_size must be non-zero".into()));
        }
        if self.mutable.max_frozen_memtables == 0 {
            return Err(Error::Config(
                "max_frozen_memtables must be non-zero".into(),
            ));
        }
        if self.wal_direct_io && self.wal_buffer_size % 4096 != 0 {
            return Err(Error::Config(
                "wal_buffer_size must be aligned to 4096 bytes for direct I/O".into(),
            ));
        }
        Ok(())
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Read at a fixed sequence number instead of the latest visible state.
    /// Usually populated from [`crate::engine::Snapshot::seq`].
    pub snapshot: Option<u64>,
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the WAL to disk before acknowledging the write.
    pub sync: bool,
}

/// Per-flush options.
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Wait for the flush to finish before returning.
    pub wait: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self { wait: true }
    }
}

/// Engine-internal configuration: the database directory plus the open-time
/// options it was opened with.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    pub dir: PathBuf,
    pub options: Options,
}

impl LsmConfig {
    pub fn new(dir: impl Into<PathBuf>, options: Options) -> Self {
        Self {
            dir: dir.into(),
            options,
        }
    }
}
