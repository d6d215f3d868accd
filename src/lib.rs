//! emberdb: an embedded, ordered, persistent key-value storage engine.
//!
//! A single-process LSM-tree supporting point lookups, inserts, deletes,
//! value merges, atomic flushes, dynamic reconfiguration, and a read-only
//! secondary mode that tails a primary's write-ahead log and manifest.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Active Memtable │    │ Frozen Memtables│
//! │   (SkipList)    │◄───┤   (SkipLists)   │
//! └─────────────────┘    └─────────────────┘
//!           │                       │
//!           ▼                       ▼
//!      ┌────────┐             ┌─────────────┐
//!      │WAL File│             │  Level 0    │
//!      └────────┘             │ (Tables)    │
//!                             └─────────────┘
//!                                   │
//!                                   ▼
//!                             ┌─────────────┐
//!                             │  Level 1..N │
//!                             └─────────────┘
//! ```
//!
//! A write is appended to the WAL, then installed in the active memtable;
//! durability precedes visibility. Full memtables freeze and flush to
//! immutable level-0 table files recorded in the manifest; tiered
//! compaction merges levels to bound read cost. Reads probe the memtables
//! and then table files newest-first, resolving recency by sequence number
//! and folding merge operands through the configured operator.
//!
//! # Example
//!
//! ```no_run
//! use emberdb::{Db, FlushOptions, Options, ReadOptions, WriteOptions};
//!
//! # async fn example() -> emberdb::Result<()> {
//! let db = Db::open("/tmp/mydb", Options::default())?;
//! db.put(&WriteOptions::default(), b"hello", b"world")?;
//! assert_eq!(
//!     db.get(&ReadOptions::default(), b"hello")?,
//!     Some(b"world".to_vec())
//! );
//! db.flush(&FlushOptions::default()).await?;
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod comparator;
pub mod config;
pub mod db;
pub mod engine;
pub mod entry;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod scheduler;
pub mod sstable;
pub mod tmpfs;
pub mod wal;

pub use comparator::{BytewiseComparator, Comparator};
pub use config::{FlushOptions, MutableOptions, Options, ReadOptions, WriteOptions};
pub use db::Db;
pub use engine::{LsmTree, Snapshot};
pub use error::{Error, Result};
pub use merge::{AppendOperator, MergeOperator};
