//! Core entry model shared by the WAL, memtables, and table files.
//!
//! Every mutation is an [`Entry`]: a user key, a sequence number assigned at
//! the WAL-append point, and an operation. Sequence numbers totally order all
//! mutations across the engine; the visible value for a key at a snapshot is
//! the operation with the highest sequence number at or below the snapshot.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::comparator::Comparator;

/// A mutation against a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put(Vec<u8>),
    Merge(Vec<u8>),
    Delete,
}

impl Operation {
    pub fn code(&self) -> u8 {
        match self {
            Operation::Put(_) => 1,
            Operation::Merge(_) => 2,
            Operation::Delete => 3,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Operation::Put(v) | Operation::Merge(v) => Some(v),
            Operation::Delete => None,
        }
    }

    pub fn from_code(code: u8, value: Vec<u8>) -> Option<Self> {
        match code {
            1 => Some(Operation::Put(value)),
            2 => Some(Operation::Merge(value)),
            3 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// A fully qualified mutation as it travels through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub seq: u64,
    pub op: Operation,
}

impl Entry {
    pub fn new(key: Vec<u8>, seq: u64, op: Operation) -> Self {
        Self { key, seq, op }
    }

    /// Approximate in-memory footprint, used for memtable size accounting.
    pub fn charge(&self) -> usize {
        self.key.len() + self.op.value().map_or(0, |v| v.len()) + 16
    }
}

/// Memtable ordering key: user key ascending (per the configured comparator),
/// sequence number descending. Ranging from `(key, u64::MAX)` therefore
/// yields the newest version of `key` first.
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub seq: u64,
    comparator: Arc<dyn Comparator>,
}

impl InternalKey {
    pub fn new(user_key: Vec<u8>, seq: u64, comparator: Arc<dyn Comparator>) -> Self {
        Self {
            user_key,
            seq,
            comparator,
        }
    }
}

impl Clone for InternalKey {
    fn clone(&self) -> Self {
        Self {
            user_key: self.user_key.clone(),
            seq: self.seq,
            comparator: self.comparator.clone(),
        }
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalKey")
            .field("user_key", &self.user_key)
            .field("seq", &self.seq)
            .finish()
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
            && self
                .comparator
                .compare(&self.user_key, &other.user_key)
                .is_eq()
    }
}

impl Eq for InternalKey {}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.comparator.compare(&self.user_key, &other.user_key) {
            // Newer versions sort first within a key.
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}
