//! Snapshot registry: fixed sequence-number boundaries defining consistent
//! read views.
//!
//! A snapshot pins its sequence number in the registry for as long as it is
//! alive; compaction consults the minimum pinned sequence before collapsing
//! key versions or dropping tombstones. Release is RAII, so a leaked-free
//! exit path is guaranteed even on errors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub struct SnapshotRegistry {
    active: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn register(&self, seq: u64) -> Snapshot {
        *self.active.lock().unwrap().entry(seq).or_insert(0) += 1;
        Snapshot {
            seq,
            registry: self.active.clone(),
        }
    }

    /// The oldest sequence any live snapshot still observes.
    pub fn min_active(&self) -> Option<u64> {
        self.active
            .lock()
            .unwrap()
            .keys()
            .next()
            .copied()
    }
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A consistent read view at a fixed sequence number. Reads issued with
/// this snapshot's sequence never observe later writes.
pub struct Snapshot {
    seq: u64,
    registry: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl Snapshot {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut active = self.registry.lock().unwrap();
        if let Some(count) = active.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.seq);
            }
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("seq", &self.seq).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_release() {
        let registry = SnapshotRegistry::new();
        assert!(registry.min_active().is_none());

        let snap = registry.register(10);
        assert_eq!(snap.seq(), 10);
        assert_eq!(registry.min_active(), Some(10));

        drop(snap);
        assert!(registry.min_active().is_none());
    }

    #[test]
    fn test_min_tracks_oldest() {
        let registry = SnapshotRegistry::new();
        let old = registry.register(5);
        let new = registry.register(20);

        assert_eq!(registry.min_active(), Some(5));
        drop(old);
        assert_eq!(registry.min_active(), Some(20));
        drop(new);
    }

    #[test]
    fn test_duplicate_sequences_refcounted() {
        let registry = SnapshotRegistry::new();
        let a = registry.register(7);
        let b = registry.register(7);

        drop(a);
        // The second snapshot at the same sequence keeps it pinned.
        assert_eq!(registry.min_active(), Some(7));
        drop(b);
        assert!(registry.min_active().is_none());
    }
}
