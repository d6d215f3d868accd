//! Range-filtering iterator adapter shared by memtable, table, and merge
//! scans. Wraps any stream of entries and yields only those whose user key
//! falls inside the bound range, terminating early once keys pass the end
//! bound.

use std::cmp::Ordering;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::entry::Entry;
use crate::error::Result;

pub struct RangeFilter<I, R>
where
    I: Iterator<Item = Result<Entry>>,
    R: RangeBounds<Vec<u8>>,
{
    inner: I,
    range: R,
    comparator: Arc<dyn Comparator>,
}

impl<I, R> RangeFilter<I, R>
where
    I: Iterator<Item = Result<Entry>>,
    R: RangeBounds<Vec<u8>>,
{
    pub fn new(inner: I, range: R, comparator: Arc<dyn Comparator>) -> Self {
        Self {
            inner,
            range,
            comparator,
        }
    }

    fn is_key_in_range(&self, key: &[u8]) -> bool {
        match self.range.start_bound() {
            Bound::Included(start) => {
                if self.comparator.compare(key, start) == Ordering::Less {
                    return false;
                }
            }
            Bound::Excluded(start) => {
                if self.comparator.compare(key, start) != Ordering::Greater {
                    return false;
                }
            }
            Bound::Unbounded => {}
        }
        !self.is_key_beyond_end(key)
    }

    fn is_key_beyond_end(&self, key: &[u8]) -> bool {
        match self.range.end_bound() {
            Bound::Included(end) => self.comparator.compare(key, end) == Ordering::Greater,
            Bound::Excluded(end) => self.comparator.compare(key, end) != Ordering::Less,
            Bound::Unbounded => false,
        }
    }
}

impl<I, R> Iterator for RangeFilter<I, R>
where
    I: Iterator<Item = Result<Entry>>,
    R: RangeBounds<Vec<u8>>,
{
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(entry) => {
                    if self.is_key_in_range(&entry.key) {
                        return Some(Ok(entry));
                    }
                    // Sources yield keys in order, so passing the end bound
                    // means nothing further can match.
                    if self.is_key_beyond_end(&entry.key) {
                        return None;
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
