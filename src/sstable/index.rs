//! Sparse block index: one entry per data block, keyed by the block's first
//! user key. Lookups binary-search it to find the single block that may
//! contain a key; scans slice it into a run of block handles.

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::ops::{Bound, RangeBounds};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::comparator::Comparator;
use crate::error::{Error, Result};

/// Offset and length of one data block within the table file.
pub type BlockHandle = (u64, u64);

#[derive(Debug, Clone, Default)]
pub struct Index {
    /// `(first_key, block_offset, block_size)`, in key order.
    entries: Vec<(Vec<u8>, u64, u64)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, first_key: Vec<u8>, offset: u64, size: u64) {
        self.entries.push((first_key, offset, size));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The handle of the block that may contain `key`: the last block whose
    /// first key is `<= key`. `None` when `key` sorts before every block.
    pub fn find(&self, key: &[u8], comparator: &dyn Comparator) -> Option<BlockHandle> {
        let idx = match self
            .entries
            .binary_search_by(|entry| comparator.compare(&entry.0, key))
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        self.entries.get(idx).map(|(_, offset, size)| (*offset, *size))
    }

    /// Handles of every block that may intersect the user-key range.
    pub fn range<R>(&self, range: R, comparator: &dyn Comparator) -> Vec<BlockHandle>
    where
        R: RangeBounds<Vec<u8>>,
    {
        let search = |key: &Vec<u8>| {
            self.entries
                .binary_search_by(|entry| comparator.compare(&entry.0, key))
        };

        let start_index = match range.start_bound() {
            // The block preceding the bound's insertion point may still
            // contain keys inside the range.
            Bound::Included(start) | Bound::Excluded(start) => match search(start) {
                Ok(idx) => idx,
                Err(idx) => idx.saturating_sub(1),
            },
            Bound::Unbounded => 0,
        };

        let end_index = match range.end_bound() {
            Bound::Included(end) => match search(end) {
                Ok(idx) => idx + 1,
                Err(idx) => idx,
            },
            Bound::Excluded(end) => match search(end) {
                Ok(idx) => idx,
                Err(idx) => idx,
            },
            Bound::Unbounded => self.entries.len(),
        };

        if start_index >= end_index {
            return Vec::new();
        }

        self.entries[start_index..end_index]
            .iter()
            .map(|(_, offset, size)| (*offset, *size))
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for (key, offset, size) in &self.entries {
            buffer.write_u16::<BigEndian>(key.len() as u16)?;
            buffer.write_all(key)?;
            buffer.write_u64::<BigEndian>(*offset)?;
            buffer.write_u64::<BigEndian>(*size)?;
        }
        Ok(buffer)
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buffer);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < buffer.len() {
            let key_len = cursor
                .read_u16::<BigEndian>()
                .map_err(|e| Error::corruption("table index", format!("key length: {}", e)))?
                as usize;

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::corruption("table index", format!("key: {}", e)))?;

            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::corruption("table index", format!("block offset: {}", e)))?;
            let size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::corruption("table index", format!("block size: {}", e)))?;

            entries.push((key, offset, size));
        }
        Ok(Self { entries })
    }
}

/// Equality helper for user keys under a comparator.
pub(crate) fn keys_equal(comparator: &dyn Comparator, a: &[u8], b: &[u8]) -> bool {
    comparator.compare(a, b) == Ordering::Equal
}
