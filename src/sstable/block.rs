//! Prefix-compressed data blocks.
//!
//! Entries within a block share key prefixes with their predecessor; every
//! `RESTART_INTERVAL` entries a restart point stores the full key so that
//! seeks can binary-search restart points and then scan forward. Entry
//! layout:
//!
//! ```text
//! +---------+-----------+-----------+-------+------+------------+-------+
//! |shared:u16|unshared:u16|val_len:u32|seq:u64|op:u8 | key_suffix | value |
//! +---------+-----------+-----------+-------+------+------------+-------+
//! ```
//!
//! The restart position array and its length trail the entries.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::comparator::Comparator;
use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};

const RESTART_INTERVAL: usize = 16;

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in the block's sort order; the
    /// caller (the table builder) guarantees it.
    pub fn add_entry(&mut self, key: &[u8], seq: u64, op: &Operation) {
        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };

        let unshared_key_len = key.len() - shared_prefix_len;
        let value = op.value().unwrap_or_default();

        self.buffer
            .write_u16::<BigEndian>(shared_prefix_len as u16)
            .unwrap();
        self.buffer
            .write_u16::<BigEndian>(unshared_key_len as u16)
            .unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.write_u64::<BigEndian>(seq).unwrap();
        self.buffer.write_u8(op.code()).unwrap();
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let data_len = data.len();
        if data_len < 4 {
            return Err(Error::corruption("table block", "data too short"));
        }

        let num_restarts_offset = data_len - 4;
        let num_restarts =
            (&data[num_restarts_offset..]).read_u32::<BigEndian>()? as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(Error::corruption(
                "table block",
                "data too short for restart positions",
            ));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut cursor = &data[restart_array_offset..num_restarts_offset];
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            restart_positions.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restart_positions,
        })
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    offset: usize,
    last_key: Vec<u8>,
    pending: Option<Entry>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            offset: 0,
            last_key: Vec::new(),
            pending: None,
        }
    }

    /// Decodes the full key at a restart point without disturbing the
    /// iterator position.
    fn read_key_at(&self, offset: usize) -> Result<Vec<u8>> {
        let data = &self.block.data;
        if offset + 17 > data.len() {
            return Err(Error::corruption("table block", "restart point out of bounds"));
        }

        let shared = (&data[offset..]).read_u16::<BigEndian>()? as usize;
        let unshared = (&data[offset + 2..]).read_u16::<BigEndian>()? as usize;
        if shared != 0 {
            return Err(Error::corruption(
                "table block",
                "restart point key has a shared prefix",
            ));
        }

        let key_start = offset + 17;
        if key_start + unshared > data.len() {
            return Err(Error::corruption("table block", "entry out of bounds"));
        }
        Ok(data[key_start..key_start + unshared].to_vec())
    }

    fn decode_next(&mut self) -> Result<Option<Entry>> {
        let data = &self.block.data;
        if self.offset >= data.len() {
            return Ok(None);
        }
        if self.offset + 17 > data.len() {
            return Err(Error::corruption("table block", "truncated entry header"));
        }

        let mut pos = self.offset;
        let shared = (&data[pos..]).read_u16::<BigEndian>()? as usize;
        let unshared = (&data[pos + 2..]).read_u16::<BigEndian>()? as usize;
        let value_len = (&data[pos + 4..]).read_u32::<BigEndian>()? as usize;
        let seq = (&data[pos + 8..]).read_u64::<BigEndian>()?;
        let op_code = data[pos + 16];
        pos += 17;

        if pos + unshared + value_len > data.len() {
            return Err(Error::corruption("table block", "entry out of bounds"));
        }
        if shared > self.last_key.len() {
            return Err(Error::corruption("table block", "invalid shared prefix"));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        let op = Operation::from_code(op_code, value).ok_or_else(|| {
            Error::corruption("table block", format!("unknown operation code: {}", op_code))
        })?;

        self.offset = pos;
        self.last_key = key.clone();

        Ok(Some(Entry::new(key, seq, op)))
    }

    /// Positions the iterator so the next entry returned is the first one
    /// whose user key is `>= target` under the given comparator.
    pub fn seek(&mut self, target: &[u8], comparator: &dyn Comparator) -> Result<()> {
        // Binary-search restart points for the last one with key < target.
        let mut left = 0;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = self.read_key_at(self.block.restart_positions[mid] as usize)?;
            match comparator.compare(&key, target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.offset = self
            .block
            .restart_positions
            .get(restart_index)
            .map_or(0, |&p| p as usize);
        self.last_key.clear();
        self.pending = None;

        // Scan forward to the first entry at or past the target.
        while let Some(entry) = self.decode_next()? {
            if comparator.compare(&entry.key, target) != Ordering::Less {
                self.pending = Some(entry);
                break;
            }
        }
        Ok(())
    }
}

impl Iterator for BlockIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.pending.take() {
            return Some(Ok(entry));
        }
        match self.decode_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build_block(entries: &[(&[u8], u64, Operation)]) -> Arc<Block> {
        let mut builder = Builder::new();
        for (key, seq, op) in entries {
            builder.add_entry(key, *seq, op);
        }
        Arc::new(Block::new(builder.finish()).expect("valid block"))
    }

    #[test]
    fn test_roundtrip_preserves_entries() {
        let entries = vec![
            (b"apple".as_slice(), 3, Operation::Put(b"fruit".to_vec())),
            (b"application".as_slice(), 2, Operation::Merge(b"software".to_vec())),
            (b"banana".as_slice(), 1, Operation::Delete),
        ];
        let block = build_block(&entries);

        let decoded: Vec<_> = block
            .iter()
            .collect::<Result<Vec<_>>>()
            .expect("decode");

        assert_eq!(decoded.len(), 3);
        for (decoded, (key, seq, op)) in decoded.iter().zip(&entries) {
            assert_eq!(decoded.key, *key);
            assert_eq!(decoded.seq, *seq);
            assert_eq!(&decoded.op, op);
        }
    }

    #[test]
    fn test_prefix_compression_across_restarts() {
        // More entries than one restart interval, all sharing prefixes.
        let entries: Vec<(Vec<u8>, u64)> = (0..50u64)
            .map(|i| (format!("key_{:04}", i).into_bytes(), i + 1))
            .collect();

        let mut builder = Builder::new();
        for (key, seq) in &entries {
            builder.add_entry(key, *seq, &Operation::Put(b"v".to_vec()));
        }
        let block = Arc::new(Block::new(builder.finish()).expect("valid block"));

        let decoded: Vec<_> = block
            .iter()
            .collect::<Result<Vec<_>>>()
            .expect("decode");
        assert_eq!(decoded.len(), 50);
        for (decoded, (key, seq)) in decoded.iter().zip(&entries) {
            assert_eq!(&decoded.key, key);
            assert_eq!(decoded.seq, *seq);
        }
    }

    #[test]
    fn test_seek_positions_at_first_matching_key() {
        let entries: Vec<(Vec<u8>, u64)> = (0..40u64)
            .map(|i| (format!("key_{:04}", i).into_bytes(), i + 1))
            .collect();

        let mut builder = Builder::new();
        for (key, seq) in &entries {
            builder.add_entry(key, *seq, &Operation::Put(b"v".to_vec()));
        }
        let block = Arc::new(Block::new(builder.finish()).expect("valid block"));

        let mut iter = block.clone().iter();
        iter.seek(b"key_0025", &BytewiseComparator).expect("seek");

        let first = iter.next().expect("entry").expect("ok");
        assert_eq!(first.key, b"key_0025");

        // Seeking between keys lands on the next greater key.
        let mut iter = block.clone().iter();
        iter.seek(b"key_0025a", &BytewiseComparator).expect("seek");
        let first = iter.next().expect("entry").expect("ok");
        assert_eq!(first.key, b"key_0026");
    }

    #[test]
    fn test_seek_past_end_yields_nothing() {
        let block = build_block(&[(b"alpha", 1, Operation::Put(b"v".to_vec()))]);
        let mut iter = block.iter();
        iter.seek(b"zzz", &BytewiseComparator).expect("seek");
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_multiple_versions_of_same_key() {
        // Versions of one key are stored newest first.
        let block = build_block(&[
            (b"key", 9, Operation::Delete),
            (b"key", 5, Operation::Put(b"v5".to_vec())),
            (b"key", 1, Operation::Put(b"v1".to_vec())),
        ]);

        let decoded: Vec<_> = block
            .iter()
            .collect::<Result<Vec<_>>>()
            .expect("decode");
        let seqs: Vec<u64> = decoded.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![9, 5, 1]);
    }

    #[test]
    fn test_truncated_block_rejected() {
        assert!(matches!(
            Block::new(vec![0, 1]),
            Err(Error::Corruption { .. })
        ));
    }
}
