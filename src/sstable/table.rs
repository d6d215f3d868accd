//! Table file lifecycle: building a new immutable sorted file and reading
//! an existing one.
//!
//! # File layout
//!
//! ```text
//! +--------------------+
//! | Data Block 1       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Data Block N       |
//! +--------------------+
//! | Filter Block       |  (absent when bloom filters are disabled)
//! +--------------------+
//! | Index Block        |
//! +--------------------+
//! | filter_offset: u64 |
//! | index_offset:  u64 |
//! +--------------------+
//! ```
//!
//! Entries carry their sequence number and operation kind, so one file can
//! hold several versions of a key. The builder never splits the versions of
//! a key across two blocks, which lets point lookups stop at a single block.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::block::{Block, BlockIterator, Builder};
use super::bloom::{Bloom, BloomBuilder};
use super::filter::RangeFilter;
use super::index::{keys_equal, BlockHandle, Index};
use crate::comparator::Comparator;
use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};

const FOOTER_SIZE: u64 = 16;

/// Summary of a finished table, fed into the manifest's table metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBuildSummary {
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub max_seq: u64,
    pub file_size: u64,
}

/// Streams sorted entries into a new table file.
pub struct TableBuilder {
    file: File,
    path: PathBuf,
    comparator: Arc<dyn Comparator>,
    block: Builder,
    index: Index,
    bloom: Option<BloomBuilder>,
    block_size: usize,
    offset: u64,
    block_first_key: Option<Vec<u8>>,
    last_user_key: Option<Vec<u8>>,
    entry_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    max_seq: u64,
}

impl TableBuilder {
    pub fn new(
        path: impl AsRef<Path>,
        comparator: Arc<dyn Comparator>,
        block_size: usize,
        bloom_bits_per_key: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            comparator,
            block: Builder::new(),
            index: Index::new(),
            bloom: (bloom_bits_per_key > 0).then(|| BloomBuilder::new(bloom_bits_per_key)),
            block_size,
            offset: 0,
            block_first_key: None,
            last_user_key: None,
            entry_count: 0,
            min_key: None,
            max_key: None,
            max_seq: 0,
        })
    }

    /// Appends the next entry. Entries must arrive in internal-key order:
    /// user key ascending, sequence descending within a key.
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        let key_changed = match &self.last_user_key {
            Some(last) => !keys_equal(self.comparator.as_ref(), last, &entry.key),
            None => true,
        };

        // Cut only at key boundaries so a key's versions stay in one block.
        if key_changed && self.block.len() >= self.block_size {
            self.cut_block()?;
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(entry.key.clone());
        }
        if key_changed {
            if let Some(bloom) = &mut self.bloom {
                bloom.add(&entry.key);
            }
        }

        self.block.add_entry(&entry.key, entry.seq, &entry.op);
        self.entry_count += 1;
        self.max_seq = self.max_seq.max(entry.seq);
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = Some(entry.key.clone());
        self.last_user_key = Some(entry.key.clone());

        Ok(())
    }

    fn cut_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }

        let block = std::mem::replace(&mut self.block, Builder::new());
        let data = block.finish();

        let first_key = self.block_first_key.take().ok_or_else(|| {
            Error::InvalidState("data block has entries but no first key".to_string())
        })?;

        self.file.write_all(&data)?;
        self.index.push(first_key, self.offset, data.len() as u64);
        self.offset += data.len() as u64;

        Ok(())
    }

    /// Writes the filter, index, and footer, then syncs the file.
    pub fn finish(mut self) -> Result<TableBuildSummary> {
        self.cut_block()?;

        let filter_offset = self.offset;
        if let Some(bloom) = self.bloom.take() {
            let data = bloom.build().encode();
            self.file.write_all(&data)?;
            self.offset += data.len() as u64;
        }

        let index_offset = self.offset;
        let index_data = self.index.encode()?;
        self.file.write_all(&index_data)?;
        self.offset += index_data.len() as u64;

        self.file.write_u64::<BigEndian>(filter_offset)?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.flush()?;
        self.file.sync_all()?;

        Ok(TableBuildSummary {
            entry_count: self.entry_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
            max_seq: self.max_seq,
            file_size: self.offset + FOOTER_SIZE,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes written so far plus the partially built block. Compaction uses
    /// this to cut output files at the target size.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// The most recently added user key. Output files may only be cut at a
    /// key boundary, so every version of a key lands in one file.
    pub fn last_user_key(&self) -> Option<&[u8]> {
        self.last_user_key.as_deref()
    }
}

/// An open table file: index and filter in memory, data blocks on disk.
///
/// Each lookup and scan opens its own read handle so concurrent readers
/// never share a seek cursor.
pub struct ReadableTable {
    path: PathBuf,
    index: Index,
    bloom: Option<Bloom>,
    comparator: Arc<dyn Comparator>,
}

impl ReadableTable {
    pub fn open(path: impl AsRef<Path>, comparator: Arc<dyn Comparator>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE {
            return Err(Error::corruption("table file", "file shorter than footer"));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let filter_offset = file.read_u64::<BigEndian>()?;
        let index_offset = file.read_u64::<BigEndian>()?;

        if filter_offset > index_offset || index_offset > file_size - FOOTER_SIZE {
            return Err(Error::corruption("table file", "footer offsets out of range"));
        }

        let mut index_data = vec![0u8; (file_size - FOOTER_SIZE - index_offset) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        let index = Index::decode(&index_data)?;

        let bloom = if index_offset > filter_offset {
            let mut filter_data = vec![0u8; (index_offset - filter_offset) as usize];
            file.seek(SeekFrom::Start(filter_offset))?;
            file.read_exact(&mut filter_data)?;
            Some(Bloom::decode(&filter_data)?)
        } else {
            None
        };

        Ok(Self {
            path,
            index,
            bloom,
            comparator,
        })
    }

    /// Filter-only membership probe. May return false positives, never
    /// false negatives; tables without a filter always answer true.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom
            .as_ref()
            .map_or(true, |bloom| bloom.may_contain(key))
    }

    /// All versions of `key` at or below `max_seq` stored in this table,
    /// newest first.
    pub fn versions(&self, key: &[u8], max_seq: u64) -> Result<Vec<(u64, Operation)>> {
        if !self.may_contain(key) {
            return Ok(Vec::new());
        }

        let handle = match self.index.find(key, self.comparator.as_ref()) {
            Some(handle) => handle,
            None => return Ok(Vec::new()),
        };

        let block = Arc::new(self.read_block(handle)?);
        let mut iter = block.iter();
        iter.seek(key, self.comparator.as_ref())?;

        let mut versions = Vec::new();
        for entry in iter {
            let entry = entry?;
            if !keys_equal(self.comparator.as_ref(), &entry.key, key) {
                break;
            }
            if entry.seq <= max_seq {
                versions.push((entry.seq, entry.op));
            }
        }
        Ok(versions)
    }

    /// Iterates all versions within the user-key range, in internal-key
    /// order.
    pub fn scan<R>(&self, range: R) -> Result<ScanIterator<R>>
    where
        R: RangeBounds<Vec<u8>> + Clone,
    {
        let handles = self.index.range(range.clone(), self.comparator.as_ref());
        let mut iter = MultiBlockIterator::new(File::open(&self.path)?, handles);

        if let Some(start_key) = start_key_of(&range) {
            iter.seek_first_block(start_key, self.comparator.as_ref())?;
        }

        Ok(RangeFilter::new(iter, range, self.comparator.clone()))
    }

    fn read_block(&self, (offset, size): BlockHandle) -> Result<Block> {
        let mut data = vec![0u8; size as usize];
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut data)?;
        Block::new(data)
    }
}

use std::ops::{Bound, RangeBounds};

fn start_key_of<R: RangeBounds<Vec<u8>>>(range: &R) -> Option<&[u8]> {
    match range.start_bound() {
        Bound::Included(key) | Bound::Excluded(key) => Some(key.as_slice()),
        Bound::Unbounded => None,
    }
}

/// Sequential reader over a run of data blocks.
pub struct MultiBlockIterator {
    reader: File,
    blocks: Vec<BlockHandle>,
    next_block: usize,
    current: Option<BlockIterator>,
}

impl MultiBlockIterator {
    pub fn new(reader: File, blocks: Vec<BlockHandle>) -> Self {
        Self {
            reader,
            blocks,
            next_block: 0,
            current: None,
        }
    }

    fn load_next_block(&mut self) -> Result<bool> {
        if self.next_block >= self.blocks.len() {
            return Ok(false);
        }
        let (offset, size) = self.blocks[self.next_block];
        self.next_block += 1;

        let mut data = vec![0u8; size as usize];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut data)?;

        self.current = Some(Arc::new(Block::new(data)?).iter());
        Ok(true)
    }

    /// Seeks within the first block so the scan starts at the range's start
    /// key instead of the block's first entry.
    pub fn seek_first_block(&mut self, target: &[u8], comparator: &dyn Comparator) -> Result<()> {
        if !self.load_next_block()? {
            return Ok(());
        }
        if let Some(iter) = &mut self.current {
            iter.seek(target, comparator)?;
        }
        Ok(())
    }
}

impl Iterator for MultiBlockIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                match iter.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            } else {
                match self.load_next_block() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
        }
    }
}

/// Iterator over a bounded range of a table file.
pub type ScanIterator<R> = RangeFilter<MultiBlockIterator, R>;
