//! Write-Ahead Log: the durability record of every mutation.
//!
//! Each memtable is paired with one WAL segment. A mutation is serialized
//! and appended here before it becomes visible in the memtable, so replaying
//! a segment in order deterministically reconstructs the memtable that was
//! lost in a crash. Segments rotate when their memtable freezes and become
//! deletable once the flushed table is durably recorded in the manifest.
//!
//! # File format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each record is length-prefixed and checksummed:
//!
//! ```text
//! +-----------+----------------------------------------------+-----------+
//! |len:u32    | seq:u64 op:u8 key_len:u32 val_len:u32 key val |crc32:u32  |
//! +-----------+----------------------------------------------+-----------+
//! ```
//!
//! Multi-byte integers are big-endian. The CRC32 covers the whole payload.
//! Deletes carry `val_len = 0` and no value bytes.
//!
//! With direct I/O enabled, flushes zero-pad out to the 4 KiB alignment
//! boundary; a zero length prefix therefore marks padding, and replay skips
//! to the next boundary. The header records where the data region starts so
//! readers need no out-of-band knowledge of the write mode.

pub mod aligned_writer;
pub mod header;
pub mod recovery;

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::entry::{Entry, Operation};
use crate::error::{Error, Result};

use aligned_writer::{AlignedWriter, ALIGNMENT};
use header::{Header, HEADER_SIZE};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a single record; larger length prefixes are treated as
/// corruption instead of an allocation request.
const MAX_RECORD_SIZE: u32 = 1 << 30;

pub struct WalOptions {
    pub use_direct_io: bool,
    pub buffer_size: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            use_direct_io: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct Wal {
    /// Plain (non-direct) handle used for header rewrites and syncs.
    file: File,
    writer: Mutex<Box<dyn Write + Send>>,
    path: PathBuf,
    header: RwLock<Header>,
    direct_io: bool,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("direct_io", &self.direct_io)
            .finish()
    }
}

impl Wal {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, WalOptions::default())
    }

    pub fn with_options(path: impl AsRef<Path>, opts: WalOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if opts.use_direct_io && opts.buffer_size % ALIGNMENT != 0 {
            return Err(Error::Config(
                "WAL buffer size must be aligned to 4096 bytes for direct I/O".to_string(),
            ));
        }

        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let mut h = Header::new();
            h.data_start = if opts.use_direct_io {
                ALIGNMENT as u32
            } else {
                HEADER_SIZE as u32
            };
            file.write_all(&h.encode())?;
            file.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            Header::decode(&buf)?
        };

        let data_start = header.data_start as u64;

        // A separate handle carries the data writes so direct I/O never
        // touches the unaligned header region.
        let mut data_file = {
            let mut open_opts = File::options();
            open_opts.read(true).write(true);

            #[cfg(target_os = "linux")]
            if opts.use_direct_io {
                use std::os::unix::fs::OpenOptionsExt;
                open_opts.custom_flags(libc::O_DIRECT);
            }

            open_opts.open(&path)?
        };

        // Resume appending after existing records; a fresh direct-I/O file
        // skips ahead to the first aligned offset.
        let append_at = data_file.metadata()?.len().max(data_start);
        data_file.seek(SeekFrom::Start(append_at))?;

        let writer: Box<dyn Write + Send> = if opts.use_direct_io {
            Box::new(AlignedWriter::new(data_file, opts.buffer_size)?)
        } else {
            Box::new(BufWriter::with_capacity(opts.buffer_size, data_file))
        };

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
            header: RwLock::new(header),
            direct_io: opts.use_direct_io,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Ok(std::fs::remove_file(path)?)
    }

    /// Numeric segment ID, derived from the file name.
    pub fn id(&self) -> Result<u64> {
        self.path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|num| num.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidState(format!("invalid WAL file name: {:?}", self.path)))
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    pub fn entry_count(&self) -> u64 {
        self.header.read().map(|h| h.entry_count).unwrap_or(0)
    }

    pub fn max_seq(&self) -> u64 {
        self.header.read().map(|h| h.max_seq).unwrap_or(0)
    }

    /// Appends a mutation. Durability requires a subsequent [`Wal::flush`].
    pub fn append(&self, entry: &Entry) -> Result<()> {
        let value = entry.op.value().unwrap_or_default();

        let mut payload =
            Vec::with_capacity(8 + 1 + 4 + 4 + entry.key.len() + value.len());
        payload.write_u64::<BigEndian>(entry.seq)?;
        payload.write_u8(entry.op.code())?;
        payload.write_u32::<BigEndian>(entry.key.len() as u32)?;
        payload.write_u32::<BigEndian>(value.len() as u32)?;
        payload.extend_from_slice(&entry.key);
        payload.extend_from_slice(value);

        let checksum = CRC32.checksum(&payload);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        writer.write_u32::<BigEndian>(checksum)?;
        drop(writer);

        let mut header = self.header.write()?;
        header.entry_count += 1;
        header.max_seq = header.max_seq.max(entry.seq);

        Ok(())
    }

    /// Flushes buffered records and rewrites the header, then syncs. Held
    /// under the writer lock so concurrent flushes cannot interleave their
    /// header rewrites.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;

        let header_bytes = self.header.read()?.encode();

        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;

        Ok(())
    }

    /// Replays the segment from the beginning.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::open(&self.path)
    }
}

pub struct ReplayIterator {
    reader: BufReader<File>,
    /// Absolute file offset of the next unread byte.
    offset: u64,
}

impl ReplayIterator {
    /// Offset just past the last fully consumed record. After a corruption
    /// error this marks where the intact prefix of the segment ends.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl ReplayIterator {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        let header = Header::decode(&buf)?;

        let data_start = header.data_start as u64;
        reader.seek(SeekFrom::Start(data_start))?;

        Ok(ReplayIterator {
            reader,
            offset: data_start,
        })
    }

    fn read_record(&mut self) -> Result<Option<Entry>> {
        loop {
            let record_len = match self.reader.read_u32::<BigEndian>() {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            if record_len == 0 {
                // Direct-I/O padding: skip to the next alignment boundary.
                let target = (self.offset / ALIGNMENT as u64 + 1) * ALIGNMENT as u64;
                self.reader.seek(SeekFrom::Start(target))?;
                self.offset = target;
                continue;
            }

            if record_len > MAX_RECORD_SIZE {
                return Err(Error::corruption(
                    "wal record",
                    format!("record length {} exceeds limit", record_len),
                ));
            }

            self.offset += 4;

            let mut payload = vec![0u8; record_len as usize];
            self.reader
                .read_exact(&mut payload)
                .map_err(|e| Error::corruption("wal record", format!("truncated payload: {}", e)))?;

            let stored_crc = self
                .reader
                .read_u32::<BigEndian>()
                .map_err(|e| Error::corruption("wal record", format!("truncated checksum: {}", e)))?;

            if CRC32.checksum(&payload) != stored_crc {
                return Err(Error::corruption("wal record", "checksum mismatch"));
            }

            self.offset += record_len as u64 + 4;

            return Self::parse_payload(&payload).map(Some);
        }
    }

    fn parse_payload(payload: &[u8]) -> Result<Entry> {
        let mut cursor = Cursor::new(payload);

        let seq = cursor.read_u64::<BigEndian>()?;
        let op_code = cursor.read_u8()?;
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;

        let mut key = vec![0u8; key_len];
        cursor
            .read_exact(&mut key)
            .map_err(|e| Error::corruption("wal record", format!("truncated key: {}", e)))?;

        let mut value = vec![0u8; value_len];
        cursor
            .read_exact(&mut value)
            .map_err(|e| Error::corruption("wal record", format!("truncated value: {}", e)))?;

        let op = Operation::from_code(op_code, value).ok_or_else(|| {
            Error::corruption("wal record", format!("unknown operation code: {}", op_code))
        })?;

        Ok(Entry::new(key, seq, op))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    fn put(key: &[u8], seq: u64, value: &[u8]) -> Entry {
        Entry::new(key.to_vec(), seq, Operation::Put(value.to_vec()))
    }

    #[test]
    fn test_append_and_flush() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");

        wal.append(&put(b"key1", 1, b"value1")).expect("append");
        wal.append(&put(b"key2", 2, b"value2")).expect("append");
        wal.append(&Entry::new(b"key3".to_vec(), 3, Operation::Delete))
            .expect("append");
        wal.flush().expect("flush");

        assert_eq!(wal.entry_count(), 3);
        assert_eq!(wal.max_seq(), 3);
    }

    #[test]
    fn test_replay_preserves_order_and_operations() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");

        wal.append(&put(b"key1", 1, b"value1")).expect("append");
        wal.append(&Entry::new(
            b"key2".to_vec(),
            2,
            Operation::Merge(b"operand".to_vec()),
        ))
        .expect("append");
        wal.append(&Entry::new(b"key1".to_vec(), 3, Operation::Delete))
            .expect("append");
        wal.flush().expect("flush");

        let entries: Vec<_> = wal
            .replay()
            .expect("replay")
            .collect::<Result<Vec<_>>>()
            .expect("entries");

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], put(b"key1", 1, b"value1"));
        assert_eq!(
            entries[1],
            Entry::new(b"key2".to_vec(), 2, Operation::Merge(b"operand".to_vec()))
        );
        assert_eq!(entries[2], Entry::new(b"key1".to_vec(), 3, Operation::Delete));
    }

    #[test]
    fn test_empty_replay() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");

        assert_eq!(wal.replay().expect("replay").count(), 0);
    }

    #[test]
    fn test_reopen_appends_after_existing_records() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");

        {
            let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");
            wal.append(&put(b"key1", 1, b"value1")).expect("append");
            wal.flush().expect("flush");
        }

        let wal = Wal::new(temp_file.path()).expect("Failed to reopen WAL");
        assert_eq!(wal.entry_count(), 1);
        wal.append(&put(b"key2", 2, b"value2")).expect("append");
        wal.flush().expect("flush");

        let entries: Vec<_> = wal
            .replay()
            .expect("replay")
            .collect::<Result<Vec<_>>>()
            .expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, b"key1");
        assert_eq!(entries[1].key, b"key2");
    }

    #[test]
    fn test_corrupted_record_detected() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");

        wal.append(&put(b"key1", 1, b"value1")).expect("append");
        wal.append(&put(b"key2", 2, b"value2")).expect("append");
        wal.flush().expect("flush");

        // Scribble over the middle of the first record's payload.
        {
            let mut file = temp_file.reopen().expect("reopen");
            file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 9))
                .expect("seek");
            file.write_all(b"garbage").expect("write");
            file.sync_all().expect("sync");
        }

        let mut saw_corruption = false;
        for entry in wal.replay().expect("replay") {
            match entry {
                Err(Error::Corruption { .. }) => {
                    saw_corruption = true;
                    break;
                }
                Err(e) => panic!("Unexpected error during replay: {:?}", e),
                Ok(_) => {}
            }
        }
        assert!(saw_corruption, "Corruption not detected during replay");
    }

    #[test]
    fn test_delete_records_have_no_value() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");

        wal.append(&Entry::new(b"key1".to_vec(), 1, Operation::Delete))
            .expect("append");
        wal.append(&Entry::new(b"key2".to_vec(), 2, Operation::Delete))
            .expect("append");
        wal.flush().expect("flush");

        let entries: Vec<_> = wal
            .replay()
            .expect("replay")
            .collect::<Result<Vec<_>>>()
            .expect("entries");

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.op == Operation::Delete));
    }

    #[test]
    fn test_concurrent_replays() {
        use std::sync::Arc;
        use std::thread;

        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let wal = Wal::new(temp_file.path()).expect("Failed to initialize WAL");

        for i in 0..100u64 {
            let key = format!("key{}", i);
            let value = format!("value{}", i);
            wal.append(&put(key.as_bytes(), i + 1, value.as_bytes()))
                .expect("append");
        }
        wal.flush().expect("flush");

        let wal = Arc::new(wal);
        let mut handles = vec![];

        for _ in 0..3 {
            let wal = wal.clone();
            handles.push(thread::spawn(move || {
                wal.replay()
                    .expect("replay")
                    .map(|entry| entry.expect("entry"))
                    .count()
            }));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 100);
        }
    }
}
