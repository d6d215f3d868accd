//! Manifest: the durable log of which table files constitute the database.
//!
//! Where the WAL records changes to user data, the manifest records changes
//! to the database's structure: tables created by flushes, tables retired
//! and created by compactions, and periodic full-state snapshots that keep
//! replay bounded. It is the single source of truth for the live table set;
//! a table file absent from the replayed state is logically deleted no
//! matter what sits on disk.
//!
//! # File format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | VersionEdit 1    |
//! +------------------+
//! | VersionEdit 2    |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each edit is framed `len:u32 | edit bytes | crc32:u32`, big-endian, the
//! same discipline as WAL records. On open, a corrupt tail (a crash mid-
//! append) is truncated back to the last intact edit; a read-only replayer
//! instead stops at the first bad frame, since the primary may be appending
//! concurrently.

pub mod edit;
pub mod header;
pub mod level;
pub mod meta;
pub mod version;

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub use edit::VersionEdit;
pub use level::{Level, SSTable};
pub use meta::{LevelMeta, TableMeta};
pub use version::Version;

use header::{ManifestHeader, HEADER_SIZE};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const MANIFEST_FILE: &str = "manifest.log";

pub struct Manifest {
    path: std::path::PathBuf,
    /// Append handle. Its cursor belongs to edit frames only; header
    /// rewrites go through `header_file` so they never disturb it.
    writer: Mutex<BufWriter<File>>,
    header_file: Mutex<File>,
    header: RwLock<ManifestHeader>,
    edit_count: AtomicU32,
}

impl Manifest {
    /// Opens or creates the manifest at `path`. A corrupt tail left by a
    /// crash mid-append is truncated away so new edits frame cleanly.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut header_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = if header_file.metadata()?.len() == 0 {
            let h = ManifestHeader::new();
            header_file.write_all(&h.encode())?;
            header_file.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            header_file.seek(SeekFrom::Start(0))?;
            header_file.read_exact(&mut buf)?;
            let header = ManifestHeader::decode(&buf)?;

            // Scan for a torn trailing edit and drop it.
            let mut iter = ManifestIterator::new(File::open(&path)?)?;
            let mut valid_end = HEADER_SIZE as u64;
            loop {
                match iter.next() {
                    Some(Ok(_)) => valid_end = iter.offset(),
                    Some(Err(_)) => {
                        tracing::warn!(
                            path = %path.display(),
                            offset = valid_end,
                            "Truncating corrupt manifest tail"
                        );
                        header_file.set_len(valid_end)?;
                        header_file.sync_all()?;
                        break;
                    }
                    None => break,
                }
            }
            header
        };

        let mut write_handle = OpenOptions::new().write(true).open(&path)?;
        write_handle.seek(SeekFrom::End(0))?;
        let writer = BufWriter::new(write_handle);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            header_file: Mutex::new(header_file),
            header: RwLock::new(header),
            edit_count: AtomicU32::new(0),
        })
    }

    pub fn append(&self, edit: VersionEdit) -> Result<()> {
        let edit_bytes = edit.encode();
        let checksum = CRC32.checksum(&edit_bytes);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(edit_bytes.len() as u32)?;
        writer.write_all(&edit_bytes)?;
        writer.write_u32::<BigEndian>(checksum)?;
        drop(writer);

        let seq = edit.seq();
        {
            let mut header = self.header.write()?;
            header.current_seq = header.current_seq.max(seq);
            if let VersionEdit::Snapshot { next_table_id, .. } = &edit {
                header.next_table_id = header.next_table_id.max(*next_table_id);
            }
        }

        self.edit_count.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;

        let header_bytes = self.header.read()?.encode();

        let mut file = self.header_file.lock()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;

        Ok(())
    }

    pub fn iter(&self) -> Result<ManifestIterator> {
        // A fresh read-only handle keeps iteration independent of the
        // append and header cursors.
        ManifestIterator::new(File::open(&self.path)?)
    }

    /// Reserves the next manifest edit sequence number.
    pub fn next_seq(&self) -> u64 {
        let mut header = self.header.write().unwrap();
        header.current_seq += 1;
        header.current_seq
    }

    /// Whether enough edits have accumulated that the caller should append
    /// a full state snapshot.
    pub fn should_snapshot(&self) -> bool {
        self.edit_count.load(Ordering::SeqCst) >= self.header.read().unwrap().snapshot_interval
    }

    pub fn note_snapshot_written(&self) {
        self.edit_count.store(0, Ordering::SeqCst);
    }

    /// Replays all edits into the level structure they describe.
    pub fn replay(&self) -> Result<ManifestState> {
        replay_edits(self.iter()?, false)
    }
}

/// Replays a manifest file opened read-only, without creating or modifying
/// anything. Used by secondary instances tailing a primary's manifest; a
/// torn trailing edit (the primary may be mid-append) ends the replay.
pub fn replay_read_only(path: impl AsRef<Path>) -> Result<ManifestState> {
    let file = File::open(path.as_ref())?;
    let iter = ManifestIterator::new(file)?;
    replay_edits(iter, true)
}

fn replay_edits(iter: ManifestIterator, tolerate_trailing_corruption: bool) -> Result<ManifestState> {
    let mut state = ManifestState::new();
    let mut last_snapshot_seq: Option<u64> = None;

    for edit in iter {
        let edit = match edit {
            Ok(edit) => edit,
            Err(e) if tolerate_trailing_corruption => {
                tracing::debug!(error = %e, "Stopping manifest replay at torn edit");
                break;
            }
            Err(e) => return Err(e),
        };

        state.last_edit_seq = state.last_edit_seq.max(edit.seq());

        match edit {
            VersionEdit::Snapshot {
                seq,
                levels,
                next_table_id,
            } => {
                state.levels.clear();
                for level_meta in levels {
                    let idx = level_meta.level as usize;
                    state.ensure_level(level_meta.level);
                    state.levels[idx] = level_meta;
                }
                state.next_table_id = next_table_id;
                last_snapshot_seq = Some(seq);
            }

            VersionEdit::Flush { seq, table, wal_id } => {
                if last_snapshot_seq.is_some_and(|snap| seq <= snap) {
                    continue;
                }
                let table_id = table.id;
                let level = table.level;
                state.add_table_at_level(table, level);
                state.next_table_id = state.next_table_id.max(table_id + 1);
                state.flushed_wals.push(wal_id);
            }

            VersionEdit::BeginCompaction { .. } => {}

            VersionEdit::CommitCompaction {
                seq,
                source_level,
                deleted_tables,
                target_level,
                added_tables,
                ..
            } => {
                if last_snapshot_seq.is_some_and(|snap| seq <= snap) {
                    continue;
                }
                state.delete_tables(source_level, &deleted_tables);
                for table in added_tables {
                    state.next_table_id = state.next_table_id.max(table.id + 1);
                    state.add_table_at_level(table, target_level);
                }
            }
        }
    }

    Ok(state)
}

/// The level structure a manifest replay reconstructs.
#[derive(Debug, Clone, Default)]
pub struct ManifestState {
    pub levels: Vec<LevelMeta>,
    pub next_table_id: u64,
    /// WAL segments durably reflected in table files, eligible for cleanup.
    pub flushed_wals: Vec<u64>,
    pub last_edit_seq: u64,
}

impl ManifestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest data sequence number any live table contains.
    pub fn max_table_seq(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|level| &level.tables)
            .map(|table| table.max_seq)
            .max()
            .unwrap_or(0)
    }

    fn ensure_level(&mut self, level: u32) {
        while self.levels.len() <= level as usize {
            self.levels.push(LevelMeta {
                level: self.levels.len() as u32,
                tables: Vec::new(),
            });
        }
    }

    fn add_table_at_level(&mut self, table: TableMeta, level: u32) {
        self.ensure_level(level);
        self.levels[level as usize].tables.push(table);
    }

    fn delete_tables(&mut self, level: u32, table_ids: &[u64]) {
        if let Some(level_meta) = self.levels.get_mut(level as usize) {
            level_meta.tables.retain(|t| !table_ids.contains(&t.id));
        }
    }
}

pub struct ManifestIterator {
    reader: BufReader<File>,
    offset: u64,
}

impl ManifestIterator {
    fn new(file: File) -> Result<Self> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(ManifestIterator {
            reader,
            offset: HEADER_SIZE as u64,
        })
    }

    /// Offset just past the last fully consumed edit.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Iterator for ManifestIterator {
    type Item = Result<VersionEdit>;

    fn next(&mut self) -> Option<Self::Item> {
        let edit_len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut edit_bytes = vec![0u8; edit_len];
        if let Err(e) = self.reader.read_exact(&mut edit_bytes) {
            return Some(Err(Error::corruption(
                "manifest edit",
                format!("truncated edit: {}", e),
            )));
        }

        let stored_checksum = match self.reader.read_u32::<BigEndian>() {
            Ok(checksum) => checksum,
            Err(e) => {
                return Some(Err(Error::corruption(
                    "manifest edit",
                    format!("truncated checksum: {}", e),
                )))
            }
        };

        if CRC32.checksum(&edit_bytes) != stored_checksum {
            return Some(Err(Error::corruption("manifest edit", "checksum mismatch")));
        }

        self.offset += 4 + edit_len as u64 + 4;

        Some(VersionEdit::decode(&edit_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn create_test_table_meta(id: u64) -> TableMeta {
        TableMeta {
            id,
            level: 0,
            size: 1024,
            entry_count: 100,
            min_key: vec![1, 2, 3],
            max_key: vec![9, 8, 7],
            max_seq: id * 10,
        }
    }

    #[test]
    fn test_open_fresh_manifest() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path().join(MANIFEST_FILE))?;

        let header = manifest.header.read().unwrap();
        assert_eq!(header.current_seq, 0);
        assert_eq!(header.next_table_id, 0);

        Ok(())
    }

    #[test]
    fn test_append_and_iter() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path().join(MANIFEST_FILE))?;

        let edit = VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(0),
            wal_id: 10,
        };

        manifest.append(edit.clone())?;
        manifest.sync()?;

        let edits: Vec<_> = manifest.iter()?.collect::<Result<Vec<_>>>()?;
        assert_eq!(edits, vec![edit]);

        Ok(())
    }

    #[test]
    fn test_replay_flushes() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path().join(MANIFEST_FILE))?;

        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(0),
            wal_id: 1,
        })?;
        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(1),
            wal_id: 2,
        })?;
        manifest.sync()?;

        let state = manifest.replay()?;
        assert_eq!(state.next_table_id, 2);
        assert_eq!(state.levels.len(), 1);
        assert_eq!(state.levels[0].tables.len(), 2);
        assert_eq!(state.flushed_wals, vec![1, 2]);
        assert_eq!(state.max_table_seq(), 10);

        Ok(())
    }

    #[test]
    fn test_replay_compaction() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path().join(MANIFEST_FILE))?;

        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(0),
            wal_id: 1,
        })?;
        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(1),
            wal_id: 2,
        })?;

        manifest.append(VersionEdit::BeginCompaction {
            seq: manifest.next_seq(),
            job_id: 100,
            source_level: 0,
            target_level: 1,
        })?;

        let mut compacted = create_test_table_meta(2);
        compacted.level = 1;
        manifest.append(VersionEdit::CommitCompaction {
            seq: manifest.next_seq(),
            job_id: 100,
            source_level: 0,
            deleted_tables: vec![0, 1],
            target_level: 1,
            added_tables: vec![compacted],
        })?;
        manifest.sync()?;

        let state = manifest.replay()?;
        assert_eq!(state.next_table_id, 3);
        assert_eq!(state.levels[0].tables.len(), 0);
        assert_eq!(state.levels[1].tables.len(), 1);
        assert_eq!(state.levels[1].tables[0].id, 2);

        Ok(())
    }

    #[test]
    fn test_replay_incomplete_compaction_changes_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path().join(MANIFEST_FILE))?;

        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(0),
            wal_id: 1,
        })?;
        manifest.append(VersionEdit::BeginCompaction {
            seq: manifest.next_seq(),
            job_id: 100,
            source_level: 0,
            target_level: 1,
        })?;
        manifest.sync()?;

        let state = manifest.replay()?;
        assert_eq!(state.levels[0].tables.len(), 1);
        assert_eq!(state.levels[0].tables[0].id, 0);

        Ok(())
    }

    #[test]
    fn test_replay_snapshot_discards_prior_edits() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path().join(MANIFEST_FILE))?;

        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(0),
            wal_id: 1,
        })?;

        let mut snap_table = create_test_table_meta(5);
        snap_table.level = 1;
        manifest.append(VersionEdit::Snapshot {
            seq: manifest.next_seq(),
            levels: vec![LevelMeta {
                level: 1,
                tables: vec![snap_table],
            }],
            next_table_id: 10,
        })?;

        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(10),
            wal_id: 5,
        })?;
        manifest.sync()?;

        let state = manifest.replay()?;
        assert_eq!(state.next_table_id, 11);
        assert_eq!(state.levels[0].tables.len(), 1);
        assert_eq!(state.levels[0].tables[0].id, 10);
        assert_eq!(state.levels[1].tables.len(), 1);
        assert_eq!(state.levels[1].tables[0].id, 5);

        Ok(())
    }

    #[test]
    fn test_reopen_preserves_edits() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MANIFEST_FILE);

        {
            let manifest = Manifest::open(&path)?;
            manifest.append(VersionEdit::Flush {
                seq: manifest.next_seq(),
                table: create_test_table_meta(0),
                wal_id: 5,
            })?;
            manifest.sync()?;
        }

        let manifest = Manifest::open(&path)?;
        let edits: Vec<_> = manifest.iter()?.collect::<Result<Vec<_>>>()?;
        assert_eq!(edits.len(), 1);

        // New edits append after the existing ones.
        manifest.append(VersionEdit::Flush {
            seq: manifest.next_seq(),
            table: create_test_table_meta(1),
            wal_id: 6,
        })?;
        manifest.sync()?;

        let edits: Vec<_> = manifest.iter()?.collect::<Result<Vec<_>>>()?;
        assert_eq!(edits.len(), 2);

        Ok(())
    }

    #[test]
    fn test_open_truncates_corrupt_tail() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MANIFEST_FILE);

        {
            let manifest = Manifest::open(&path)?;
            manifest.append(VersionEdit::Flush {
                seq: manifest.next_seq(),
                table: create_test_table_meta(0),
                wal_id: 1,
            })?;
            manifest.append(VersionEdit::Flush {
                seq: manifest.next_seq(),
                table: create_test_table_meta(1),
                wal_id: 2,
            })?;
            manifest.sync()?;
        }

        // Tear the second edit by chopping bytes off the end.
        {
            let file = OpenOptions::new().write(true).open(&path)?;
            let len = file.metadata()?.len();
            file.set_len(len - 10)?;
        }

        let manifest = Manifest::open(&path)?;
        let state = manifest.replay()?;
        assert_eq!(state.levels[0].tables.len(), 1);
        assert_eq!(state.levels[0].tables[0].id, 0);

        Ok(())
    }

    #[test]
    fn test_checksum_corruption_detected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MANIFEST_FILE);

        {
            let manifest = Manifest::open(&path)?;
            manifest.append(VersionEdit::Flush {
                seq: manifest.next_seq(),
                table: create_test_table_meta(0),
                wal_id: 1,
            })?;
            manifest.sync()?;
        }

        // Corrupt the stored checksum of the only edit.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            file.seek(SeekFrom::End(-4))?;
            file.write_all(&[0xFF, 0xFF, 0xFF, 0xFF])?;
        }

        // Open detects and truncates the bad edit; nothing remains.
        let manifest = Manifest::open(&path)?;
        let state = manifest.replay()?;
        assert!(state.levels.is_empty());

        Ok(())
    }

    #[test]
    fn test_read_only_replay_stops_at_torn_edit() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MANIFEST_FILE);

        {
            let manifest = Manifest::open(&path)?;
            manifest.append(VersionEdit::Flush {
                seq: manifest.next_seq(),
                table: create_test_table_meta(0),
                wal_id: 1,
            })?;
            manifest.sync()?;
        }

        // Simulate the primary mid-append: a dangling partial frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_u32::<BigEndian>(500)?;
            file.write_all(b"partial")?;
        }

        let state = replay_read_only(&path)?;
        assert_eq!(state.levels[0].tables.len(), 1);

        Ok(())
    }
}
