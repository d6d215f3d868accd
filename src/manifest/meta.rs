use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// Durable description of one table file.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub id: u64,
    pub level: u32,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    /// Highest sequence number stored in the table. Drives WAL retirement
    /// and secondary catch-up high-water marks.
    pub max_seq: u64,
}

impl TableMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.id).unwrap();
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u64::<BigEndian>(self.max_seq).unwrap();

        buf.write_u32::<BigEndian>(self.min_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.min_key);

        buf.write_u32::<BigEndian>(self.max_key.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.max_key);
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = cursor.read_u64::<BigEndian>()?;
        let level = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;
        let max_seq = cursor.read_u64::<BigEndian>()?;

        let min_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut min_key = vec![0u8; min_key_len];
        cursor.read_exact(&mut min_key)?;

        let max_key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut max_key = vec![0u8; max_key_len];
        cursor.read_exact(&mut max_key)?;

        Ok(TableMeta {
            id,
            level,
            size,
            entry_count,
            min_key,
            max_key,
            max_seq,
        })
    }
}

/// Durable description of one level's table set.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelMeta {
    pub level: u32,
    pub tables: Vec<TableMeta>,
}

impl LevelMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u32::<BigEndian>(self.tables.len() as u32)
            .unwrap();
        for table in &self.tables {
            table.encode_into(buf);
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let level = cursor.read_u32::<BigEndian>()?;
        let table_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut tables = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            tables.push(TableMeta::decode_from(cursor)?);
        }
        Ok(LevelMeta { level, tables })
    }
}
