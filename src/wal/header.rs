use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"EMBER\0WL";
const VERSION: u32 = 1;

/// Fixed-size WAL file header. Rewritten in place on every sync so replay
/// can cross-check the entry count and the highest sequence number the
/// segment is expected to contain. `data_start` records the offset of the
/// first record, which differs between buffered and direct-I/O segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub entry_count: u64,
    pub max_seq: u64,
    pub data_start: u32,
}

impl Header {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            entry_count: 0,
            max_seq: 0,
            data_start: HEADER_SIZE as u32,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::corruption("wal header", "invalid magic"));
        }
        if self.version != VERSION {
            return Err(Error::corruption(
                "wal header",
                format!("unsupported version: {}", self.version),
            ));
        }
        if (self.data_start as usize) < HEADER_SIZE {
            return Err(Error::corruption(
                "wal header",
                format!("data region starts inside header: {}", self.data_start),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        (&mut buf[8..12])
            .write_u32::<BigEndian>(self.version)
            .unwrap();
        (&mut buf[12..20])
            .write_u64::<BigEndian>(self.entry_count)
            .unwrap();
        (&mut buf[20..28]).write_u64::<BigEndian>(self.max_seq).unwrap();
        (&mut buf[28..32])
            .write_u32::<BigEndian>(self.data_start)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        let entry_count = (&buf[12..20]).read_u64::<BigEndian>()?;
        let max_seq = (&buf[20..28]).read_u64::<BigEndian>()?;
        let data_start = (&buf[28..32]).read_u32::<BigEndian>()?;

        let header = Self {
            magic,
            version,
            entry_count,
            max_seq,
            data_start,
        };
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = Header::new();
        header.entry_count = 42;
        header.max_seq = 987;
        header.data_start = 4096;

        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = Header::decode(&encoded).expect("Failed to decode header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(b"INVALID!");
        (&mut buf[8..12]).write_u32::<BigEndian>(VERSION).unwrap();

        let result = Header::decode(&buf);
        assert!(matches!(result, Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut header = Header::new();
        header.version = 999;
        let encoded = header.encode();

        let result = Header::decode(&encoded);
        assert!(matches!(result, Err(Error::Corruption { .. })));
    }
}
