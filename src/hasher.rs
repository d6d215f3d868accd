//! Incremental CRC64 hasher. The Bloom filter derives its probe sequence
//! from the two 32-bit halves of this digest, so the hash must be stable
//! across versions.

use std::fmt;

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

#[derive(Clone)]
pub struct Hasher {
    crc64: Crc<u64>,
    buffer: Vec<u8>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
            buffer: Vec::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn checksum(&self) -> u64 {
        self.crc64.checksum(&self.buffer)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// One-shot digest of a single buffer.
    pub fn digest(data: &[u8]) -> u64 {
        Crc::<u64>::new(&CRC_64_ECMA).checksum(data)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = Hasher::new();
        hasher.write(b"hello ");
        hasher.write(b"world");
        assert_eq!(hasher.checksum(), Hasher::digest(b"hello world"));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut hasher = Hasher::new();
        hasher.write(b"hello");
        let first = hasher.checksum();

        hasher.reset();
        hasher.write(b"hello");
        assert_eq!(first, hasher.checksum());
    }

    #[test]
    fn test_different_data_different_checksums() {
        assert_ne!(Hasher::digest(b"hello"), Hasher::digest(b"world"));
    }
}
