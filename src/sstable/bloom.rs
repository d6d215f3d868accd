//! Bloom filter block for negative lookups.
//!
//! A table's filter answers "may this key exist here" without decoding any
//! data block. False positives are allowed; false negatives are not. Probe
//! positions are derived from the two halves of the CRC64 digest via double
//! hashing, so the filter is stable as long as the hash is.

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::hasher::Hasher;

pub struct BloomBuilder {
    bits_per_key: usize,
    hashes: Vec<u64>,
}

impl BloomBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key,
            hashes: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        self.hashes.push(Hasher::digest(key));
    }

    pub fn build(self) -> Bloom {
        // k = bits_per_key * ln(2), the optimal probe count.
        let num_probes = ((self.bits_per_key as f64 * 0.69) as u32).clamp(1, 30) as u8;

        let num_bits = (self.hashes.len() * self.bits_per_key).max(64);
        let mut bits = vec![0u8; num_bits.div_ceil(8)];
        let num_bits = bits.len() * 8;

        for hash in &self.hashes {
            let mut probe = *hash;
            let delta = hash.rotate_right(17);
            for _ in 0..num_probes {
                let bit = (probe % num_bits as u64) as usize;
                bits[bit / 8] |= 1 << (bit % 8);
                probe = probe.wrapping_add(delta);
            }
        }

        Bloom { bits, num_probes }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bloom {
    bits: Vec<u8>,
    num_probes: u8,
}

impl Bloom {
    /// Whether `key` may exist. False positives happen at roughly the
    /// configured rate; false negatives never.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return false;
        }

        let num_bits = self.bits.len() * 8;
        let hash = Hasher::digest(key);
        let mut probe = hash;
        let delta = hash.rotate_right(17);
        for _ in 0..self.num_probes {
            let bit = (probe % num_bits as u64) as usize;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            probe = probe.wrapping_add(delta);
        }
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.bits.len());
        buf.write_u8(self.num_probes).unwrap();
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let num_probes = cursor
            .read_u8()
            .map_err(|e| Error::corruption("table filter", format!("probe count: {}", e)))?;
        if num_probes == 0 || num_probes > 30 {
            return Err(Error::corruption(
                "table filter",
                format!("invalid probe count: {}", num_probes),
            ));
        }
        Ok(Self {
            bits: buf[1..].to_vec(),
            num_probes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_filter(keys: &[&[u8]]) -> Bloom {
        let mut builder = BloomBuilder::new(10);
        for key in keys {
            builder.add(key);
        }
        builder.build()
    }

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..1000)
            .map(|i| format!("key_{:05}", i).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let bloom = build_filter(&refs);

        for key in &keys {
            assert!(bloom.may_contain(key), "false negative for {:?}", key);
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let keys: Vec<Vec<u8>> = (0..1000)
            .map(|i| format!("key_{:05}", i).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let bloom = build_filter(&refs);

        let false_positives = (0..1000)
            .map(|i| format!("absent_{:05}", i).into_bytes())
            .filter(|key| bloom.may_contain(key))
            .count();

        // 10 bits per key targets ~1%; leave generous slack.
        assert!(
            false_positives < 100,
            "false positive rate too high: {}/1000",
            false_positives
        );
    }

    #[test]
    fn test_serialization_roundtrip() {
        let bloom = build_filter(&[b"apple", b"banana", b"cherry"]);
        let decoded = Bloom::decode(&bloom.encode()).expect("decode");
        assert_eq!(bloom, decoded);
        assert!(decoded.may_contain(b"apple"));
        assert!(decoded.may_contain(b"banana"));
    }

    #[test]
    fn test_invalid_probe_count_rejected() {
        assert!(matches!(
            Bloom::decode(&[0, 1, 2, 3]),
            Err(Error::Corruption { .. })
        ));
        assert!(matches!(
            Bloom::decode(&[99, 1, 2, 3]),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let bloom = BloomBuilder::new(10).build();
        assert!(!bloom.may_contain(b"anything"));
    }
}
