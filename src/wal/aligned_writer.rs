//! Buffered writer satisfying direct I/O alignment requirements.
//!
//! Direct I/O (`O_DIRECT` on Linux) bypasses the page cache, which makes a
//! sync a real durability guarantee instead of a hint. It imposes three
//! constraints: the buffer address, the write length, and the file offset
//! must all be multiples of the block size. `AlignedWriter` stages bytes in
//! an aligned buffer and zero-pads each flush out to the next boundary.
//!
//! The padding means a direct-I/O log is not byte-contiguous: after a flush
//! the next record starts at an aligned offset. Readers handle this by
//! treating a zero length prefix as padding and skipping to the next
//! alignment boundary (see the WAL replay iterator).

use std::alloc::{alloc, dealloc, Layout};
use std::fs::File;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};

/// Required alignment for direct I/O; 4 KiB on effectively all modern
/// storage.
pub const ALIGNMENT: usize = 4096;

pub struct AlignedWriter {
    /// Underlying file; must be opened with `O_DIRECT` for the alignment
    /// to matter.
    file: File,
    buffer: AlignedBuffer,
    /// Bytes staged in `buffer`, from 0 to `buffer.capacity`.
    position: usize,
}

impl AlignedWriter {
    pub fn new(file: File, capacity: usize) -> io::Result<Self> {
        Ok(Self {
            file,
            buffer: AlignedBuffer::new(capacity),
            position: 0,
        })
    }
}

impl Write for AlignedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Fits into the remaining buffer space.
        let space_in_buffer = self.buffer.capacity - self.position;
        if buf.len() <= space_in_buffer {
            let end = self.position + buf.len();
            self.buffer[self.position..end].copy_from_slice(buf);
            self.position = end;
            return Ok(buf.len());
        }

        // The buffer would overflow; flush the staged bytes first.
        self.flush()?;

        // Larger than the whole buffer: write the aligned prefix directly
        // and stage the remainder.
        if buf.len() > self.buffer.capacity {
            let aligned_len = (buf.len() / ALIGNMENT) * ALIGNMENT;
            self.file.write_all(&buf[..aligned_len])?;

            let remainder = &buf[aligned_len..];
            self.buffer[..remainder.len()].copy_from_slice(remainder);
            self.position = remainder.len();

            return Ok(buf.len());
        }

        self.buffer[..buf.len()].copy_from_slice(buf);
        self.position = buf.len();

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.position == 0 {
            return Ok(());
        }

        let aligned_size = self.position.div_ceil(ALIGNMENT) * ALIGNMENT;

        // Zero-pad out to the next alignment boundary.
        for i in self.position..aligned_size {
            self.buffer[i] = 0;
        }

        self.file.write_all(&self.buffer[..aligned_size])?;
        self.position = 0;

        Ok(())
    }
}

struct AlignedBuffer {
    data: *mut u8,
    capacity: usize,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, ALIGNMENT).unwrap();
        let data = unsafe { alloc(layout) };

        Self {
            data,
            capacity,
            layout,
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.capacity) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.capacity) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::io::Read;

    #[test]
    fn test_buffer_address_is_aligned() {
        let buffer = AlignedBuffer::new(8192);
        assert_eq!(buffer.capacity, 8192);
        assert_eq!(buffer.data as usize % ALIGNMENT, 0);
    }

    #[test]
    fn test_small_write_is_padded() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = AlignedWriter::new(temp_file.reopen().unwrap(), 8192).unwrap();

        let data = b"Hello, World!";
        writer.write_all(data).unwrap();
        writer.flush().unwrap();

        let mut file = temp_file.reopen().unwrap();
        let mut result = vec![0u8; ALIGNMENT];
        file.read_exact(&mut result).unwrap();

        assert_eq!(&result[..data.len()], data);
        assert!(result[data.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_larger_than_buffer() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = AlignedWriter::new(temp_file.reopen().unwrap(), 8192).unwrap();

        let data = vec![0xCD; 20000];
        writer.write_all(&data).unwrap();
        writer.flush().unwrap();

        let mut file = temp_file.reopen().unwrap();
        let aligned_size = 20000_usize.div_ceil(ALIGNMENT) * ALIGNMENT;
        let mut result = vec![0u8; aligned_size];
        file.read_exact(&mut result).unwrap();

        assert_eq!(&result[..20000], &data[..]);
        assert!(result[20000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_size_stays_aligned() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = AlignedWriter::new(temp_file.reopen().unwrap(), 8192).unwrap();

        writer.write_all(&[0xFF; 100]).unwrap();
        writer.flush().unwrap();

        let metadata = temp_file.reopen().unwrap().metadata().unwrap();
        assert_eq!(metadata.len() % ALIGNMENT as u64, 0);
    }

    #[test]
    fn test_auto_flush_on_full_buffer() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = AlignedWriter::new(temp_file.reopen().unwrap(), ALIGNMENT).unwrap();

        let first_write = vec![0xAA; 4000];
        let second_write = vec![0xBB; 200];

        writer.write_all(&first_write).unwrap();
        writer.write_all(&second_write).unwrap();
        writer.flush().unwrap();

        let mut file = temp_file.reopen().unwrap();
        let mut result = vec![0u8; 2 * ALIGNMENT];
        file.read_exact(&mut result).unwrap();

        assert_eq!(&result[..4000], &first_write[..]);
        assert_eq!(&result[ALIGNMENT..ALIGNMENT + 200], &second_write[..]);
    }
}
