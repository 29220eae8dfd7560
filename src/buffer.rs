//! Buffer utilities for replication COPY sub-messages
//!
//! The streaming replication protocol frames keepalives, WAL data and
//! standby status updates as big-endian binary records inside CopyData.
//! These wrappers over the `bytes` crate read and write those records.

use crate::error::{CaptureError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Buffer reader for parsing binary protocol messages (network byte order)
///
/// # Example
///
/// ```
/// use pg_capture::BufferReader;
///
/// let data = vec![b'k', 0x00, 0x01];
/// let mut reader = BufferReader::new(&data);
///
/// assert_eq!(reader.peek_u8().unwrap(), b'k');
/// reader.skip_message_type().unwrap();
/// assert_eq!(reader.remaining(), 2);
/// ```
pub struct BufferReader {
    data: Bytes,
}

impl BufferReader {
    /// Create a new buffer reader by copying a byte slice
    #[inline]
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Create a new buffer reader that takes ownership of `data` without copying
    #[inline]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }

    /// Get remaining bytes in the buffer
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    #[inline]
    fn ensure_bytes(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(CaptureError::protocol(format!(
                "Not enough bytes remaining. Need {}, have {}",
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    /// Skip the message type byte
    #[inline]
    pub fn skip_message_type(&mut self) -> Result<()> {
        self.ensure_bytes(1)?;
        self.data.advance(1);
        Ok(())
    }

    #[inline]
    pub fn peek_u8(&self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.chunk()[0])
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.get_u8())
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_u64())
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_i64())
    }

    /// Take the rest of the buffer without copying
    #[inline]
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.data.remaining();
        self.data.copy_to_bytes(len)
    }
}

/// Buffer writer for building binary protocol messages
pub struct BufferWriter {
    data: BytesMut,
}

impl BufferWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.data.len()
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.data.put_u8(value);
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.data.put_u64(value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.data.put_i64(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_reader_integers() {
        let mut data = vec![b'w'];
        data.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
        data.extend_from_slice(&(-2i64).to_be_bytes());
        data.push(1);

        let mut reader = BufferReader::from_vec(data);
        assert_eq!(reader.read_u8().unwrap(), b'w');
        assert_eq!(reader.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.read_i64().unwrap(), -2);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_buffer_reader_errors() {
        let mut reader = BufferReader::new(&[0x01, 0x02]);
        assert!(reader.read_u64().is_err());
        // A failed read does not consume anything
        assert_eq!(reader.remaining(), 2);

        let mut empty = BufferReader::new(&[]);
        assert!(empty.peek_u8().is_err());
        assert!(empty.skip_message_type().is_err());
    }

    #[test]
    fn test_buffer_reader_read_remaining() {
        let mut reader = BufferReader::new(b"w{\"change\":[]}");
        reader.skip_message_type().unwrap();
        let rest = reader.read_remaining();
        assert_eq!(&rest[..], b"{\"change\":[]}");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_buffer_writer_roundtrip() {
        let mut writer = BufferWriter::with_capacity(17);
        writer.write_u8(b'r').unwrap();
        writer.write_u64(42).unwrap();
        writer.write_i64(-7).unwrap();
        assert_eq!(writer.bytes_written(), 17);

        let bytes = writer.freeze();
        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), b'r');
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_i64().unwrap(), -7);
    }
}
