//! Immutable buffers and positioned readers.

use bytes::Bytes;

use crate::error::WireError;
use crate::varint;

/// An immutable, addressable span of bytes.
///
/// Sub-range views share the underlying storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadBuffer {
    bytes: Bytes,
}

impl ReadBuffer {
    /// Wrap existing bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Number of readable bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte at `offset`
    pub fn byte_at(&self, offset: usize) -> Result<u8, WireError> {
        self.bytes
            .get(offset)
            .copied()
            .ok_or_else(|| WireError::out_of_bounds(offset, 1, self.len()))
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> Result<(), WireError> {
        self.check(offset, dst.len())?;
        dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
        Ok(())
    }

    /// Zero-copy view of `len` bytes starting at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> Result<ReadBuffer, WireError> {
        self.check(offset, len)?;
        Ok(Self {
            bytes: self.bytes.slice(offset..offset + len),
        })
    }

    /// Sequential reader positioned at the start of the buffer
    pub fn input(&self) -> BufferInput<'_> {
        BufferInput {
            buffer: self,
            offset: 0,
        }
    }

    /// Borrow the contents
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared handle to the contents
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), WireError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(WireError::out_of_bounds(offset, len, self.len())),
        }
    }
}

impl From<Vec<u8>> for ReadBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<Bytes> for ReadBuffer {
    fn from(bytes: Bytes) -> Self {
        Self { bytes }
    }
}

/// Cursor over a [`ReadBuffer`].
///
/// Each input tracks its own offset, so any number of inputs may read the
/// same buffer independently. A read that runs past the end moves the
/// cursor to the end and fails with [`WireError::Eof`].
#[derive(Debug, Clone)]
pub struct BufferInput<'a> {
    buffer: &'a ReadBuffer,
    offset: usize,
}

impl<'a> BufferInput<'a> {
    /// The buffer being read
    pub fn buffer(&self) -> &'a ReadBuffer {
        self.buffer
    }

    /// Current read position
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reposition the cursor; `offset` may equal the buffer length
    pub fn set_offset(&mut self, offset: usize) -> Result<(), WireError> {
        if offset > self.buffer.len() {
            return Err(WireError::out_of_bounds(offset, 0, self.buffer.len()));
        }
        self.offset = offset;
        Ok(())
    }

    /// Bytes left to read
    pub fn available(&self) -> usize {
        self.buffer.len() - self.offset
    }

    /// Unread bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.buffer.as_slice()[self.offset..]
    }

    /// Advance the cursor by up to `n` bytes, returning how many were skipped
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.available());
        self.offset += n;
        n
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.available() {
            self.offset = self.buffer.len();
            return Err(WireError::Eof);
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.buffer.as_slice()[start..start + n])
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Fill `dst` completely
    pub fn read_fully(&mut self, dst: &mut [u8]) -> Result<(), WireError> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Read a single-byte boolean
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a packed 64-bit integer
    pub fn read_packed_i64(&mut self) -> Result<i64, WireError> {
        let (n, len) = self.decode(varint::decode_packed)?;
        self.offset += len;
        Ok(n)
    }

    /// Read a packed 32-bit integer
    pub fn read_packed_i32(&mut self) -> Result<i32, WireError> {
        let (n, len) = self.decode(varint::decode_packed_i32)?;
        self.offset += len;
        Ok(n)
    }

    /// Read a packed 16-bit integer
    pub fn read_packed_i16(&mut self) -> Result<i16, WireError> {
        let (n, len) = self.decode(varint::decode_packed_i16)?;
        self.offset += len;
        Ok(n)
    }

    fn decode<T>(
        &mut self,
        f: fn(&[u8]) -> Result<(T, usize), WireError>,
    ) -> Result<(T, usize), WireError> {
        f(self.remaining()).inspect_err(|e| {
            if *e == WireError::Eof {
                self.offset = self.buffer.len();
            }
        })
    }

    /// Read a big-endian IEEE-754 single
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        let mut raw = [0u8; 4];
        self.read_fully(&mut raw)?;
        Ok(f32::from_bits(u32::from_be_bytes(raw)))
    }

    /// Read a big-endian IEEE-754 double
    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        let mut raw = [0u8; 8];
        self.read_fully(&mut raw)?;
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }

    /// Read one UTF-16 code unit stored in its 1, 2 or 3 byte UTF-8 form
    pub fn read_char(&mut self) -> Result<u16, WireError> {
        let b = self.read_u8()? as u16;
        match b >> 4 {
            0x0..=0x7 => Ok(b),
            0xC | 0xD => {
                let b2 = self.read_continuation()?;
                Ok(((b & 0x1F) << 6) | b2)
            }
            0xE => {
                let b2 = self.read_continuation()?;
                let b3 = self.read_continuation()?;
                Ok(((b & 0x0F) << 12) | (b2 << 6) | b3)
            }
            _ => Err(WireError::Utf(format!("illegal leading byte: 0x{b:02x}"))),
        }
    }

    fn read_continuation(&mut self) -> Result<u16, WireError> {
        let b = self.read_u8()?;
        if b & 0xC0 != 0x80 {
            return Err(WireError::Utf(format!("illegal continuation byte: 0x{b:02x}")));
        }
        Ok((b & 0x3F) as u16)
    }

    /// Read a length-prefixed UTF-8 string; a length of -1 reads as `None`
    pub fn read_string(&mut self) -> Result<Option<String>, WireError> {
        let Some(len) = self.read_length()? else {
            return Ok(None);
        };
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(|s| Some(s.to_owned()))
            .map_err(|e| WireError::Utf(e.to_string()))
    }

    /// Read a length-prefixed octet string as a zero-copy view
    pub fn read_octets(&mut self) -> Result<Option<ReadBuffer>, WireError> {
        match self.read_length()? {
            Some(len) => self.read_buffer(len).map(Some),
            None => Ok(None),
        }
    }

    /// Zero-copy view of the next `len` bytes
    pub fn read_buffer(&mut self, len: usize) -> Result<ReadBuffer, WireError> {
        if len > self.available() {
            self.offset = self.buffer.len();
            return Err(WireError::Eof);
        }
        let view = self.buffer.slice(self.offset, len)?;
        self.offset += len;
        Ok(view)
    }

    fn read_length(&mut self) -> Result<Option<usize>, WireError> {
        match self.read_packed_i32()? {
            -1 => Ok(None),
            n if n < -1 => Err(WireError::Malformed(format!("negative length {n}"))),
            n => Ok(Some(n as usize)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_shares_storage() {
        let buffer = ReadBuffer::new(vec![1u8, 2, 3, 4, 5]);
        let view = buffer.slice(1, 3).unwrap();
        assert_eq!(view.as_slice(), &[2, 3, 4]);
        assert!(buffer.slice(3, 3).is_err());
        assert_eq!(buffer.byte_at(4).unwrap(), 5);
        assert!(buffer.byte_at(5).is_err());
    }

    #[test]
    fn test_independent_cursors() {
        let buffer = ReadBuffer::new(vec![0xA3u8, 0x01, 0x05]);
        let mut a = buffer.input();
        let mut b = buffer.input();
        assert_eq!(a.read_packed_i32().unwrap(), 99);
        assert_eq!(b.read_u8().unwrap(), 0xA3);
        assert_eq!(a.offset(), 2);
        assert_eq!(b.offset(), 1);
        assert_eq!(a.read_packed_i32().unwrap(), 5);
        assert_eq!(a.available(), 0);
    }

    #[test]
    fn test_eof_moves_to_end() {
        let buffer = ReadBuffer::new(vec![1u8, 2, 3]);
        let mut input = buffer.input();
        input.read_u8().unwrap();
        assert_eq!(input.read_f64(), Err(WireError::Eof));
        assert_eq!(input.offset(), 3);
        assert_eq!(input.read_u8(), Err(WireError::Eof));
    }

    #[test]
    fn test_set_offset_bounds() {
        let buffer = ReadBuffer::new(vec![0u8; 4]);
        let mut input = buffer.input();
        input.set_offset(4).unwrap();
        assert!(input.set_offset(5).is_err());
        assert_eq!(input.skip(10), 0);
    }

    #[test]
    fn test_bad_utf8_rejected() {
        // length 2, then an invalid continuation
        let buffer = ReadBuffer::new(vec![0x02u8, 0xC3, 0x28]);
        assert!(matches!(buffer.input().read_string(), Err(WireError::Utf(_))));

        let buffer = ReadBuffer::new(vec![0xC3u8, 0x28]);
        assert!(matches!(buffer.input().read_char(), Err(WireError::Utf(_))));
    }

    #[test]
    fn test_negative_length_rejected() {
        // -2 packed
        let buffer = ReadBuffer::new(vec![0x41u8]);
        assert!(matches!(
            buffer.input().read_string(),
            Err(WireError::Malformed(_))
        ));
    }
}
