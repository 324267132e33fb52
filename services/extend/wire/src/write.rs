//! Growable and delegating write buffers with positioned writers.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::WireError;
use crate::read::ReadBuffer;
use crate::varint::{self, MAX_PACKED_LEN};

/// Minimum number of bytes added by each growth step
pub const MIN_GROWTH: usize = 1024;

/// Above this capacity a buffer grows by half instead of doubling
pub const HUGE_CAPACITY: usize = 0x10_0000;

/// A byte buffer that can be written at arbitrary offsets, growing up to a
/// hard maximum capacity.
///
/// Writing beyond the current length extends it; any gap is zero-filled.
/// Buffers are not safe for concurrent mutation.
pub trait WriteBuffer: Send {
    /// Bytes written so far
    fn len(&self) -> usize;

    /// Whether nothing has been written
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the buffer can hold without growing
    fn capacity(&self) -> usize;

    /// Hard limit on the length of the buffer
    fn max_capacity(&self) -> usize;

    /// Copy `src` into the buffer at `offset`
    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), WireError>;

    /// Keep only `len` bytes starting at `offset`, moved to the front
    fn retain(&mut self, offset: usize, len: usize) -> Result<(), WireError>;

    /// Discard all content
    fn clear(&mut self);

    /// Borrow the written bytes
    fn as_slice(&self) -> &[u8];

    /// Copy a range of a [`ReadBuffer`] into the buffer at `offset`
    fn write_buffer(
        &mut self,
        offset: usize,
        src: &ReadBuffer,
        src_offset: usize,
        len: usize,
    ) -> Result<(), WireError> {
        let view = src.slice(src_offset, len)?;
        self.write(offset, view.as_slice())
    }

    /// Snapshot of the written bytes
    fn read_buffer(&self) -> ReadBuffer {
        ReadBuffer::new(Bytes::copy_from_slice(self.as_slice()))
    }
}

fn check_write(offset: usize, len: usize, max: usize) -> Result<usize, WireError> {
    match offset.checked_add(len) {
        Some(end) if end <= max => Ok(end),
        _ => Err(WireError::out_of_bounds(offset, len, max)),
    }
}

fn check_retain(offset: usize, len: usize, current: usize) -> Result<(), WireError> {
    match offset.checked_add(len) {
        Some(end) if end <= current => Ok(()),
        _ => Err(WireError::out_of_bounds(offset, len, current)),
    }
}

/// Heap-backed [`WriteBuffer`].
///
/// Grows by at least [`MIN_GROWTH`] bytes per step: doubling while small,
/// +50% once past [`HUGE_CAPACITY`], never beyond the maximum capacity.
#[derive(Debug, Clone)]
pub struct ByteArrayWriteBuffer {
    buf: BytesMut,
    capacity: usize,
    max: usize,
}

impl ByteArrayWriteBuffer {
    /// Create a buffer with an initial capacity and no practical maximum
    pub fn new(capacity: usize) -> Self {
        Self::with_max(capacity, usize::MAX)
    }

    /// Create a buffer with an initial capacity and a hard maximum
    pub fn with_max(capacity: usize, max: usize) -> Self {
        let capacity = capacity.min(max);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            max,
        }
    }

    /// Freeze the contents into a [`ReadBuffer`] without copying
    pub fn freeze(self) -> ReadBuffer {
        ReadBuffer::new(self.buf.freeze())
    }

    /// Sequential writer appending after the current contents
    pub fn output(&mut self) -> BufferOutput<'_> {
        BufferOutput::new(self)
    }

    fn grow(&mut self, required: usize) {
        let old = self.capacity;
        let add = MIN_GROWTH.max(if old > HUGE_CAPACITY { old >> 1 } else { old });
        let new = self
            .max
            .min(required.saturating_add(MIN_GROWTH).max(old.saturating_add(add)));
        if new > old {
            trace!("growing write buffer from {} to {} bytes", old, new);
            self.buf.reserve(new - self.buf.len());
            self.capacity = new;
        }
    }
}

impl Default for ByteArrayWriteBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WriteBuffer for ByteArrayWriteBuffer {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn max_capacity(&self) -> usize {
        self.max
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), WireError> {
        let end = check_write(offset, src.len(), self.max)?;
        if end > self.capacity {
            self.grow(end);
        }
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(src);
        Ok(())
    }

    fn retain(&mut self, offset: usize, len: usize) -> Result<(), WireError> {
        check_retain(offset, len, self.buf.len())?;
        self.buf.copy_within(offset..offset + len, 0);
        self.buf.truncate(len);
        Ok(())
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// A window onto another buffer.
///
/// Offsets are relative to `start` in the underlying buffer and the window
/// never grows past its own maximum, whatever the underlying buffer allows.
/// Used to hand a bounded region to serialization code without copying.
pub struct DelegatingWriteBuffer<'a> {
    inner: &'a mut dyn WriteBuffer,
    start: usize,
    len: usize,
    max: usize,
}

impl<'a> DelegatingWriteBuffer<'a> {
    /// Window over `inner` beginning at `start`, limited to `max` bytes
    pub fn new(inner: &'a mut dyn WriteBuffer, start: usize, max: usize) -> Result<Self, WireError> {
        if start > inner.len() {
            return Err(WireError::out_of_bounds(start, 0, inner.len()));
        }
        let max = max.min(inner.max_capacity() - start);
        let len = (inner.len() - start).min(max);
        Ok(Self {
            inner,
            start,
            len,
            max,
        })
    }

    /// Offset of the window within the underlying buffer
    pub fn start(&self) -> usize {
        self.start
    }

    /// Sequential writer over the window
    pub fn output(&mut self) -> BufferOutput<'_> {
        BufferOutput::new(self)
    }
}

impl WriteBuffer for DelegatingWriteBuffer<'_> {
    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.inner
            .capacity()
            .saturating_sub(self.start)
            .min(self.max)
    }

    fn max_capacity(&self) -> usize {
        self.max
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), WireError> {
        let end = check_write(offset, src.len(), self.max)?;
        self.inner.write(self.start + offset, src)?;
        self.len = self.len.max(end);
        Ok(())
    }

    fn retain(&mut self, offset: usize, len: usize) -> Result<(), WireError> {
        check_retain(offset, len, self.len)?;
        if offset > 0 && len > 0 {
            let moved = self.as_slice()[offset..offset + len].to_vec();
            self.inner.write(self.start, &moved)?;
        }
        self.len = len;
        Ok(())
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn as_slice(&self) -> &[u8] {
        &self.inner.as_slice()[self.start..self.start + self.len]
    }
}

/// Positioned writer over a [`WriteBuffer`].
///
/// The cursor is independent of the buffer's own length accounting, so a
/// writer may be moved back to patch bytes already written.
pub struct BufferOutput<'a> {
    buffer: &'a mut dyn WriteBuffer,
    offset: usize,
}

impl<'a> BufferOutput<'a> {
    /// Writer positioned at the end of `buffer`
    pub fn new(buffer: &'a mut dyn WriteBuffer) -> Self {
        let offset = buffer.len();
        Self { buffer, offset }
    }

    /// Writer positioned at `offset`
    pub fn at(buffer: &'a mut dyn WriteBuffer, offset: usize) -> Result<Self, WireError> {
        if offset > buffer.max_capacity() {
            return Err(WireError::out_of_bounds(offset, 0, buffer.max_capacity()));
        }
        Ok(Self { buffer, offset })
    }

    /// Current write position
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Move the cursor
    pub fn set_offset(&mut self, offset: usize) -> Result<(), WireError> {
        if offset > self.buffer.max_capacity() {
            return Err(WireError::out_of_bounds(offset, 0, self.buffer.max_capacity()));
        }
        self.offset = offset;
        Ok(())
    }

    /// The buffer being written
    pub fn buffer(&self) -> &dyn WriteBuffer {
        &*self.buffer
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), WireError> {
        self.buffer.write(self.offset, src)?;
        self.offset += src.len();
        Ok(())
    }

    /// Write one byte
    pub fn write_u8(&mut self, b: u8) -> Result<(), WireError> {
        self.write_bytes(&[b])
    }

    /// Write a single-byte boolean
    pub fn write_bool(&mut self, v: bool) -> Result<(), WireError> {
        self.write_u8(v as u8)
    }

    /// Write a packed 64-bit integer
    pub fn write_packed_i64(&mut self, n: i64) -> Result<(), WireError> {
        let mut raw = [0u8; MAX_PACKED_LEN];
        let len = varint::encode_packed(n, &mut raw);
        self.write_bytes(&raw[..len])
    }

    /// Write a packed 32-bit integer
    pub fn write_packed_i32(&mut self, n: i32) -> Result<(), WireError> {
        self.write_packed_i64(n as i64)
    }

    /// Write a packed 16-bit integer
    pub fn write_packed_i16(&mut self, n: i16) -> Result<(), WireError> {
        self.write_packed_i64(n as i64)
    }

    /// Write a big-endian IEEE-754 single
    pub fn write_f32(&mut self, v: f32) -> Result<(), WireError> {
        self.write_bytes(&v.to_bits().to_be_bytes())
    }

    /// Write a big-endian IEEE-754 double
    pub fn write_f64(&mut self, v: f64) -> Result<(), WireError> {
        self.write_bytes(&v.to_bits().to_be_bytes())
    }

    /// Write one UTF-16 code unit in its 1, 2 or 3 byte UTF-8 form
    pub fn write_char(&mut self, c: u16) -> Result<(), WireError> {
        match c {
            0..=0x7F => self.write_u8(c as u8),
            0x80..=0x7FF => self.write_bytes(&[0xC0 | (c >> 6) as u8, 0x80 | (c & 0x3F) as u8]),
            _ => self.write_bytes(&[
                0xE0 | (c >> 12) as u8,
                0x80 | ((c >> 6) & 0x3F) as u8,
                0x80 | (c & 0x3F) as u8,
            ]),
        }
    }

    /// Write a length-prefixed UTF-8 string; `None` writes length -1
    pub fn write_string(&mut self, s: Option<&str>) -> Result<(), WireError> {
        self.write_octets(s.map(str::as_bytes))
    }

    /// Write a length-prefixed octet string; `None` writes length -1
    pub fn write_octets(&mut self, src: Option<&[u8]>) -> Result<(), WireError> {
        match src {
            None => self.write_packed_i32(-1),
            Some(src) => {
                let len = i32::try_from(src.len()).map_err(|_| WireError::Overflow("length"))?;
                self.write_packed_i32(len)?;
                self.write_bytes(src)
            }
        }
    }

    /// Copy the contents of a [`ReadBuffer`]
    pub fn write_buffer(&mut self, src: &ReadBuffer) -> Result<(), WireError> {
        self.buffer.write_buffer(self.offset, src, 0, src.len())?;
        self.offset += src.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_policy() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        buf.write(0, &[1u8; 10]).unwrap();
        assert_eq!(buf.capacity(), 10 + MIN_GROWTH);

        let mut buf = ByteArrayWriteBuffer::new(4096);
        buf.write(0, &vec![0u8; 4097]).unwrap();
        assert_eq!(buf.capacity(), 8192);

        let mut buf = ByteArrayWriteBuffer::new(HUGE_CAPACITY * 2);
        buf.write(0, &vec![0u8; HUGE_CAPACITY * 2 + 1]).unwrap();
        assert_eq!(buf.capacity(), HUGE_CAPACITY * 3);
    }

    #[test]
    fn test_growth_capped_at_max() {
        let mut buf = ByteArrayWriteBuffer::with_max(0, 100);
        buf.write(0, &[7u8; 60]).unwrap();
        assert_eq!(buf.capacity(), 100);
        buf.write(60, &[7u8; 40]).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(
            buf.write(100, &[1]),
            Err(WireError::OutOfBounds {
                offset: 100,
                len: 1,
                max: 100
            })
        );
    }

    #[test]
    fn test_gap_is_zero_filled() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        buf.write(3, &[9]).unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 9]);
    }

    #[test]
    fn test_retain_and_clear() {
        let mut buf = ByteArrayWriteBuffer::new(8);
        buf.write(0, b"abcdef").unwrap();
        buf.retain(2, 3).unwrap();
        assert_eq!(buf.as_slice(), b"cde");
        assert!(buf.retain(1, 3).is_err());
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_delegating_window() {
        let mut outer = ByteArrayWriteBuffer::new(0);
        outer.write(0, b"hdr").unwrap();
        {
            let mut window = DelegatingWriteBuffer::new(&mut outer, 3, 4).unwrap();
            assert!(window.is_empty());
            window.write(0, b"body").unwrap();
            assert!(matches!(
                window.write(4, b"!"),
                Err(WireError::OutOfBounds { max: 4, .. })
            ));
            assert_eq!(window.as_slice(), b"body");
            window.retain(1, 2).unwrap();
            assert_eq!(window.as_slice(), b"od");
        }
        assert_eq!(&outer.as_slice()[..5], b"hdrod");
    }

    #[test]
    fn test_output_cursors() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        {
            let mut out = buf.output();
            out.write_packed_i32(99).unwrap();
            out.write_f32(1.5).unwrap();
            assert_eq!(out.offset(), 6);
        }
        {
            let mut patch = BufferOutput::at(&mut buf, 0).unwrap();
            patch.write_u8(0xA4).unwrap();
        }
        assert_eq!(buf.as_slice()[..2], [0xA4, 0x01]);
        assert_eq!(buf.as_slice()[2..], 1.5f32.to_be_bytes());

        let mut more = buf.output();
        assert_eq!(more.offset(), 6);
        more.write_u8(7).unwrap();
        assert_eq!(buf.as_slice()[6], 7);
    }

    #[test]
    fn test_char_forms() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        let mut out = buf.output();
        for c in [0x41u16, 0x7F, 0x80, 0x7FF, 0x800, 0xFFFF] {
            out.write_char(c).unwrap();
        }
        drop(out);
        assert_eq!(buf.len(), 1 + 1 + 2 + 2 + 3 + 3);

        let read = buf.freeze();
        let mut input = read.input();
        for c in [0x41u16, 0x7F, 0x80, 0x7FF, 0x800, 0xFFFF] {
            assert_eq!(input.read_char().unwrap(), c);
        }
    }

    #[test]
    fn test_primitive_round_trip() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        let mut out = buf.output();
        out.write_packed_i64(i64::MIN).unwrap();
        out.write_packed_i64(i64::MAX).unwrap();
        out.write_packed_i16(i16::MIN).unwrap();
        out.write_f64(f64::NAN).unwrap();
        out.write_f64(f64::NEG_INFINITY).unwrap();
        out.write_f32(f32::INFINITY).unwrap();
        out.write_string(Some("")).unwrap();
        out.write_string(None).unwrap();
        out.write_string(Some("héllo €")).unwrap();
        out.write_bool(true).unwrap();
        drop(out);

        let read = buf.freeze();
        let mut input = read.input();
        assert_eq!(input.read_packed_i64().unwrap(), i64::MIN);
        assert_eq!(input.read_packed_i64().unwrap(), i64::MAX);
        assert_eq!(input.read_packed_i16().unwrap(), i16::MIN);
        assert!(input.read_f64().unwrap().is_nan());
        assert_eq!(input.read_f64().unwrap(), f64::NEG_INFINITY);
        assert_eq!(input.read_f32().unwrap(), f32::INFINITY);
        assert_eq!(input.read_string().unwrap().as_deref(), Some(""));
        assert_eq!(input.read_string().unwrap(), None);
        assert_eq!(input.read_string().unwrap().as_deref(), Some("héllo €"));
        assert!(input.read_bool().unwrap());
        assert_eq!(input.available(), 0);
    }
}
