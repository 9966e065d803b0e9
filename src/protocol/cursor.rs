//! Bounds-checked cursors shared by every codec function
//!
//! All reads go through [`ReadCursor`], which refuses to step past the end of
//! the slice it was built on, and all offset/length pairs found inside a body
//! are validated by [`variable_extent`] and [`body_slice`]. Offsets on the
//! wire are relative to the start of the SMB2 header, body slices start right
//! after it.

use super::smb2_constants::SMB2_HEADER_SIZE;
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_ref(&self) -> &'a [u8] {
        self.buf
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::BufferTooSmall {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = LittleEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = LittleEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(Error::BufferTooSmall {
                need: pos,
                have: self.buf.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Advance to the next multiple of `align` (relative to the slice start).
    pub fn align(&mut self, align: usize) -> Result<()> {
        let pad = (align - self.pos % align) % align;
        self.skip(pad)
    }

    /// Read the StructureSize field and reject anything but `expected`.
    pub fn struct_size(&mut self, command: &'static str, expected: u16) -> Result<u16> {
        let found = self.u16()?;
        if found != expected {
            return Err(Error::StructureSize {
                command,
                expected,
                found,
            });
        }
        Ok(found)
    }
}

/// Little-endian output buffer.
#[derive(Debug, Default, Clone)]
pub struct WriteBuf {
    buf: Vec<u8>,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    /// Write a 16-bit length field, refusing lengths the field cannot hold.
    pub fn put_len16(&mut self, what: &str, len: usize) -> Result<()> {
        let v = u16::try_from(len)
            .map_err(|_| Error::InvalidParameter(format!("{what} too long: {len} bytes")))?;
        self.put_u16(v);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn put_zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Zero-pad to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let pad = (align - self.buf.len() % align) % align;
        self.put_zeros(pad);
    }

    pub fn set_u16_at(&mut self, pos: usize, v: u16) -> Result<()> {
        let slot = self
            .buf
            .get_mut(pos..pos + 2)
            .ok_or(Error::BufferTooSmall {
                need: pos + 2,
                have: 0,
            })?;
        LittleEndian::write_u16(slot, v);
        Ok(())
    }

    pub fn set_u32_at(&mut self, pos: usize, v: u32) -> Result<()> {
        let slot = self
            .buf
            .get_mut(pos..pos + 4)
            .ok_or(Error::BufferTooSmall {
                need: pos + 4,
                have: 0,
            })?;
        LittleEndian::write_u32(slot, v);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Number of body bytes following the fixed part needed to cover the
/// `offset`/`length` pair of a variable field.
///
/// `fixed_len` is the size of the fixed part actually read (StructureSize
/// with the low bit cleared). A zero length needs nothing; otherwise the
/// offset must not point into the header or the fixed part.
pub fn variable_extent(offset: u32, length: u32, fixed_len: usize) -> Result<usize> {
    if length == 0 {
        return Ok(0);
    }
    let start = SMB2_HEADER_SIZE + fixed_len;
    let offset = offset as usize;
    if offset < start {
        return Err(Error::InvalidOffset(format!(
            "offset {} points inside the fixed part (ends at {})",
            offset, start
        )));
    }
    Ok(offset - start + length as usize)
}

/// Borrow the `offset`/`length` field out of a body (fixed + variable bytes).
pub fn body_slice(body: &[u8], offset: u32, length: u32, fixed_len: usize) -> Result<&[u8]> {
    let extent = variable_extent(offset, length, fixed_len)?;
    if length == 0 {
        return Ok(&[]);
    }
    let end = fixed_len + extent;
    if end > body.len() {
        return Err(Error::InvalidOffset(format!(
            "field at {} len {} runs past the segment ({} bytes)",
            offset,
            length,
            body.len() + SMB2_HEADER_SIZE
        )));
    }
    Ok(&body[end - length as usize..end])
}

/// Encode a string as UTF-16LE without terminator.
pub fn utf16_encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decode UTF-16LE bytes, stopping at an embedded terminator.
pub fn utf16_decode(data: &[u8]) -> Result<String> {
    if data.len() % 2 != 0 {
        return Err(Error::parse("odd length UTF-16 string"));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16(&units).map_err(|e| Error::parse(format!("invalid UTF-16: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_cursor_bounds() {
        let data = [1u8, 0, 2, 0, 0, 0];
        let mut cur = ReadCursor::new(&data);
        assert_eq!(cur.u16().unwrap(), 1);
        assert_eq!(cur.u32().unwrap(), 2);
        assert!(matches!(
            cur.u8(),
            Err(Error::BufferTooSmall { need: 7, have: 6 })
        ));
        assert_eq!(cur.position(), 6);
    }

    #[test]
    fn test_struct_size_mismatch() {
        let data = [10u8, 0];
        let mut cur = ReadCursor::new(&data);
        let err = cur.struct_size("TEST", 9).unwrap_err();
        assert!(matches!(
            err,
            Error::StructureSize {
                expected: 9,
                found: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_variable_extent() {
        // fixed part of 8 bytes, data immediately after it
        assert_eq!(variable_extent(72, 10, 8).unwrap(), 10);
        // 4 bytes of padding before the data
        assert_eq!(variable_extent(76, 10, 8).unwrap(), 14);
        assert_eq!(variable_extent(0, 0, 8).unwrap(), 0);
        assert!(variable_extent(70, 10, 8).is_err());
    }

    #[test]
    fn test_body_slice_past_end() {
        let body = [0u8; 12];
        assert_eq!(body_slice(&body, 72, 4, 8).unwrap().len(), 4);
        assert!(body_slice(&body, 72, 5, 8).is_err());
        assert!(body_slice(&body, 64, 4, 8).is_err());
    }

    #[test]
    fn test_write_buf_padding_and_fixups() {
        let mut w = WriteBuf::new();
        w.put_u16(0xAABB);
        w.put_u8(1);
        w.pad_to(8);
        assert_eq!(w.len(), 8);
        w.set_u16_at(0, 0x0102).unwrap();
        assert_eq!(&w.as_slice()[..3], &[0x02, 0x01, 0x01]);
        assert!(w.set_u32_at(6, 1).is_err());
    }

    #[test]
    fn test_put_len16_limits() {
        let mut w = WriteBuf::new();
        w.put_len16("name", 0).unwrap();
        w.put_len16("name", u16::MAX as usize).unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0xff, 0xff]);
        assert!(matches!(
            w.put_len16("name", u16::MAX as usize + 1),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_variable_extent_at_u32_max() {
        let extent = variable_extent(u32::MAX, u32::MAX, 16).unwrap();
        assert_eq!(extent, (u32::MAX as usize - 80) + u32::MAX as usize);
        assert!(body_slice(&[0u8; 16], u32::MAX, 1, 16).is_err());
        assert!(body_slice(&[0u8; 16], 80, u32::MAX, 16).is_err());
    }

    #[test]
    fn test_utf16() {
        let enc = utf16_encode("a\\b");
        assert_eq!(enc, vec![b'a', 0, b'\\', 0, b'b', 0]);
        assert_eq!(utf16_decode(&enc).unwrap(), "a\\b");
        assert!(utf16_decode(&enc[..3]).is_err());
    }
}
