//! NDR coders for the NDR32 and NDR64 transfer syntaxes
//!
//! The two syntaxes differ in the width of conformance counts, pointer
//! referents and enums, and in pointer alignment; everything else is
//! little-endian with natural alignment relative to the stub start.
//! Embedded pointees are deferred: a structure writes its referent tags
//! inline and the coder writes the pointed-to data once the enclosing
//! structure (or array of structures) is complete.

use crate::error::{Error, Result};
use crate::protocol::cursor::{ReadCursor, WriteBuf};
use byteorder::{ByteOrder, LittleEndian};

/// A type that knows its own NDR representation.
pub trait NdrCoder: Sized {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()>;
    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self>;
}

/// Pointer attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrKind {
    /// Never null, no tag on the wire
    Ref,
    /// Tagged, may be null
    Unique,
    /// Tagged, may alias; aliasing is not tracked and every non-null
    /// referent is coded as a fresh object
    Full,
}

const REFERENT_BASE: u32 = 0x0002_0000;

pub struct NdrEncoder {
    w: WriteBuf,
    ndr64: bool,
    next_referent: u32,
}

impl NdrEncoder {
    pub fn new(ndr64: bool) -> Self {
        Self {
            w: WriteBuf::new(),
            ndr64,
            next_referent: REFERENT_BASE,
        }
    }

    pub fn is_ndr64(&self) -> bool {
        self.ndr64
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    pub fn align(&mut self, n: usize) {
        self.w.pad_to(n);
    }

    /// Alignment of a pointer or conformance count
    pub fn align_ptr(&mut self) {
        self.align(if self.ndr64 { 8 } else { 4 });
    }

    pub fn u8(&mut self, v: u8) {
        self.w.put_u8(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.align(2);
        self.w.put_u16(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.align(4);
        self.w.put_u32(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.align(8);
        self.w.put_u64(v);
    }

    /// Enums travel as 16 bits in NDR32 and 32 bits in NDR64.
    pub fn enum16(&mut self, v: u16) {
        if self.ndr64 {
            self.u32(v as u32);
        } else {
            self.u16(v);
        }
    }

    pub fn uint3264(&mut self, v: u64) -> Result<()> {
        if self.ndr64 {
            self.u64(v);
        } else {
            let v = u32::try_from(v)
                .map_err(|_| Error::InvalidParameter(format!("{} does not fit NDR32", v)))?;
            self.u32(v);
        }
        Ok(())
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.w.put_bytes(data);
    }

    /// Write the tag of a pointer. Returns whether a pointee must follow.
    pub fn pointer(&mut self, kind: PtrKind, present: bool) -> Result<bool> {
        if kind == PtrKind::Ref {
            if !present {
                return Err(Error::InvalidParameter("null ref pointer".into()));
            }
            return Ok(true);
        }
        let tag = if present {
            let id = self.next_referent;
            self.next_referent += 4;
            id
        } else {
            0
        };
        self.uint3264(tag as u64)?;
        Ok(present)
    }

    /// Conformance count of a conformant array or structure.
    pub fn conformance(&mut self, count: usize) -> Result<()> {
        self.uint3264(count as u64)
    }

    pub fn conformant_array<T>(
        &mut self,
        items: &[T],
        mut f: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        self.conformance(items.len())?;
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    /// `[string] wchar_t*` pointee: conformant varying, NUL terminated.
    pub fn string(&mut self, s: &str) -> Result<()> {
        let units: Vec<u16> = s.encode_utf16().chain(std::iter::once(0)).collect();
        self.varying_units(units.len(), &units)
    }

    /// Unique `[string] wchar_t*` with its pointee inline.
    pub fn unique_string(&mut self, s: Option<&str>) -> Result<()> {
        if self.pointer(PtrKind::Unique, s.is_some())? {
            if let Some(s) = s {
                self.string(s)?;
            }
        }
        Ok(())
    }

    /// Fixed part of an RPC_UNICODE_STRING: byte length, maximum byte
    /// length and the buffer pointer. The buffer goes through
    /// [`NdrEncoder::unicode_string_buffer`] once deferred data is due.
    pub fn unicode_string_header(&mut self, s: &str) -> Result<()> {
        self.align_ptr();
        let bytes = s.encode_utf16().count() * 2;
        let bytes = u16::try_from(bytes)
            .map_err(|_| Error::InvalidParameter("string longer than 32K".into()))?;
        self.u16(bytes);
        self.u16(bytes);
        self.pointer(PtrKind::Unique, true)?;
        Ok(())
    }

    pub fn unicode_string_buffer(&mut self, s: &str) -> Result<()> {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.varying_units(units.len(), &units)
    }

    fn varying_units(&mut self, max: usize, units: &[u16]) -> Result<()> {
        self.conformance(max)?;
        self.uint3264(0)?;
        self.uint3264(units.len() as u64)?;
        for &u in units {
            self.u16(u);
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.w.into_inner()
    }
}

pub struct NdrDecoder<'a> {
    cur: ReadCursor<'a>,
    ndr64: bool,
}

impl<'a> NdrDecoder<'a> {
    pub fn new(data: &'a [u8], ndr64: bool) -> Self {
        Self {
            cur: ReadCursor::new(data),
            ndr64,
        }
    }

    pub fn is_ndr64(&self) -> bool {
        self.ndr64
    }

    pub fn position(&self) -> usize {
        self.cur.position()
    }

    pub fn remaining(&self) -> usize {
        self.cur.remaining()
    }

    pub fn align(&mut self, n: usize) -> Result<()> {
        self.cur.align(n)
    }

    pub fn align_ptr(&mut self) -> Result<()> {
        self.align(if self.ndr64 { 8 } else { 4 })
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.cur.u8()
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.align(2)?;
        self.cur.u16()
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.align(4)?;
        self.cur.u32()
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.align(8)?;
        self.cur.u64()
    }

    pub fn enum16(&mut self) -> Result<u16> {
        if self.ndr64 {
            let v = self.u32()?;
            u16::try_from(v).map_err(|_| Error::Rpc(format!("enum value {} out of range", v)))
        } else {
            self.u16()
        }
    }

    pub fn uint3264(&mut self) -> Result<u64> {
        if self.ndr64 {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.cur.bytes(n)
    }

    /// Read a pointer tag. Returns whether a pointee follows.
    pub fn pointer(&mut self, kind: PtrKind) -> Result<bool> {
        if kind == PtrKind::Ref {
            return Ok(true);
        }
        Ok(self.uint3264()? != 0)
    }

    /// Read a conformance count, refusing counts the remaining data cannot
    /// hold at `min_element` bytes per element.
    pub fn conformance(&mut self, min_element: usize) -> Result<usize> {
        let count = self.uint3264()?;
        let count = usize::try_from(count).map_err(|_| Error::OutOfMemory)?;
        if count.saturating_mul(min_element.max(1)) > self.remaining() {
            return Err(Error::BufferTooSmall {
                need: count.saturating_mul(min_element.max(1)),
                have: self.remaining(),
            });
        }
        Ok(count)
    }

    pub fn conformant_array<T>(
        &mut self,
        min_element: usize,
        mut f: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let count = self.conformance(min_element)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    pub fn string(&mut self) -> Result<String> {
        let units = self.varying_units()?;
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        String::from_utf16(&units[..end])
            .map_err(|e| Error::parse(format!("invalid UTF-16 in NDR string: {}", e)))
    }

    pub fn unique_string(&mut self) -> Result<Option<String>> {
        if self.pointer(PtrKind::Unique)? {
            self.string().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fixed part of an RPC_UNICODE_STRING; returns whether a buffer is
    /// deferred.
    pub fn unicode_string_header(&mut self) -> Result<bool> {
        self.align_ptr()?;
        let length = self.u16()?;
        let max = self.u16()?;
        if length > max || length % 2 != 0 {
            return Err(Error::Rpc(format!(
                "bad unicode string lengths {}/{}",
                length, max
            )));
        }
        self.pointer(PtrKind::Unique)
    }

    pub fn unicode_string_buffer(&mut self) -> Result<String> {
        let units = self.varying_units()?;
        String::from_utf16(&units)
            .map_err(|e| Error::parse(format!("invalid UTF-16 in NDR string: {}", e)))
    }

    fn varying_units(&mut self) -> Result<Vec<u16>> {
        let max = self.uint3264()?;
        let offset = self.uint3264()?;
        let actual = self.uint3264()?;
        if offset != 0 || actual > max {
            return Err(Error::Rpc(format!(
                "bad varying array bounds: max {} offset {} actual {}",
                max, offset, actual
            )));
        }
        let actual = usize::try_from(actual).map_err(|_| Error::OutOfMemory)?;
        self.align(2)?;
        let raw = self.cur.bytes(actual.saturating_mul(2))?;
        Ok(raw.chunks_exact(2).map(LittleEndian::read_u16).collect())
    }
}
