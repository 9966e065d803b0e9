//! Shared pieces of every command body: the codec trait, file ids, the
//! error reply and the bodies that carry nothing but a reserved field.

use crate::error::{Error, Result};
use crate::protocol::cursor::{ReadCursor, WriteBuf};
use crate::protocol::smb2_constants::{structure_size, Smb2Command, SMB2_HEADER_SIZE};

/// Codec for one command body (request or reply).
///
/// Decoding is two-phase: the engine first reads `fixed_len()` bytes and asks
/// [`SmbMessage::variable_len`] how many more bytes the offsets inside the
/// fixed part reference, then hands the whole body to [`SmbMessage::parse`].
pub trait SmbMessage: Sized {
    const COMMAND: Smb2Command;
    const STRUCTURE_SIZE: u16;

    /// Bytes of the fixed part actually present on the wire.
    fn fixed_len() -> usize {
        (Self::STRUCTURE_SIZE & 0xfffe) as usize
    }

    /// Variable bytes that must follow the fixed part.
    fn variable_len(_fixed: &[u8]) -> Result<usize> {
        Ok(0)
    }

    fn parse(body: &[u8]) -> Result<Self>;

    /// Bytes moved by this request, used to size its credit charge.
    fn payload_size(&self) -> usize {
        0
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = WriteBuf::with_capacity(Self::fixed_len() + 8);
        self.serialize(&mut w)?;
        Ok(w.into_inner())
    }
}

/// Run both decode phases over a complete body.
pub fn decode_body<T: SmbMessage>(body: &[u8]) -> Result<T> {
    let fixed = T::fixed_len();
    if body.len() < fixed {
        return Err(Error::BufferTooSmall {
            need: fixed,
            have: body.len(),
        });
    }
    let variable = T::variable_len(&body[..fixed])?;
    if fixed + variable > body.len() {
        return Err(Error::InvalidOffset(format!(
            "{} variable part of {} bytes exceeds the {} byte body",
            T::COMMAND.name(),
            variable,
            body.len()
        )));
    }
    T::parse(body)
}

/// Offset, relative to the header start, of the next byte written to `w`.
pub(crate) fn wire_offset(w: &WriteBuf) -> usize {
    SMB2_HEADER_SIZE + w.len()
}

/// 16 byte handle of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileId {
    pub persistent: u64,
    pub volatile: u64,
}

impl FileId {
    pub const SIZE: usize = 16;

    /// Placeholder for "the file opened earlier in this compound chain".
    pub const COMPOUND: FileId = FileId {
        persistent: u64::MAX,
        volatile: u64::MAX,
    };

    pub fn new(persistent: u64, volatile: u64) -> Self {
        Self {
            persistent,
            volatile,
        }
    }

    pub fn is_compound(&self) -> bool {
        *self == Self::COMPOUND
    }

    pub fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        Ok(Self {
            persistent: cur.u64()?,
            volatile: cur.u64()?,
        })
    }

    pub fn write(&self, w: &mut WriteBuf) {
        w.put_u64(self.persistent);
        w.put_u64(self.volatile);
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.persistent.to_le_bytes());
        out[8..].copy_from_slice(&self.volatile.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; 16]) -> Self {
        let mut cur = ReadCursor::new(b);
        Self {
            persistent: cur.u64().unwrap_or(0),
            volatile: cur.u64().unwrap_or(0),
        }
    }
}

/// Error reply body, valid for any command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2ErrorResponse {
    pub error_context_count: u8,
    pub error_data: Vec<u8>,
}

impl Smb2ErrorResponse {
    /// Whether a body with this StructureSize is an error reply.
    pub fn matches(body: &[u8]) -> bool {
        body.len() >= 2 && u16::from_le_bytes([body[0], body[1]]) == structure_size::ERROR_REPLY
    }
}

impl SmbMessage for Smb2ErrorResponse {
    // The command is whatever the header says; NEGOTIATE is only a label here.
    const COMMAND: Smb2Command = Smb2Command::Negotiate;
    const STRUCTURE_SIZE: u16 = structure_size::ERROR_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.skip(4)?;
        Ok(cur.u32()? as usize)
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("ERROR", Self::STRUCTURE_SIZE)?;
        let error_context_count = cur.u8()?;
        cur.skip(1)?;
        let byte_count = cur.u32()? as usize;
        let error_data = cur.bytes(byte_count)?.to_vec();
        Ok(Self {
            error_context_count,
            error_data,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.error_context_count);
        w.put_u8(0);
        w.put_u32(self.error_data.len() as u32);
        if self.error_data.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.error_data);
        }
        Ok(())
    }
}

/// Bodies made of StructureSize plus a reserved u16.
macro_rules! reserved_only_body {
    ($(#[$meta:meta])* $name:ident, $command:ident, $size:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name;

        impl SmbMessage for $name {
            const COMMAND: Smb2Command = Smb2Command::$command;
            const STRUCTURE_SIZE: u16 = structure_size::$size;

            fn parse(body: &[u8]) -> Result<Self> {
                let mut cur = ReadCursor::new(body);
                cur.struct_size(Self::COMMAND.name(), Self::STRUCTURE_SIZE)?;
                cur.skip(2)?;
                Ok($name)
            }

            fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
                w.put_u16(Self::STRUCTURE_SIZE);
                w.put_u16(0);
                Ok(())
            }
        }
    };
}

reserved_only_body!(
    /// ECHO request and reply
    Smb2Echo,
    Echo,
    ECHO
);
reserved_only_body!(
    /// LOGOFF request and reply
    Smb2Logoff,
    Logoff,
    LOGOFF
);
reserved_only_body!(
    /// TREE_DISCONNECT request and reply
    Smb2TreeDisconnect,
    TreeDisconnect,
    TREE_DISCONNECT
);
reserved_only_body!(Smb2Cancel, Cancel, CANCEL);
reserved_only_body!(Smb2FlushResponse, Flush, FLUSH_REPLY);
reserved_only_body!(Smb2LockResponse, Lock, LOCK_REPLY);
