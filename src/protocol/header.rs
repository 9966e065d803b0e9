//! SMB2 header and SMB3 transform header

use super::cursor::{ReadCursor, WriteBuf};
use super::smb2_constants::*;
use crate::error::{Error, NtStatus, Result};

/// Process/tree ids of a synchronous header, or the async id that replaces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderIds {
    Sync { process_id: u32, tree_id: u32 },
    Async { async_id: u64 },
}

/// SMB2 packet header (64 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub status: NtStatus,
    pub command: Smb2Command,
    /// CreditRequest in requests, CreditResponse in replies
    pub credits: u16,
    pub flags: Smb2HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    pub ids: HeaderIds,
    pub session_id: u64,
    pub signature: [u8; SMB2_SIGNATURE_SIZE],
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            credit_charge: 0,
            status: NtStatus::SUCCESS,
            command,
            credits: 0,
            flags: Smb2HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            ids: HeaderIds::Sync {
                process_id: SMB2_PROCESS_ID,
                tree_id: 0,
            },
            session_id: 0,
            signature: [0; SMB2_SIGNATURE_SIZE],
        }
    }

    pub fn tree_id(&self) -> u32 {
        match self.ids {
            HeaderIds::Sync { tree_id, .. } => tree_id,
            HeaderIds::Async { .. } => 0,
        }
    }

    pub fn set_tree_id(&mut self, tree_id: u32) {
        if let HeaderIds::Sync { process_id, .. } = self.ids {
            self.ids = HeaderIds::Sync {
                process_id,
                tree_id,
            };
        }
    }

    pub fn async_id(&self) -> Option<u64> {
        match self.ids {
            HeaderIds::Async { async_id } => Some(async_id),
            HeaderIds::Sync { .. } => None,
        }
    }

    pub fn set_async_id(&mut self, async_id: u64) {
        self.flags |= Smb2HeaderFlags::ASYNC_COMMAND;
        self.ids = HeaderIds::Async { async_id };
    }

    pub fn is_reply(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SERVER_TO_REDIR)
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::ASYNC_COMMAND)
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        if buf[..4] == SMB1_MAGIC {
            return Err(Error::InvalidHeader("SMB1 message".into()));
        }
        if buf[..4] != SMB2_MAGIC {
            return Err(Error::InvalidHeader("bad SMB2 protocol id".into()));
        }

        let mut cur = ReadCursor::new(&buf[4..Self::SIZE]);
        let structure_size = cur.u16()?;
        if structure_size != structure_size::HEADER {
            return Err(Error::InvalidHeader(format!(
                "header structure size {}",
                structure_size
            )));
        }
        let credit_charge = cur.u16()?;
        let status = NtStatus(cur.u32()?);
        let command = Smb2Command::try_from(cur.u16()?)?;
        let credits = cur.u16()?;
        let flags = Smb2HeaderFlags::from_bits_retain(cur.u32()?);
        let next_command = cur.u32()?;
        let message_id = cur.u64()?;
        let ids = if flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
            HeaderIds::Async {
                async_id: cur.u64()?,
            }
        } else {
            HeaderIds::Sync {
                process_id: cur.u32()?,
                tree_id: cur.u32()?,
            }
        };
        let session_id = cur.u64()?;
        let signature = cur.array::<SMB2_SIGNATURE_SIZE>()?;

        Ok(Self {
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            ids,
            session_id,
            signature,
        })
    }

    pub fn encode(&self, w: &mut WriteBuf) {
        w.put_bytes(&SMB2_MAGIC);
        w.put_u16(structure_size::HEADER);
        w.put_u16(self.credit_charge);
        w.put_u32(self.status.0);
        w.put_u16(self.command as u16);
        w.put_u16(self.credits);
        w.put_u32(self.flags.bits());
        w.put_u32(self.next_command);
        w.put_u64(self.message_id);
        match self.ids {
            HeaderIds::Sync {
                process_id,
                tree_id,
            } => {
                w.put_u32(process_id);
                w.put_u32(tree_id);
            }
            HeaderIds::Async { async_id } => w.put_u64(async_id),
        }
        w.put_u64(self.session_id);
        w.put_bytes(&self.signature);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WriteBuf::with_capacity(Self::SIZE);
        self.encode(&mut w);
        w.into_inner()
    }
}

/// SMB3 transform header preceding an encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformHeader {
    pub signature: [u8; 16],
    pub nonce: [u8; 16],
    pub original_message_size: u32,
    pub flags: u16,
    pub session_id: u64,
}

impl TransformHeader {
    pub const SIZE: usize = SMB2_TRANSFORM_HEADER_SIZE;
    /// Flags value meaning "encrypted"
    pub const ENCRYPTED: u16 = 0x0001;

    pub fn new(session_id: u64, original_message_size: u32) -> Self {
        Self {
            signature: [0; 16],
            nonce: [0; 16],
            original_message_size,
            flags: Self::ENCRYPTED,
            session_id,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        if buf[..4] != SMB2_TRANSFORM_MAGIC {
            return Err(Error::InvalidHeader("bad transform protocol id".into()));
        }
        let mut cur = ReadCursor::new(&buf[4..Self::SIZE]);
        let signature = cur.array::<16>()?;
        let nonce = cur.array::<16>()?;
        let original_message_size = cur.u32()?;
        cur.skip(2)?;
        let flags = cur.u16()?;
        let session_id = cur.u64()?;
        Ok(Self {
            signature,
            nonce,
            original_message_size,
            flags,
            session_id,
        })
    }

    pub fn encode(&self, w: &mut WriteBuf) {
        w.put_bytes(&SMB2_TRANSFORM_MAGIC);
        w.put_bytes(&self.signature);
        w.put_bytes(&self.nonce);
        w.put_u32(self.original_message_size);
        w.put_u16(0);
        w.put_u16(self.flags);
        w.put_u64(self.session_id);
    }
}
