//! SMB2 SESSION_SETUP messages

use super::common::{wire_offset, SmbMessage};
use crate::error::Result;
use crate::protocol::cursor::{body_slice, variable_extent, ReadCursor, WriteBuf};
use crate::protocol::smb2_constants::{
    structure_size, Capabilities, SecurityMode, SessionFlags, Smb2Command,
};

/// SMB2 SESSION_SETUP request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2SessionSetupRequest {
    pub flags: u8,
    pub security_mode: SecurityMode,
    pub capabilities: Capabilities,
    pub channel: u32,
    pub previous_session_id: u64,
    pub security_buffer: Vec<u8>,
}

impl Smb2SessionSetupRequest {
    pub fn new(security_mode: SecurityMode, security_buffer: Vec<u8>) -> Self {
        Self {
            security_mode,
            security_buffer,
            ..Default::default()
        }
    }
}

impl SmbMessage for Smb2SessionSetupRequest {
    const COMMAND: Smb2Command = Smb2Command::SessionSetup;
    const STRUCTURE_SIZE: u16 = structure_size::SESSION_SETUP_REQUEST;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(12)?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        variable_extent(offset as u32, len as u32, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("SESSION_SETUP", Self::STRUCTURE_SIZE)?;
        let flags = cur.u8()?;
        let security_mode = SecurityMode::from_bits_truncate(cur.u8()? as u16);
        let capabilities = Capabilities::from_bits_truncate(cur.u32()?);
        let channel = cur.u32()?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        let previous_session_id = cur.u64()?;
        let security_buffer =
            body_slice(body, offset as u32, len as u32, Self::fixed_len())?.to_vec();
        Ok(Self {
            flags,
            security_mode,
            capabilities,
            channel,
            previous_session_id,
            security_buffer,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.flags);
        w.put_u8(self.security_mode.bits() as u8);
        w.put_u32(self.capabilities.bits());
        w.put_u32(self.channel);
        let offset = wire_offset(w) + 12;
        w.put_u16(offset as u16);
        w.put_len16("security buffer", self.security_buffer.len())?;
        w.put_u64(self.previous_session_id);
        if self.security_buffer.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.security_buffer);
        }
        Ok(())
    }
}

/// SMB2 SESSION_SETUP reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2SessionSetupResponse {
    pub session_flags: SessionFlags,
    pub security_buffer: Vec<u8>,
}

impl SmbMessage for Smb2SessionSetupResponse {
    const COMMAND: Smb2Command = Smb2Command::SessionSetup;
    const STRUCTURE_SIZE: u16 = structure_size::SESSION_SETUP_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(4)?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        variable_extent(offset as u32, len as u32, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("SESSION_SETUP", Self::STRUCTURE_SIZE)?;
        let session_flags = SessionFlags::from_bits_truncate(cur.u16()?);
        let offset = cur.u16()?;
        let len = cur.u16()?;
        let security_buffer =
            body_slice(body, offset as u32, len as u32, Self::fixed_len())?.to_vec();
        Ok(Self {
            session_flags,
            security_buffer,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(self.session_flags.bits());
        let offset = if self.security_buffer.is_empty() {
            0
        } else {
            wire_offset(w) + 4
        };
        w.put_u16(offset as u16);
        w.put_len16("security buffer", self.security_buffer.len())?;
        if self.security_buffer.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.security_buffer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::messages::common::decode_body;

    #[test]
    fn test_request_buffer_offset() {
        let req = Smb2SessionSetupRequest::new(SecurityMode::SIGNING_ENABLED, b"NTLMSSP\0".to_vec());
        let bytes = req.to_bytes().unwrap();
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), 64 + 24);
        let parsed: Smb2SessionSetupRequest = decode_body(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_response_flags_and_token() {
        let rep = Smb2SessionSetupResponse {
            session_flags: SessionFlags::ENCRYPT_DATA,
            security_buffer: vec![9; 20],
        };
        let parsed: Smb2SessionSetupResponse = decode_body(&rep.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, rep);
    }

    #[test]
    fn test_response_truncated_token() {
        let rep = Smb2SessionSetupResponse {
            session_flags: SessionFlags::empty(),
            security_buffer: vec![1; 16],
        };
        let bytes = rep.to_bytes().unwrap();
        assert!(matches!(
            decode_body::<Smb2SessionSetupResponse>(&bytes[..20]),
            Err(Error::InvalidOffset(_))
        ));
    }
}
