//! SMB2 TREE_CONNECT messages

use super::common::{wire_offset, SmbMessage};
use crate::error::Result;
use crate::protocol::cursor::{
    body_slice, utf16_decode, utf16_encode, variable_extent, ReadCursor, WriteBuf,
};
use crate::protocol::smb2_constants::{structure_size, Smb2Command};

/// SMB2 TREE_CONNECT request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2TreeConnectRequest {
    pub flags: u16,
    /// UNC path, `\\server\share`
    pub path: String,
}

impl Smb2TreeConnectRequest {
    pub fn new(server: &str, share: &str) -> Self {
        Self {
            flags: 0,
            path: format!("\\\\{}\\{}", server, share),
        }
    }

    /// Share name, the last component of the UNC path.
    pub fn share_name(&self) -> &str {
        self.path.rsplit('\\').next().unwrap_or(&self.path)
    }
}

impl SmbMessage for Smb2TreeConnectRequest {
    const COMMAND: Smb2Command = Smb2Command::TreeConnect;
    const STRUCTURE_SIZE: u16 = structure_size::TREE_CONNECT_REQUEST;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(4)?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        variable_extent(offset as u32, len as u32, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("TREE_CONNECT", Self::STRUCTURE_SIZE)?;
        let flags = cur.u16()?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        let path = utf16_decode(body_slice(body, offset as u32, len as u32, Self::fixed_len())?)?;
        Ok(Self { flags, path })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let path = utf16_encode(&self.path);
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(self.flags);
        let offset = wire_offset(w) + 4;
        w.put_u16(offset as u16);
        w.put_len16("share path", path.len())?;
        if path.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&path);
        }
        Ok(())
    }
}

/// SMB2 TREE_CONNECT reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2TreeConnectResponse {
    pub share_type: u8,
    pub share_flags: u32,
    pub capabilities: u32,
    pub maximal_access: u32,
}

impl SmbMessage for Smb2TreeConnectResponse {
    const COMMAND: Smb2Command = Smb2Command::TreeConnect;
    const STRUCTURE_SIZE: u16 = structure_size::TREE_CONNECT_REPLY;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("TREE_CONNECT", Self::STRUCTURE_SIZE)?;
        let share_type = cur.u8()?;
        cur.skip(1)?;
        Ok(Self {
            share_type,
            share_flags: cur.u32()?,
            capabilities: cur.u32()?,
            maximal_access: cur.u32()?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.share_type);
        w.put_u8(0);
        w.put_u32(self.share_flags);
        w.put_u32(self.capabilities);
        w.put_u32(self.maximal_access);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::common::decode_body;
    use crate::protocol::smb2_constants::share_type;

    #[test]
    fn test_unc_path() {
        let req = Smb2TreeConnectRequest::new("server", "IPC$");
        assert_eq!(req.path, "\\\\server\\IPC$");
        assert_eq!(req.share_name(), "IPC$");
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), 8 + req.path.len() * 2);
        let parsed: Smb2TreeConnectRequest = decode_body(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_reply() {
        let rep = Smb2TreeConnectResponse {
            share_type: share_type::PIPE,
            maximal_access: 0x001F_01FF,
            ..Default::default()
        };
        let bytes = rep.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_body::<Smb2TreeConnectResponse>(&bytes).unwrap(), rep);
    }
}
