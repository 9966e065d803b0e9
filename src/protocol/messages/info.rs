//! SMB2 QUERY_INFO and SET_INFO messages

use super::common::{wire_offset, FileId, SmbMessage};
use crate::error::Result;
use crate::protocol::cursor::{body_slice, variable_extent, ReadCursor, WriteBuf};
use crate::protocol::smb2_constants::{structure_size, Smb2Command, SMB2_HEADER_SIZE};

/// SMB2 QUERY_INFO request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2QueryInfoRequest {
    pub info_type: u8,
    pub file_info_class: u8,
    pub output_buffer_length: u32,
    pub additional_information: u32,
    pub flags: u32,
    pub file_id: FileId,
    pub input_buffer: Vec<u8>,
}

impl Smb2QueryInfoRequest {
    pub fn new(info_type: u8, file_info_class: u8, file_id: FileId) -> Self {
        Self {
            info_type,
            file_info_class,
            output_buffer_length: 65535,
            file_id,
            ..Default::default()
        }
    }
}

impl SmbMessage for Smb2QueryInfoRequest {
    const COMMAND: Smb2Command = Smb2Command::QueryInfo;
    const STRUCTURE_SIZE: u16 = structure_size::QUERY_INFO_REQUEST;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(8)?;
        let offset = cur.u16()?;
        cur.skip(2)?;
        let len = cur.u32()?;
        variable_extent(offset as u32, len, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("QUERY_INFO", Self::STRUCTURE_SIZE)?;
        let info_type = cur.u8()?;
        let file_info_class = cur.u8()?;
        let output_buffer_length = cur.u32()?;
        let input_offset = cur.u16()?;
        cur.skip(2)?;
        let input_len = cur.u32()?;
        let additional_information = cur.u32()?;
        let flags = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        let input_buffer =
            body_slice(body, input_offset as u32, input_len, Self::fixed_len())?.to_vec();
        Ok(Self {
            info_type,
            file_info_class,
            output_buffer_length,
            additional_information,
            flags,
            file_id,
            input_buffer,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.info_type);
        w.put_u8(self.file_info_class);
        w.put_u32(self.output_buffer_length);
        let offset = if self.input_buffer.is_empty() {
            0
        } else {
            SMB2_HEADER_SIZE + 40
        };
        w.put_u16(offset as u16);
        w.put_u16(0);
        w.put_u32(self.input_buffer.len() as u32);
        w.put_u32(self.additional_information);
        w.put_u32(self.flags);
        self.file_id.write(w);
        if self.input_buffer.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.input_buffer);
        }
        Ok(())
    }
}

/// SMB2 QUERY_INFO reply; the payload is decoded by the caller per class
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2QueryInfoResponse {
    pub output_buffer: Vec<u8>,
}

impl SmbMessage for Smb2QueryInfoResponse {
    const COMMAND: Smb2Command = Smb2Command::QueryInfo;
    const STRUCTURE_SIZE: u16 = structure_size::QUERY_INFO_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(2)?;
        let offset = cur.u16()?;
        let len = cur.u32()?;
        variable_extent(offset as u32, len, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("QUERY_INFO", Self::STRUCTURE_SIZE)?;
        let offset = cur.u16()?;
        let len = cur.u32()?;
        Ok(Self {
            output_buffer: body_slice(body, offset as u32, len, Self::fixed_len())?.to_vec(),
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16((wire_offset(w) + 6) as u16);
        w.put_u32(self.output_buffer.len() as u32);
        if self.output_buffer.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.output_buffer);
        }
        Ok(())
    }
}

/// SMB2 SET_INFO request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2SetInfoRequest {
    pub info_type: u8,
    pub file_info_class: u8,
    pub additional_information: u32,
    pub file_id: FileId,
    pub buffer: Vec<u8>,
}

impl Smb2SetInfoRequest {
    pub fn new(info_type: u8, file_info_class: u8, file_id: FileId, buffer: Vec<u8>) -> Self {
        Self {
            info_type,
            file_info_class,
            additional_information: 0,
            file_id,
            buffer,
        }
    }
}

impl SmbMessage for Smb2SetInfoRequest {
    const COMMAND: Smb2Command = Smb2Command::SetInfo;
    const STRUCTURE_SIZE: u16 = structure_size::SET_INFO_REQUEST;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(4)?;
        let len = cur.u32()?;
        let offset = cur.u16()?;
        variable_extent(offset as u32, len, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("SET_INFO", Self::STRUCTURE_SIZE)?;
        let info_type = cur.u8()?;
        let file_info_class = cur.u8()?;
        let len = cur.u32()?;
        let offset = cur.u16()?;
        cur.skip(2)?;
        let additional_information = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        let buffer = body_slice(body, offset as u32, len, Self::fixed_len())?.to_vec();
        Ok(Self {
            info_type,
            file_info_class,
            additional_information,
            file_id,
            buffer,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.info_type);
        w.put_u8(self.file_info_class);
        w.put_u32(self.buffer.len() as u32);
        w.put_u16((SMB2_HEADER_SIZE + 32) as u16);
        w.put_u16(0);
        w.put_u32(self.additional_information);
        self.file_id.write(w);
        if self.buffer.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.buffer);
        }
        Ok(())
    }
}

/// SMB2 SET_INFO reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2SetInfoResponse;

impl SmbMessage for Smb2SetInfoResponse {
    const COMMAND: Smb2Command = Smb2Command::SetInfo;
    const STRUCTURE_SIZE: u16 = structure_size::SET_INFO_REPLY;

    fn parse(body: &[u8]) -> Result<Self> {
        ReadCursor::new(body).struct_size("SET_INFO", Self::STRUCTURE_SIZE)?;
        Ok(Smb2SetInfoResponse)
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::common::decode_body;
    use crate::protocol::messages::file_info::{FileEndOfFileInformation, InfoClass};
    use crate::protocol::smb2_constants::{file_info_class, info_type};

    #[test]
    fn test_query_info_request() {
        let req = Smb2QueryInfoRequest::new(info_type::FILE, file_info_class::ALL, FileId::COMPOUND);
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), 41);
        assert_eq!(decode_body::<Smb2QueryInfoRequest>(&bytes).unwrap(), req);
    }

    #[test]
    fn test_query_info_reply_overrun() {
        let rep = Smb2QueryInfoResponse {
            output_buffer: vec![1; 24],
        };
        let bytes = rep.to_bytes().unwrap();
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 72);
        assert_eq!(decode_body::<Smb2QueryInfoResponse>(&bytes).unwrap(), rep);
        assert!(decode_body::<Smb2QueryInfoResponse>(&bytes[..20]).is_err());
    }

    #[test]
    fn test_set_info_end_of_file() {
        let eof = FileEndOfFileInformation { end_of_file: 100 };
        let req = Smb2SetInfoRequest::new(
            info_type::FILE,
            FileEndOfFileInformation::CLASS,
            FileId::new(1, 2),
            eof.to_bytes(),
        );
        let parsed: Smb2SetInfoRequest = decode_body(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(FileEndOfFileInformation::parse(&parsed.buffer).unwrap(), eof);
        assert_eq!(Smb2SetInfoResponse.to_bytes().unwrap(), vec![2, 0]);
    }
}
