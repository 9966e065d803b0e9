//! SMB2 IOCTL request and response messages

use super::common::{FileId, SmbMessage};
use crate::error::Result;
use crate::protocol::cursor::{body_slice, variable_extent, ReadCursor, WriteBuf};
use crate::protocol::smb2_constants::{structure_size, Smb2Command, SMB2_HEADER_SIZE};

/// SMB2 IOCTL request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2IoctlRequest {
    pub ctl_code: u32,
    pub file_id: FileId,
    pub max_input_response: u32,
    pub max_output_response: u32,
    pub flags: u32,
    pub input: Vec<u8>,
}

impl Smb2IoctlRequest {
    pub fn new(ctl_code: u32, file_id: FileId, flags: u32, input: Vec<u8>) -> Self {
        Self {
            ctl_code,
            file_id,
            max_input_response: 0,
            max_output_response: 65535,
            flags,
            input,
        }
    }
}

impl SmbMessage for Smb2IoctlRequest {
    const COMMAND: Smb2Command = Smb2Command::Ioctl;
    const STRUCTURE_SIZE: u16 = structure_size::IOCTL_REQUEST;

    fn payload_size(&self) -> usize {
        self.input.len().max(self.max_output_response as usize)
    }

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(24)?;
        let in_offset = cur.u32()?;
        let in_count = cur.u32()?;
        cur.skip(4)?;
        let out_offset = cur.u32()?;
        let out_count = cur.u32()?;
        Ok(variable_extent(in_offset, in_count, Self::fixed_len())?
            .max(variable_extent(out_offset, out_count, Self::fixed_len())?))
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("IOCTL", Self::STRUCTURE_SIZE)?;
        cur.skip(2)?;
        let ctl_code = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        let in_offset = cur.u32()?;
        let in_count = cur.u32()?;
        let max_input_response = cur.u32()?;
        cur.skip(8)?;
        let max_output_response = cur.u32()?;
        let flags = cur.u32()?;
        let input = body_slice(body, in_offset, in_count, Self::fixed_len())?.to_vec();
        Ok(Self {
            ctl_code,
            file_id,
            max_input_response,
            max_output_response,
            flags,
            input,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let in_offset = if self.input.is_empty() {
            0
        } else {
            SMB2_HEADER_SIZE + 56
        };
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(0);
        w.put_u32(self.ctl_code);
        self.file_id.write(w);
        w.put_u32(in_offset as u32);
        w.put_u32(self.input.len() as u32);
        w.put_u32(self.max_input_response);
        w.put_u32(0);
        w.put_u32(0);
        w.put_u32(self.max_output_response);
        w.put_u32(self.flags);
        w.put_u32(0);
        if self.input.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.input);
        }
        Ok(())
    }
}

/// SMB2 IOCTL reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2IoctlResponse {
    pub ctl_code: u32,
    pub file_id: FileId,
    pub flags: u32,
    pub output: Vec<u8>,
}

impl SmbMessage for Smb2IoctlResponse {
    const COMMAND: Smb2Command = Smb2Command::Ioctl;
    const STRUCTURE_SIZE: u16 = structure_size::IOCTL_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(24)?;
        let in_offset = cur.u32()?;
        let in_count = cur.u32()?;
        let out_offset = cur.u32()?;
        let out_count = cur.u32()?;
        Ok(variable_extent(in_offset, in_count, Self::fixed_len())?
            .max(variable_extent(out_offset, out_count, Self::fixed_len())?))
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("IOCTL", Self::STRUCTURE_SIZE)?;
        cur.skip(2)?;
        let ctl_code = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        cur.skip(8)?;
        let out_offset = cur.u32()?;
        let out_count = cur.u32()?;
        let flags = cur.u32()?;
        let output = body_slice(body, out_offset, out_count, Self::fixed_len())?.to_vec();
        Ok(Self {
            ctl_code,
            file_id,
            flags,
            output,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let out_offset = SMB2_HEADER_SIZE + 48;
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(0);
        w.put_u32(self.ctl_code);
        self.file_id.write(w);
        // input is never echoed back
        w.put_u32(out_offset as u32);
        w.put_u32(0);
        w.put_u32(out_offset as u32);
        w.put_u32(self.output.len() as u32);
        w.put_u32(self.flags);
        w.put_u32(0);
        if self.output.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.output);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::messages::common::decode_body;
    use crate::protocol::smb2_constants::{fsctl, IOCTL_IS_FSCTL};

    #[test]
    fn test_pipe_transceive_request() {
        let req = Smb2IoctlRequest::new(
            fsctl::PIPE_TRANSCEIVE,
            FileId::new(1, 2),
            IOCTL_IS_FSCTL,
            vec![5, 0, 0, 3],
        );
        let bytes = req.to_bytes().unwrap();
        assert_eq!(u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]), 120);
        assert_eq!(decode_body::<Smb2IoctlRequest>(&bytes).unwrap(), req);
    }

    #[test]
    fn test_reply_output_overlapping_fixed_part() {
        let rep = Smb2IoctlResponse {
            ctl_code: fsctl::PIPE_TRANSCEIVE,
            file_id: FileId::new(1, 2),
            flags: 0,
            output: vec![1, 2, 3],
        };
        let mut bytes = rep.to_bytes().unwrap();
        assert_eq!(decode_body::<Smb2IoctlResponse>(&bytes).unwrap(), rep);
        // output offset pointing into the fixed part
        bytes[32] = 100;
        assert!(matches!(
            decode_body::<Smb2IoctlResponse>(&bytes),
            Err(Error::InvalidOffset(_))
        ));
    }
}
