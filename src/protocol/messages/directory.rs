//! SMB2 QUERY_DIRECTORY and CHANGE_NOTIFY messages

use super::common::{wire_offset, FileId, SmbMessage};
use crate::error::Result;
use crate::protocol::cursor::{
    body_slice, utf16_decode, utf16_encode, variable_extent, ReadCursor, WriteBuf,
};
use crate::protocol::smb2_constants::{
    file_info_class, structure_size, NotifyFilter, QueryDirectoryFlags, Smb2Command,
    SMB2_HEADER_SIZE,
};

/// SMB2 QUERY_DIRECTORY request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2QueryDirectoryRequest {
    pub file_information_class: u8,
    pub flags: QueryDirectoryFlags,
    pub file_index: u32,
    pub file_id: FileId,
    pub pattern: String,
    pub output_buffer_length: u32,
}

impl Smb2QueryDirectoryRequest {
    pub fn new(file_id: FileId, pattern: impl Into<String>) -> Self {
        Self {
            file_information_class: file_info_class::ID_FULL_DIRECTORY,
            flags: QueryDirectoryFlags::empty(),
            file_index: 0,
            file_id,
            pattern: pattern.into(),
            output_buffer_length: 65535,
        }
    }
}

impl SmbMessage for Smb2QueryDirectoryRequest {
    const COMMAND: Smb2Command = Smb2Command::QueryDirectory;
    const STRUCTURE_SIZE: u16 = structure_size::QUERY_DIRECTORY_REQUEST;

    fn payload_size(&self) -> usize {
        self.output_buffer_length as usize
    }

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(24)?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        variable_extent(offset as u32, len as u32, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("QUERY_DIRECTORY", Self::STRUCTURE_SIZE)?;
        let file_information_class = cur.u8()?;
        let flags = QueryDirectoryFlags::from_bits_retain(cur.u8()?);
        let file_index = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        let offset = cur.u16()?;
        let len = cur.u16()?;
        let output_buffer_length = cur.u32()?;
        let pattern = utf16_decode(body_slice(body, offset as u32, len as u32, Self::fixed_len())?)?;
        Ok(Self {
            file_information_class,
            flags,
            file_index,
            file_id,
            pattern,
            output_buffer_length,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let pattern = utf16_encode(&self.pattern);
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.file_information_class);
        w.put_u8(self.flags.bits());
        w.put_u32(self.file_index);
        self.file_id.write(w);
        w.put_u16((SMB2_HEADER_SIZE + 32) as u16);
        w.put_len16("search pattern", pattern.len())?;
        w.put_u32(self.output_buffer_length);
        if pattern.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&pattern);
        }
        Ok(())
    }
}

/// Reply body shared by QUERY_DIRECTORY and CHANGE_NOTIFY: an offset/length
/// pair pointing at an entry chain.
macro_rules! output_buffer_reply {
    ($(#[$meta:meta])* $name:ident, $command:ident, $size:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Default)]
        pub struct $name {
            pub output_buffer: Vec<u8>,
        }

        impl SmbMessage for $name {
            const COMMAND: Smb2Command = Smb2Command::$command;
            const STRUCTURE_SIZE: u16 = structure_size::$size;

            fn variable_len(fixed: &[u8]) -> Result<usize> {
                let mut cur = ReadCursor::new(fixed);
                cur.seek(2)?;
                let offset = cur.u16()?;
                let len = cur.u32()?;
                variable_extent(offset as u32, len, Self::fixed_len())
            }

            fn parse(body: &[u8]) -> Result<Self> {
                let mut cur = ReadCursor::new(body);
                cur.struct_size(Self::COMMAND.name(), Self::STRUCTURE_SIZE)?;
                let offset = cur.u16()?;
                let len = cur.u32()?;
                Ok(Self {
                    output_buffer: body_slice(body, offset as u32, len, Self::fixed_len())?
                        .to_vec(),
                })
            }

            fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
                w.put_u16(Self::STRUCTURE_SIZE);
                let offset = if self.output_buffer.is_empty() {
                    0
                } else {
                    wire_offset(w) + 6
                };
                w.put_u16(offset as u16);
                w.put_u32(self.output_buffer.len() as u32);
                if self.output_buffer.is_empty() {
                    w.put_u8(0);
                } else {
                    w.put_bytes(&self.output_buffer);
                }
                Ok(())
            }
        }
    };
}

output_buffer_reply!(
    /// SMB2 QUERY_DIRECTORY reply
    Smb2QueryDirectoryResponse,
    QueryDirectory,
    QUERY_DIRECTORY_REPLY
);
output_buffer_reply!(
    /// SMB2 CHANGE_NOTIFY reply
    Smb2ChangeNotifyResponse,
    ChangeNotify,
    CHANGE_NOTIFY_REPLY
);

/// SMB2 CHANGE_NOTIFY request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2ChangeNotifyRequest {
    pub flags: u16,
    pub output_buffer_length: u32,
    pub file_id: FileId,
    pub completion_filter: NotifyFilter,
}

impl SmbMessage for Smb2ChangeNotifyRequest {
    const COMMAND: Smb2Command = Smb2Command::ChangeNotify;
    const STRUCTURE_SIZE: u16 = structure_size::CHANGE_NOTIFY_REQUEST;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("CHANGE_NOTIFY", Self::STRUCTURE_SIZE)?;
        let flags = cur.u16()?;
        let output_buffer_length = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        let completion_filter = NotifyFilter::from_bits_retain(cur.u32()?);
        Ok(Self {
            flags,
            output_buffer_length,
            file_id,
            completion_filter,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(self.flags);
        w.put_u32(self.output_buffer_length);
        self.file_id.write(w);
        w.put_u32(self.completion_filter.bits());
        w.put_u32(0);
        Ok(())
    }
}
