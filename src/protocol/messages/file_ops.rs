//! SMB2 file operation messages: CREATE, CLOSE, FLUSH, READ, WRITE, LOCK
//! and OPLOCK_BREAK

use super::common::{wire_offset, FileId, SmbMessage};
use super::file_info::FileTimes;
use crate::error::{Error, Result};
use crate::protocol::cursor::{
    body_slice, utf16_decode, utf16_encode, variable_extent, ReadCursor, WriteBuf,
};
use crate::protocol::smb2_constants::{
    create_action, impersonation_level, oplock_level, structure_size, CloseFlags,
    CreateDisposition, CreateOptions, DesiredAccess, FileAttributes, LockFlags, ShareAccess,
    Smb2Command, SMB2_HEADER_SIZE,
};

/// SMB2 CREATE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2CreateRequest {
    pub security_flags: u8,
    pub requested_oplock_level: u8,
    pub impersonation_level: u32,
    pub smb_create_flags: u64,
    pub desired_access: DesiredAccess,
    pub file_attributes: FileAttributes,
    pub share_access: ShareAccess,
    pub create_disposition: CreateDisposition,
    pub create_options: CreateOptions,
    /// Path relative to the share root, backslash separated
    pub name: String,
    /// Create contexts, passed through undecoded
    pub create_contexts: Vec<u8>,
}

impl Smb2CreateRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            security_flags: 0,
            requested_oplock_level: oplock_level::NONE,
            impersonation_level: impersonation_level::IMPERSONATION,
            smb_create_flags: 0,
            desired_access: DesiredAccess::FILE_READ_DATA | DesiredAccess::FILE_READ_ATTRIBUTES,
            file_attributes: FileAttributes::empty(),
            share_access: ShareAccess::READ | ShareAccess::WRITE,
            create_disposition: CreateDisposition::Open,
            create_options: CreateOptions::empty(),
            name: name.into(),
            create_contexts: Vec::new(),
        }
    }
}

impl SmbMessage for Smb2CreateRequest {
    const COMMAND: Smb2Command = Smb2Command::Create;
    const STRUCTURE_SIZE: u16 = structure_size::CREATE_REQUEST;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(44)?;
        let name_offset = cur.u16()?;
        let name_len = cur.u16()?;
        let ctx_offset = cur.u32()?;
        let ctx_len = cur.u32()?;
        Ok(variable_extent(name_offset as u32, name_len as u32, Self::fixed_len())?
            .max(variable_extent(ctx_offset, ctx_len, Self::fixed_len())?))
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("CREATE", Self::STRUCTURE_SIZE)?;
        let security_flags = cur.u8()?;
        let requested_oplock_level = cur.u8()?;
        let impersonation_level = cur.u32()?;
        let smb_create_flags = cur.u64()?;
        cur.skip(8)?;
        let desired_access = DesiredAccess::from_bits_retain(cur.u32()?);
        let file_attributes = FileAttributes::from_bits_retain(cur.u32()?);
        let share_access = ShareAccess::from_bits_retain(cur.u32()?);
        let create_disposition = CreateDisposition::try_from(cur.u32()?)?;
        let create_options = CreateOptions::from_bits_retain(cur.u32()?);
        let name_offset = cur.u16()?;
        let name_len = cur.u16()?;
        let ctx_offset = cur.u32()?;
        let ctx_len = cur.u32()?;

        let name = utf16_decode(body_slice(
            body,
            name_offset as u32,
            name_len as u32,
            Self::fixed_len(),
        )?)?;
        let create_contexts = body_slice(body, ctx_offset, ctx_len, Self::fixed_len())?.to_vec();

        Ok(Self {
            security_flags,
            requested_oplock_level,
            impersonation_level,
            smb_create_flags,
            desired_access,
            file_attributes,
            share_access,
            create_disposition,
            create_options,
            name,
            create_contexts,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let start = w.len();
        let name = utf16_encode(&self.name);
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.security_flags);
        w.put_u8(self.requested_oplock_level);
        w.put_u32(self.impersonation_level);
        w.put_u64(self.smb_create_flags);
        w.put_u64(0);
        w.put_u32(self.desired_access.bits());
        w.put_u32(self.file_attributes.bits());
        w.put_u32(self.share_access.bits());
        w.put_u32(self.create_disposition as u32);
        w.put_u32(self.create_options.bits());
        // name offset is always set, even for the share root
        w.put_u16((SMB2_HEADER_SIZE + 56) as u16);
        w.put_len16("file name", name.len())?;
        w.put_u32(0);
        w.put_u32(0);
        if name.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&name);
        }
        if !self.create_contexts.is_empty() {
            w.pad_to(8);
            let offset = wire_offset(w) as u32;
            w.put_bytes(&self.create_contexts);
            w.set_u32_at(start + 48, offset)?;
            w.set_u32_at(start + 52, self.create_contexts.len() as u32)?;
        }
        Ok(())
    }
}

/// SMB2 CREATE reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2CreateResponse {
    pub oplock_level: u8,
    pub flags: u8,
    pub create_action: u32,
    pub times: FileTimes,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: FileAttributes,
    pub file_id: FileId,
    pub create_contexts: Vec<u8>,
}

impl Smb2CreateResponse {
    pub fn new(file_id: FileId) -> Self {
        Self {
            create_action: create_action::OPENED,
            file_id,
            ..Default::default()
        }
    }
}

impl SmbMessage for Smb2CreateResponse {
    const COMMAND: Smb2Command = Smb2Command::Create;
    const STRUCTURE_SIZE: u16 = structure_size::CREATE_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(80)?;
        let offset = cur.u32()?;
        let len = cur.u32()?;
        variable_extent(offset, len, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("CREATE", Self::STRUCTURE_SIZE)?;
        let oplock_level = cur.u8()?;
        let flags = cur.u8()?;
        let create_action = cur.u32()?;
        let times = FileTimes::read(&mut cur)?;
        let allocation_size = cur.u64()?;
        let end_of_file = cur.u64()?;
        let file_attributes = FileAttributes::from_bits_retain(cur.u32()?);
        cur.skip(4)?;
        let file_id = FileId::read(&mut cur)?;
        let offset = cur.u32()?;
        let len = cur.u32()?;
        let create_contexts = body_slice(body, offset, len, Self::fixed_len())?.to_vec();
        Ok(Self {
            oplock_level,
            flags,
            create_action,
            times,
            allocation_size,
            end_of_file,
            file_attributes,
            file_id,
            create_contexts,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let start = w.len();
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.oplock_level);
        w.put_u8(self.flags);
        w.put_u32(self.create_action);
        self.times.write(w);
        w.put_u64(self.allocation_size);
        w.put_u64(self.end_of_file);
        w.put_u32(self.file_attributes.bits());
        w.put_u32(0);
        self.file_id.write(w);
        w.put_u32(0);
        w.put_u32(0);
        if self.create_contexts.is_empty() {
            w.put_u8(0);
        } else {
            let offset = wire_offset(w) as u32;
            w.put_bytes(&self.create_contexts);
            w.set_u32_at(start + 80, offset)?;
            w.set_u32_at(start + 84, self.create_contexts.len() as u32)?;
        }
        Ok(())
    }
}

/// SMB2 CLOSE request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2CloseRequest {
    pub flags: CloseFlags,
    pub file_id: FileId,
}

impl Smb2CloseRequest {
    pub fn new(file_id: FileId) -> Self {
        Self {
            flags: CloseFlags::empty(),
            file_id,
        }
    }
}

impl SmbMessage for Smb2CloseRequest {
    const COMMAND: Smb2Command = Smb2Command::Close;
    const STRUCTURE_SIZE: u16 = structure_size::CLOSE_REQUEST;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("CLOSE", Self::STRUCTURE_SIZE)?;
        let flags = CloseFlags::from_bits_retain(cur.u16()?);
        cur.skip(4)?;
        Ok(Self {
            flags,
            file_id: FileId::read(&mut cur)?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(self.flags.bits());
        w.put_u32(0);
        self.file_id.write(w);
        Ok(())
    }
}

/// SMB2 CLOSE reply; attributes are only filled with POSTQUERY_ATTRIB
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2CloseResponse {
    pub flags: CloseFlags,
    pub times: FileTimes,
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub file_attributes: FileAttributes,
}

impl SmbMessage for Smb2CloseResponse {
    const COMMAND: Smb2Command = Smb2Command::Close;
    const STRUCTURE_SIZE: u16 = structure_size::CLOSE_REPLY;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("CLOSE", Self::STRUCTURE_SIZE)?;
        let flags = CloseFlags::from_bits_retain(cur.u16()?);
        cur.skip(4)?;
        Ok(Self {
            flags,
            times: FileTimes::read(&mut cur)?,
            allocation_size: cur.u64()?,
            end_of_file: cur.u64()?,
            file_attributes: FileAttributes::from_bits_retain(cur.u32()?),
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(self.flags.bits());
        w.put_u32(0);
        self.times.write(w);
        w.put_u64(self.allocation_size);
        w.put_u64(self.end_of_file);
        w.put_u32(self.file_attributes.bits());
        Ok(())
    }
}

/// SMB2 FLUSH request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2FlushRequest {
    pub file_id: FileId,
}

impl SmbMessage for Smb2FlushRequest {
    const COMMAND: Smb2Command = Smb2Command::Flush;
    const STRUCTURE_SIZE: u16 = structure_size::FLUSH_REQUEST;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("FLUSH", Self::STRUCTURE_SIZE)?;
        cur.skip(6)?;
        Ok(Self {
            file_id: FileId::read(&mut cur)?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(0);
        w.put_u32(0);
        self.file_id.write(w);
        Ok(())
    }
}

/// SMB2 READ request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2ReadRequest {
    pub flags: u8,
    pub length: u32,
    pub offset: u64,
    pub file_id: FileId,
    pub minimum_count: u32,
    pub remaining_bytes: u32,
}

impl Smb2ReadRequest {
    pub fn new(file_id: FileId, offset: u64, length: u32) -> Self {
        Self {
            length,
            offset,
            file_id,
            ..Default::default()
        }
    }
}

impl SmbMessage for Smb2ReadRequest {
    const COMMAND: Smb2Command = Smb2Command::Read;
    const STRUCTURE_SIZE: u16 = structure_size::READ_REQUEST;

    fn payload_size(&self) -> usize {
        self.length as usize
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("READ", Self::STRUCTURE_SIZE)?;
        cur.skip(1)?;
        let flags = cur.u8()?;
        let length = cur.u32()?;
        let offset = cur.u64()?;
        let file_id = FileId::read(&mut cur)?;
        let minimum_count = cur.u32()?;
        cur.skip(4)?;
        let remaining_bytes = cur.u32()?;
        Ok(Self {
            flags,
            length,
            offset,
            file_id,
            minimum_count,
            remaining_bytes,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        // padding hint: data lands right after the 16 byte reply fixed part
        w.put_u8((SMB2_HEADER_SIZE + 16) as u8);
        w.put_u8(self.flags);
        w.put_u32(self.length);
        w.put_u64(self.offset);
        self.file_id.write(w);
        w.put_u32(self.minimum_count);
        w.put_u32(0);
        w.put_u32(self.remaining_bytes);
        w.put_u16(0);
        w.put_u16(0);
        w.put_u8(0);
        Ok(())
    }
}

/// SMB2 READ reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2ReadResponse {
    pub data_remaining: u32,
    pub data: Vec<u8>,
}

impl Smb2ReadResponse {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data_remaining: 0,
            data,
        }
    }
}

impl SmbMessage for Smb2ReadResponse {
    const COMMAND: Smb2Command = Smb2Command::Read;
    const STRUCTURE_SIZE: u16 = structure_size::READ_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(2)?;
        let offset = cur.u8()?;
        cur.skip(1)?;
        let len = cur.u32()?;
        variable_extent(offset as u32, len, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("READ", Self::STRUCTURE_SIZE)?;
        let offset = cur.u8()?;
        cur.skip(1)?;
        let len = cur.u32()?;
        let data_remaining = cur.u32()?;
        let data = body_slice(body, offset as u32, len, Self::fixed_len())?.to_vec();
        Ok(Self {
            data_remaining,
            data,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8((SMB2_HEADER_SIZE + 16) as u8);
        w.put_u8(0);
        w.put_u32(self.data.len() as u32);
        w.put_u32(self.data_remaining);
        w.put_u32(0);
        if self.data.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.data);
        }
        Ok(())
    }
}

/// SMB2 WRITE request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2WriteRequest {
    pub offset: u64,
    pub file_id: FileId,
    pub remaining_bytes: u32,
    pub flags: u32,
    pub data: Vec<u8>,
}

impl Smb2WriteRequest {
    pub fn new(file_id: FileId, offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            file_id,
            data,
            ..Default::default()
        }
    }
}

impl SmbMessage for Smb2WriteRequest {
    const COMMAND: Smb2Command = Smb2Command::Write;
    const STRUCTURE_SIZE: u16 = structure_size::WRITE_REQUEST;

    fn payload_size(&self) -> usize {
        self.data.len()
    }

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(2)?;
        let offset = cur.u16()?;
        let len = cur.u32()?;
        variable_extent(offset as u32, len, Self::fixed_len())
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("WRITE", Self::STRUCTURE_SIZE)?;
        let data_offset = cur.u16()?;
        let len = cur.u32()?;
        let offset = cur.u64()?;
        let file_id = FileId::read(&mut cur)?;
        cur.skip(4)?;
        let remaining_bytes = cur.u32()?;
        cur.skip(4)?;
        let flags = cur.u32()?;
        let data = body_slice(body, data_offset as u32, len, Self::fixed_len())?.to_vec();
        Ok(Self {
            offset,
            file_id,
            remaining_bytes,
            flags,
            data,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16((SMB2_HEADER_SIZE + 48) as u16);
        w.put_u32(self.data.len() as u32);
        w.put_u64(self.offset);
        self.file_id.write(w);
        w.put_u32(0);
        w.put_u32(self.remaining_bytes);
        w.put_u16(0);
        w.put_u16(0);
        w.put_u32(self.flags);
        if self.data.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.data);
        }
        Ok(())
    }
}

/// SMB2 WRITE reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2WriteResponse {
    pub count: u32,
    pub remaining: u32,
}

impl SmbMessage for Smb2WriteResponse {
    const COMMAND: Smb2Command = Smb2Command::Write;
    const STRUCTURE_SIZE: u16 = structure_size::WRITE_REPLY;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("WRITE", Self::STRUCTURE_SIZE)?;
        cur.skip(2)?;
        Ok(Self {
            count: cur.u32()?,
            remaining: cur.u32()?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(0);
        w.put_u32(self.count);
        w.put_u32(self.remaining);
        w.put_u16(0);
        w.put_u16(0);
        w.put_u8(0);
        Ok(())
    }
}

/// One byte range in a LOCK request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockElement {
    pub offset: u64,
    pub length: u64,
    pub flags: LockFlags,
}

/// SMB2 LOCK request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Smb2LockRequest {
    pub lock_sequence: u32,
    pub file_id: FileId,
    pub locks: Vec<LockElement>,
}

impl SmbMessage for Smb2LockRequest {
    const COMMAND: Smb2Command = Smb2Command::Lock;
    const STRUCTURE_SIZE: u16 = structure_size::LOCK_REQUEST;

    /// The first lock element is part of the fixed structure.
    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(2)?;
        let count = cur.u16()? as usize;
        if count == 0 {
            return Err(Error::parse("LOCK request without lock elements"));
        }
        Ok((count - 1) * 24)
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("LOCK", Self::STRUCTURE_SIZE)?;
        let count = cur.u16()?;
        let lock_sequence = cur.u32()?;
        let file_id = FileId::read(&mut cur)?;
        let mut locks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cur.u64()?;
            let length = cur.u64()?;
            let flags = LockFlags::from_bits_retain(cur.u32()?);
            cur.skip(4)?;
            locks.push(LockElement {
                offset,
                length,
                flags,
            });
        }
        Ok(Self {
            lock_sequence,
            file_id,
            locks,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        if self.locks.is_empty() {
            return Err(Error::InvalidParameter("LOCK needs at least one range".into()));
        }
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_len16("lock count", self.locks.len())?;
        w.put_u32(self.lock_sequence);
        self.file_id.write(w);
        for lock in &self.locks {
            w.put_u64(lock.offset);
            w.put_u64(lock.length);
            w.put_u32(lock.flags.bits());
            w.put_u32(0);
        }
        Ok(())
    }
}

/// OPLOCK_BREAK notification, acknowledgement and reply share one layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2OplockBreak {
    pub oplock_level: u8,
    pub file_id: FileId,
}

impl SmbMessage for Smb2OplockBreak {
    const COMMAND: Smb2Command = Smb2Command::OplockBreak;
    const STRUCTURE_SIZE: u16 = structure_size::OPLOCK_BREAK;

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("OPLOCK_BREAK", Self::STRUCTURE_SIZE)?;
        let oplock_level = cur.u8()?;
        cur.skip(5)?;
        Ok(Self {
            oplock_level,
            file_id: FileId::read(&mut cur)?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u8(self.oplock_level);
        w.put_u8(0);
        w.put_u32(0);
        self.file_id.write(w);
        Ok(())
    }
}
