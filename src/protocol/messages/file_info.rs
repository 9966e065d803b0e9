//! Information class payloads carried by QUERY_INFO, SET_INFO,
//! QUERY_DIRECTORY, CHANGE_NOTIFY and the reparse point IOCTL

use crate::error::{Error, Result};
use crate::protocol::cursor::{utf16_decode, utf16_encode, ReadCursor, WriteBuf};
use crate::protocol::smb2_constants::{file_info_class, fs_info_class, FileAttributes};
use crate::protocol::smb2_constants::IO_REPARSE_TAG_SYMLINK;
use chrono::{DateTime, TimeZone, Utc};

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_DIFF: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: i64 = 10_000_000;

/// FILETIME (100ns ticks since 1601) to Unix seconds and nanoseconds.
pub fn filetime_to_unix(ft: u64) -> (i64, u32) {
    let ticks = ft as i64;
    let secs = ticks.div_euclid(FILETIME_TICKS_PER_SEC) - FILETIME_EPOCH_DIFF;
    let nsec = (ticks.rem_euclid(FILETIME_TICKS_PER_SEC) * 100) as u32;
    (secs, nsec)
}

pub fn unix_to_filetime(secs: i64, nsec: u32) -> u64 {
    let ticks = (secs + FILETIME_EPOCH_DIFF) * FILETIME_TICKS_PER_SEC + (nsec / 100) as i64;
    ticks.max(0) as u64
}

/// A zero FILETIME means "not set" and maps to `None`.
pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    if ft == 0 {
        return None;
    }
    let (secs, nsec) = filetime_to_unix(ft);
    Utc.timestamp_opt(secs, nsec).single()
}

pub fn datetime_to_filetime(dt: DateTime<Utc>) -> u64 {
    unix_to_filetime(dt.timestamp(), dt.timestamp_subsec_nanos())
}

/// Current time as FILETIME.
pub fn filetime_now() -> u64 {
    datetime_to_filetime(Utc::now())
}

/// Creation, access, write and change times in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileTimes {
    pub creation: u64,
    pub last_access: u64,
    pub last_write: u64,
    pub change: u64,
}

impl FileTimes {
    pub fn all(ft: u64) -> Self {
        Self {
            creation: ft,
            last_access: ft,
            last_write: ft,
            change: ft,
        }
    }

    pub fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        Ok(Self {
            creation: cur.u64()?,
            last_access: cur.u64()?,
            last_write: cur.u64()?,
            change: cur.u64()?,
        })
    }

    pub fn write(&self, w: &mut WriteBuf) {
        w.put_u64(self.creation);
        w.put_u64(self.last_access);
        w.put_u64(self.last_write);
        w.put_u64(self.change);
    }
}

/// A fixed information class payload
pub trait InfoClass: Sized {
    const CLASS: u8;

    fn parse(data: &[u8]) -> Result<Self>;

    fn serialize(&self, w: &mut WriteBuf);

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = WriteBuf::new();
        self.serialize(&mut w);
        w.into_inner()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileBasicInformation {
    pub times: FileTimes,
    pub file_attributes: FileAttributes,
}

impl FileBasicInformation {
    fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        let times = FileTimes::read(cur)?;
        let file_attributes = FileAttributes::from_bits_retain(cur.u32()?);
        cur.skip(4)?;
        Ok(Self {
            times,
            file_attributes,
        })
    }
}

impl InfoClass for FileBasicInformation {
    const CLASS: u8 = file_info_class::BASIC;

    fn parse(data: &[u8]) -> Result<Self> {
        Self::read(&mut ReadCursor::new(data))
    }

    fn serialize(&self, w: &mut WriteBuf) {
        self.times.write(w);
        w.put_u32(self.file_attributes.bits());
        w.put_u32(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStandardInformation {
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub number_of_links: u32,
    pub delete_pending: bool,
    pub directory: bool,
}

impl FileStandardInformation {
    fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        let allocation_size = cur.u64()?;
        let end_of_file = cur.u64()?;
        let number_of_links = cur.u32()?;
        let delete_pending = cur.u8()? != 0;
        let directory = cur.u8()? != 0;
        cur.skip(2)?;
        Ok(Self {
            allocation_size,
            end_of_file,
            number_of_links,
            delete_pending,
            directory,
        })
    }
}

impl InfoClass for FileStandardInformation {
    const CLASS: u8 = file_info_class::STANDARD;

    fn parse(data: &[u8]) -> Result<Self> {
        Self::read(&mut ReadCursor::new(data))
    }

    fn serialize(&self, w: &mut WriteBuf) {
        w.put_u64(self.allocation_size);
        w.put_u64(self.end_of_file);
        w.put_u32(self.number_of_links);
        w.put_u8(self.delete_pending as u8);
        w.put_u8(self.directory as u8);
        w.put_u16(0);
    }
}

/// FileAllInformation: basic, standard, internal, EA, access, position,
/// mode, alignment and name information back to back
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileAllInformation {
    pub basic: FileBasicInformation,
    pub standard: FileStandardInformation,
    pub index_number: u64,
    pub ea_size: u32,
    pub access_flags: u32,
    pub current_byte_offset: u64,
    pub mode: u32,
    pub alignment_requirement: u32,
    pub name: String,
}

impl InfoClass for FileAllInformation {
    const CLASS: u8 = file_info_class::ALL;

    fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(data);
        let basic = FileBasicInformation::read(&mut cur)?;
        let standard = FileStandardInformation::read(&mut cur)?;
        let index_number = cur.u64()?;
        let ea_size = cur.u32()?;
        let access_flags = cur.u32()?;
        let current_byte_offset = cur.u64()?;
        let mode = cur.u32()?;
        let alignment_requirement = cur.u32()?;
        let name_len = cur.u32()? as usize;
        // servers may truncate the name with BUFFER_OVERFLOW
        let avail = name_len.min(cur.remaining()) & !1;
        let name = utf16_decode(cur.bytes(avail)?)?;
        Ok(Self {
            basic,
            standard,
            index_number,
            ea_size,
            access_flags,
            current_byte_offset,
            mode,
            alignment_requirement,
            name,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) {
        self.basic.serialize(w);
        self.standard.serialize(w);
        w.put_u64(self.index_number);
        w.put_u32(self.ea_size);
        w.put_u32(self.access_flags);
        w.put_u64(self.current_byte_offset);
        w.put_u32(self.mode);
        w.put_u32(self.alignment_requirement);
        let name = utf16_encode(&self.name);
        w.put_u32(name.len() as u32);
        w.put_bytes(&name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileEndOfFileInformation {
    pub end_of_file: u64,
}

impl InfoClass for FileEndOfFileInformation {
    const CLASS: u8 = file_info_class::END_OF_FILE;

    fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            end_of_file: ReadCursor::new(data).u64()?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) {
        w.put_u64(self.end_of_file);
    }
}

/// SMB2 flavour of FileRenameInformation (64 bit RootDirectory)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileRenameInformation {
    pub replace_if_exists: bool,
    pub file_name: String,
}

impl InfoClass for FileRenameInformation {
    const CLASS: u8 = file_info_class::RENAME;

    fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(data);
        let replace_if_exists = cur.u8()? != 0;
        cur.skip(7 + 8)?;
        let len = cur.u32()? as usize;
        let file_name = utf16_decode(cur.bytes(len)?)?;
        Ok(Self {
            replace_if_exists,
            file_name,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) {
        let name = utf16_encode(&self.file_name);
        w.put_u8(self.replace_if_exists as u8);
        w.put_zeros(7);
        w.put_u64(0);
        w.put_u32(name.len() as u32);
        w.put_bytes(&name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileDispositionInformation {
    pub delete_pending: bool,
}

impl InfoClass for FileDispositionInformation {
    const CLASS: u8 = file_info_class::DISPOSITION;

    fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            delete_pending: ReadCursor::new(data).u8()? != 0,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) {
        w.put_u8(self.delete_pending as u8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileFsFullSizeInformation {
    pub total_allocation_units: u64,
    pub caller_available_allocation_units: u64,
    pub actual_available_allocation_units: u64,
    pub sectors_per_allocation_unit: u32,
    pub bytes_per_sector: u32,
}

impl InfoClass for FileFsFullSizeInformation {
    const CLASS: u8 = fs_info_class::FULL_SIZE;

    fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(data);
        Ok(Self {
            total_allocation_units: cur.u64()?,
            caller_available_allocation_units: cur.u64()?,
            actual_available_allocation_units: cur.u64()?,
            sectors_per_allocation_unit: cur.u32()?,
            bytes_per_sector: cur.u32()?,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) {
        w.put_u64(self.total_allocation_units);
        w.put_u64(self.caller_available_allocation_units);
        w.put_u64(self.actual_available_allocation_units);
        w.put_u32(self.sectors_per_allocation_unit);
        w.put_u32(self.bytes_per_sector);
    }
}

/// One FileIdFullDirectoryInformation entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileIdFullDirectoryInformation {
    pub file_index: u32,
    pub times: FileTimes,
    pub end_of_file: u64,
    pub allocation_size: u64,
    pub file_attributes: FileAttributes,
    pub ea_size: u32,
    pub file_id: u64,
    pub name: String,
}

impl FileIdFullDirectoryInformation {
    pub const CLASS: u8 = file_info_class::ID_FULL_DIRECTORY;
    const FIXED_LEN: usize = 80;

    pub fn is_directory(&self) -> bool {
        self.file_attributes.contains(FileAttributes::DIRECTORY)
    }

    fn write(&self, w: &mut WriteBuf) {
        let name = utf16_encode(&self.name);
        w.put_u32(0);
        w.put_u32(self.file_index);
        self.times.write(w);
        w.put_u64(self.end_of_file);
        w.put_u64(self.allocation_size);
        w.put_u32(self.file_attributes.bits());
        w.put_u32(name.len() as u32);
        w.put_u32(self.ea_size);
        w.put_u32(0);
        w.put_u64(self.file_id);
        w.put_bytes(&name);
    }
}

/// Walk a NextEntryOffset chain, handing each entry slice to `f`.
fn walk_chain<T>(
    data: &[u8],
    min_entry: usize,
    mut f: impl FnMut(&[u8]) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    if data.is_empty() {
        return Ok(out);
    }
    loop {
        if pos + min_entry > data.len() {
            return Err(Error::parse(format!(
                "entry at {} runs past the {} byte buffer",
                pos,
                data.len()
            )));
        }
        let next = ReadCursor::new(&data[pos..]).u32()? as usize;
        let end = if next == 0 { data.len() } else { pos + next };
        if end > data.len() || end < pos + min_entry {
            return Err(Error::InvalidOffset(format!("bad next entry offset {}", next)));
        }
        out.push(f(&data[pos..end])?);
        if next == 0 {
            break;
        }
        pos = end;
    }
    Ok(out)
}

/// Concatenate entries with NextEntryOffset links, each entry `align` aligned.
fn build_chain(entries: Vec<Vec<u8>>, align: usize) -> Vec<u8> {
    let mut out = WriteBuf::new();
    let count = entries.len();
    for (i, mut entry) in entries.into_iter().enumerate() {
        if i + 1 < count {
            let next = (entry.len() + align - 1) / align * align;
            entry.resize(next, 0);
            // entry always starts with its NextEntryOffset field
            if let Some(field) = entry.get_mut(..4) {
                field.copy_from_slice(&(next as u32).to_le_bytes());
            }
        }
        out.put_bytes(&entry);
    }
    out.into_inner()
}

pub fn parse_id_full_directory(data: &[u8]) -> Result<Vec<FileIdFullDirectoryInformation>> {
    walk_chain(data, FileIdFullDirectoryInformation::FIXED_LEN, |entry| {
        let mut cur = ReadCursor::new(entry);
        cur.skip(4)?;
        let file_index = cur.u32()?;
        let times = FileTimes::read(&mut cur)?;
        let end_of_file = cur.u64()?;
        let allocation_size = cur.u64()?;
        let file_attributes = FileAttributes::from_bits_retain(cur.u32()?);
        let name_len = cur.u32()? as usize;
        let ea_size = cur.u32()?;
        cur.skip(4)?;
        let file_id = cur.u64()?;
        let name = utf16_decode(cur.bytes(name_len)?)?;
        Ok(FileIdFullDirectoryInformation {
            file_index,
            times,
            end_of_file,
            allocation_size,
            file_attributes,
            ea_size,
            file_id,
            name,
        })
    })
}

pub fn build_id_full_directory(entries: &[FileIdFullDirectoryInformation]) -> Vec<u8> {
    let bufs = entries
        .iter()
        .map(|e| {
            let mut w = WriteBuf::new();
            e.write(&mut w);
            w.into_inner()
        })
        .collect();
    build_chain(bufs, 8)
}

/// Change notification actions
pub mod notify_action {
    pub const ADDED: u32 = 1;
    pub const REMOVED: u32 = 2;
    pub const MODIFIED: u32 = 3;
    pub const RENAMED_OLD_NAME: u32 = 4;
    pub const RENAMED_NEW_NAME: u32 = 5;
}

/// One FileNotifyInformation entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNotifyInformation {
    pub action: u32,
    pub name: String,
}

pub fn parse_notify_chain(data: &[u8]) -> Result<Vec<FileNotifyInformation>> {
    walk_chain(data, 12, |entry| {
        let mut cur = ReadCursor::new(entry);
        cur.skip(4)?;
        let action = cur.u32()?;
        let len = cur.u32()? as usize;
        let name = utf16_decode(cur.bytes(len)?)?;
        Ok(FileNotifyInformation { action, name })
    })
}

pub fn build_notify_chain(entries: &[FileNotifyInformation]) -> Vec<u8> {
    let bufs = entries
        .iter()
        .map(|e| {
            let name = utf16_encode(&e.name);
            let mut w = WriteBuf::new();
            w.put_u32(0);
            w.put_u32(e.action);
            w.put_u32(name.len() as u32);
            w.put_bytes(&name);
            w.into_inner()
        })
        .collect();
    build_chain(bufs, 4)
}

/// Symbolic link reparse data buffer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymlinkReparseBuffer {
    pub substitute_name: String,
    pub print_name: String,
    /// SYMLINK_FLAG_RELATIVE (1) or absolute (0)
    pub flags: u32,
}

impl SymlinkReparseBuffer {
    pub const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(data);
        let tag = cur.u32()?;
        if tag != IO_REPARSE_TAG_SYMLINK {
            return Err(Error::NotSupported(format!("reparse tag 0x{:08x}", tag)));
        }
        let data_len = cur.u16()? as usize;
        cur.skip(2)?;
        if data_len + 8 > data.len() {
            return Err(Error::BufferTooSmall {
                need: data_len + 8,
                have: data.len(),
            });
        }
        let sub_off = cur.u16()? as usize;
        let sub_len = cur.u16()? as usize;
        let print_off = cur.u16()? as usize;
        let print_len = cur.u16()? as usize;
        let flags = cur.u32()?;
        let path = cur.bytes(data_len.saturating_sub(12))?;
        let field = |off: usize, len: usize| -> Result<String> {
            let slice = path.get(off..off + len).ok_or_else(|| {
                Error::InvalidOffset(format!("reparse name at {} len {}", off, len))
            })?;
            utf16_decode(slice)
        };
        Ok(Self {
            substitute_name: field(sub_off, sub_len)?,
            print_name: field(print_off, print_len)?,
            flags,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let sub = utf16_encode(&self.substitute_name);
        let print = utf16_encode(&self.print_name);
        let mut w = WriteBuf::new();
        w.put_u32(IO_REPARSE_TAG_SYMLINK);
        w.put_u16((12 + sub.len() + print.len()) as u16);
        w.put_u16(0);
        w.put_u16(0);
        w.put_u16(sub.len() as u16);
        w.put_u16(sub.len() as u16);
        w.put_u16(print.len() as u16);
        w.put_u32(self.flags);
        w.put_bytes(&sub);
        w.put_bytes(&print);
        w.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_conversion() {
        // 2001-09-09T01:46:40Z
        let ft = unix_to_filetime(1_000_000_000, 500);
        assert_eq!(ft, 126_444_736_000_000_005);
        assert_eq!(filetime_to_unix(ft), (1_000_000_000, 500));
        let dt = filetime_to_datetime(ft).unwrap();
        assert_eq!(dt.timestamp(), 1_000_000_000);
        assert_eq!(datetime_to_filetime(dt), ft);
        assert!(filetime_to_datetime(0).is_none());
    }

    #[test]
    fn test_all_information_layout() {
        let info = FileAllInformation {
            standard: FileStandardInformation {
                end_of_file: 4096,
                number_of_links: 1,
                ..Default::default()
            },
            index_number: 42,
            name: "\\file.txt".into(),
            ..Default::default()
        };
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 100 + 18);
        assert_eq!(FileAllInformation::parse(&bytes).unwrap(), info);
        // truncated name survives
        let short = FileAllInformation::parse(&bytes[..104]).unwrap();
        assert_eq!(short.name, "\\f");
    }

    #[test]
    fn test_directory_chain() {
        let entries = vec![
            FileIdFullDirectoryInformation {
                name: ".".into(),
                file_attributes: FileAttributes::DIRECTORY,
                ..Default::default()
            },
            FileIdFullDirectoryInformation {
                name: "file.txt".into(),
                end_of_file: 12,
                file_id: 7,
                ..Default::default()
            },
        ];
        let data = build_id_full_directory(&entries);
        // first entry is 82 bytes, padded to 88
        assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 88);
        let parsed = parse_id_full_directory(&data).unwrap();
        assert_eq!(parsed, entries);
        assert!(parsed[0].is_directory());
    }

    #[test]
    fn test_directory_chain_bad_offset() {
        let entries = vec![FileIdFullDirectoryInformation {
            name: "a".into(),
            ..Default::default()
        }];
        let mut data = build_id_full_directory(&entries);
        data[0] = 200;
        assert!(parse_id_full_directory(&data).is_err());
        assert!(parse_id_full_directory(&data[..40]).is_err());
        assert!(parse_id_full_directory(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_notify_chain() {
        let entries = vec![
            FileNotifyInformation {
                action: notify_action::ADDED,
                name: "new.txt".into(),
            },
            FileNotifyInformation {
                action: notify_action::REMOVED,
                name: "old".into(),
            },
        ];
        assert_eq!(parse_notify_chain(&build_notify_chain(&entries)).unwrap(), entries);
    }

    #[test]
    fn test_symlink_reparse() {
        let link = SymlinkReparseBuffer {
            substitute_name: "target".into(),
            print_name: "target".into(),
            flags: SymlinkReparseBuffer::SYMLINK_FLAG_RELATIVE,
        };
        assert_eq!(SymlinkReparseBuffer::parse(&link.to_bytes()).unwrap(), link);
        let mut other = link.to_bytes();
        other[0] = 0;
        assert!(matches!(
            SymlinkReparseBuffer::parse(&other),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_rename_information() {
        let info = FileRenameInformation {
            replace_if_exists: true,
            file_name: "dir\\new.txt".into(),
        };
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), 20 + 22);
        assert_eq!(FileRenameInformation::parse(&bytes).unwrap(), info);
    }
}
