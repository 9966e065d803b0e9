//! Open file handles and the commands that work on them

use super::{smb_path, Stat};
use crate::connection::{Context, Pdu, PduId};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::messages::file_info::{
    FileAllInformation, FileEndOfFileInformation, FileStandardInformation, InfoClass,
};
use crate::protocol::messages::{
    FileId, Smb2CloseRequest, Smb2CreateRequest, Smb2CreateResponse, Smb2FlushRequest,
    Smb2OplockBreak, Smb2QueryInfoRequest, Smb2QueryInfoResponse, Smb2ReadRequest,
    Smb2ReadResponse, Smb2SetInfoRequest, Smb2WriteRequest, Smb2WriteResponse,
};
use crate::protocol::smb2_constants::{
    info_type, CreateDisposition, CreateOptions, DesiredAccess, ShareAccess,
};
use bitflags::bitflags;
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

bitflags! {
    /// POSIX-style open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const CREATE = 0x0004;
        const EXCL = 0x0008;
        const TRUNCATE = 0x0010;
        const APPEND = 0x0020;
        const SYNC = 0x0040;
        const DIRECTORY = 0x0080;
    }
}

impl OpenFlags {
    /// Translate `open(2)` flags.
    pub fn from_posix(flags: i32) -> Self {
        let mut out = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WRITE,
            libc::O_RDWR => OpenFlags::READ | OpenFlags::WRITE,
            _ => OpenFlags::READ,
        };
        for (posix, flag) in [
            (libc::O_CREAT, OpenFlags::CREATE),
            (libc::O_EXCL, OpenFlags::EXCL),
            (libc::O_TRUNC, OpenFlags::TRUNCATE),
            (libc::O_APPEND, OpenFlags::APPEND),
            (libc::O_SYNC, OpenFlags::SYNC),
            (libc::O_DIRECTORY, OpenFlags::DIRECTORY),
        ] {
            if flags & posix == posix {
                out |= flag;
            }
        }
        out
    }

    pub(crate) fn create_request(self, path: &str) -> Smb2CreateRequest {
        let mut req = Smb2CreateRequest::new(smb_path(path));
        let mut access = DesiredAccess::empty();
        if self.contains(OpenFlags::READ) || !self.contains(OpenFlags::WRITE) {
            access |= DesiredAccess::FILE_READ_DATA
                | DesiredAccess::FILE_READ_EA
                | DesiredAccess::FILE_READ_ATTRIBUTES;
        }
        if self.contains(OpenFlags::WRITE) {
            access |= DesiredAccess::FILE_WRITE_DATA
                | DesiredAccess::FILE_WRITE_EA
                | DesiredAccess::FILE_WRITE_ATTRIBUTES;
        }
        if self.contains(OpenFlags::APPEND) {
            access |= DesiredAccess::FILE_APPEND_DATA;
        }
        req.desired_access = access;
        req.share_access = ShareAccess::READ | ShareAccess::WRITE;
        req.create_disposition = match (
            self.contains(OpenFlags::CREATE),
            self.contains(OpenFlags::EXCL),
            self.contains(OpenFlags::TRUNCATE),
        ) {
            (true, true, _) => CreateDisposition::Create,
            (true, false, true) => CreateDisposition::OverwriteIf,
            (true, false, false) => CreateDisposition::OpenIf,
            (false, _, true) => CreateDisposition::Overwrite,
            (false, _, false) => CreateDisposition::Open,
        };
        req.create_options = if self.contains(OpenFlags::DIRECTORY) {
            CreateOptions::DIRECTORY_FILE
        } else {
            CreateOptions::NON_DIRECTORY_FILE
        };
        if self.contains(OpenFlags::SYNC) {
            req.create_options |= CreateOptions::WRITE_THROUGH;
        }
        req
    }
}

/// Origin of an `lseek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// An open file. Clones share the file position.
#[derive(Debug, Clone)]
pub struct FileHandle {
    file_id: FileId,
    offset: Rc<Cell<u64>>,
    end_of_file: Rc<Cell<u64>>,
}

impl FileHandle {
    fn new(file_id: FileId, end_of_file: u64) -> Self {
        Self {
            file_id,
            offset: Rc::new(Cell::new(0)),
            end_of_file: Rc::new(Cell::new(end_of_file)),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Position used by `read`/`write`.
    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    /// Size last reported by the server or extended by our writes.
    pub fn end_of_file(&self) -> u64 {
        self.end_of_file.get()
    }

    fn wrote(&self, offset: u64, count: u32) {
        let end = offset + count as u64;
        if end > self.end_of_file.get() {
            self.end_of_file.set(end);
        }
    }
}

impl Context {
    pub fn open_async(
        &mut self,
        path: &str,
        flags: OpenFlags,
        callback: impl FnOnce(&mut Context, Result<FileHandle>) + 'static,
    ) -> Result<PduId> {
        let req = flags.create_request(path);
        let append = flags.contains(OpenFlags::APPEND);
        let pdu = Pdu::new(&req, move |ctx, result| {
            let result = result
                .and_then(|reply| reply.decode::<Smb2CreateResponse>())
                .map(|rep| {
                    let fh = FileHandle::new(rep.file_id, rep.end_of_file);
                    if append {
                        fh.offset.set(rep.end_of_file);
                    }
                    fh
                });
            callback(ctx, result)
        })?;
        self.queue(pdu)
    }

    pub fn close_async(
        &mut self,
        fh: &FileHandle,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let pdu = Pdu::new(&Smb2CloseRequest::new(fh.file_id), move |ctx, result| {
            callback(ctx, result.map(|_| ()))
        })?;
        self.queue(pdu)
    }

    /// Read up to `count` bytes at `offset`. The count is clamped to the
    /// negotiated maximum; end of file completes with an empty buffer.
    pub fn pread_async(
        &mut self,
        fh: &FileHandle,
        count: u32,
        offset: u64,
        callback: impl FnOnce(&mut Context, Result<Vec<u8>>) + 'static,
    ) -> Result<PduId> {
        let count = clamp(count, self.max_read_size);
        trace!(offset, count, "read");
        let req = Smb2ReadRequest::new(fh.file_id, offset, count);
        let pdu = Pdu::new(&req, move |ctx, result| {
            let result = match result {
                Ok(reply) => reply.decode::<Smb2ReadResponse>().map(|rep| rep.data),
                Err(Error::Status(NtStatus::END_OF_FILE)) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
            callback(ctx, result)
        })?;
        self.queue(pdu)
    }

    /// Write at `offset`; completes with the byte count the server took,
    /// which is short when `data` exceeds the negotiated maximum.
    pub fn pwrite_async(
        &mut self,
        fh: &FileHandle,
        data: &[u8],
        offset: u64,
        callback: impl FnOnce(&mut Context, Result<u32>) + 'static,
    ) -> Result<PduId> {
        let len = clamp(data.len().min(u32::MAX as usize) as u32, self.max_write_size);
        trace!(offset, count = len, "write");
        let req = Smb2WriteRequest::new(fh.file_id, offset, data[..len as usize].to_vec());
        let handle = fh.clone();
        let pdu = Pdu::new(&req, move |ctx, result| {
            let result = result
                .and_then(|reply| reply.decode::<Smb2WriteResponse>())
                .map(|rep| {
                    handle.wrote(offset, rep.count);
                    rep.count
                });
            callback(ctx, result)
        })?;
        self.queue(pdu)
    }

    /// `pread` at the handle position, advancing it.
    pub fn read_async(
        &mut self,
        fh: &FileHandle,
        count: u32,
        callback: impl FnOnce(&mut Context, Result<Vec<u8>>) + 'static,
    ) -> Result<PduId> {
        let handle = fh.clone();
        self.pread_async(fh, count, fh.offset(), move |ctx, result| {
            if let Ok(data) = &result {
                handle.offset.set(handle.offset() + data.len() as u64);
            }
            callback(ctx, result)
        })
    }

    /// `pwrite` at the handle position, advancing it.
    pub fn write_async(
        &mut self,
        fh: &FileHandle,
        data: &[u8],
        callback: impl FnOnce(&mut Context, Result<u32>) + 'static,
    ) -> Result<PduId> {
        let handle = fh.clone();
        self.pwrite_async(fh, data, fh.offset(), move |ctx, result| {
            if let Ok(count) = result {
                handle.offset.set(handle.offset() + count as u64);
            }
            callback(ctx, result)
        })
    }

    /// Move the handle position. `Whence::End` asks the server for the
    /// current size first; the other origins complete immediately.
    pub fn lseek_async(
        &mut self,
        fh: &FileHandle,
        offset: i64,
        whence: Whence,
        callback: impl FnOnce(&mut Context, Result<u64>) + 'static,
    ) -> Result<()> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => fh.offset(),
            Whence::End => {
                let handle = fh.clone();
                let req = Smb2QueryInfoRequest::new(
                    info_type::FILE,
                    FileStandardInformation::CLASS,
                    fh.file_id,
                );
                let pdu = Pdu::new(&req, move |ctx, result| {
                    let result = result
                        .and_then(|reply| reply.decode::<Smb2QueryInfoResponse>())
                        .and_then(|rep| FileStandardInformation::parse(&rep.output_buffer))
                        .and_then(|info| {
                            handle.end_of_file.set(info.end_of_file);
                            seek_to(&handle, info.end_of_file, offset)
                        });
                    callback(ctx, result)
                })?;
                self.queue(pdu)?;
                return Ok(());
            }
        };
        let result = seek_to(fh, base, offset);
        callback(self, result);
        Ok(())
    }

    pub fn fsync_async(
        &mut self,
        fh: &FileHandle,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let req = Smb2FlushRequest {
            file_id: fh.file_id,
        };
        let pdu = Pdu::new(&req, move |ctx, result| callback(ctx, result.map(|_| ())))?;
        self.queue(pdu)
    }

    pub fn fstat_async(
        &mut self,
        fh: &FileHandle,
        callback: impl FnOnce(&mut Context, Result<Stat>) + 'static,
    ) -> Result<PduId> {
        let req = Smb2QueryInfoRequest::new(info_type::FILE, FileAllInformation::CLASS, fh.file_id);
        let handle = fh.clone();
        let pdu = Pdu::new(&req, move |ctx, result| {
            let result = result.and_then(|reply| decode_all_information(&reply.body)).map(|info| {
                handle.end_of_file.set(info.standard.end_of_file);
                Stat::from(&info)
            });
            callback(ctx, result)
        })?;
        self.queue(pdu)
    }

    pub fn ftruncate_async(
        &mut self,
        fh: &FileHandle,
        length: u64,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let req = end_of_file_request(fh.file_id, length);
        let handle = fh.clone();
        let pdu = Pdu::new(&req, move |ctx, result| {
            if result.is_ok() {
                handle.end_of_file.set(length);
            }
            callback(ctx, result.map(|_| ()))
        })?;
        self.queue(pdu)
    }

    /// The 16 byte SMB2 file id behind a handle.
    pub fn get_file_id(&self, fh: &FileHandle) -> FileId {
        fh.file_id
    }

    /// Wrap a file id obtained elsewhere (for example from another
    /// process) into a handle positioned at 0.
    pub fn fh_from_file_id(&self, file_id: FileId) -> FileHandle {
        FileHandle::new(file_id, 0)
    }

    /// Acknowledge an oplock break, accepting `oplock_level`.
    pub fn oplock_break_ack_async(
        &mut self,
        file_id: FileId,
        oplock_level: u8,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let req = Smb2OplockBreak {
            oplock_level,
            file_id,
        };
        let pdu = Pdu::new(&req, move |ctx, result| callback(ctx, result.map(|_| ())))?;
        self.queue(pdu)
    }
}

fn clamp(count: u32, max: u32) -> u32 {
    if max == 0 {
        count
    } else {
        count.min(max)
    }
}

fn seek_to(fh: &FileHandle, base: u64, offset: i64) -> Result<u64> {
    let target = if offset < 0 {
        base.checked_sub(offset.unsigned_abs())
    } else {
        base.checked_add(offset as u64)
    }
    .ok_or_else(|| Error::InvalidParameter(format!("seek to {} from {}", offset, base)))?;
    fh.offset.set(target);
    Ok(target)
}

pub(crate) fn decode_all_information(body: &[u8]) -> Result<FileAllInformation> {
    let rep: Smb2QueryInfoResponse = crate::protocol::messages::decode_body(body)?;
    FileAllInformation::parse(&rep.output_buffer)
}

pub(crate) fn end_of_file_request(file_id: FileId, length: u64) -> Smb2SetInfoRequest {
    Smb2SetInfoRequest::new(
        info_type::FILE,
        FileEndOfFileInformation::CLASS,
        file_id,
        FileEndOfFileInformation {
            end_of_file: length,
        }
        .to_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_flags() {
        assert_eq!(OpenFlags::from_posix(libc::O_RDONLY), OpenFlags::READ);
        assert_eq!(
            OpenFlags::from_posix(libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC),
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        );
        assert_eq!(
            OpenFlags::from_posix(libc::O_WRONLY | libc::O_APPEND),
            OpenFlags::WRITE | OpenFlags::APPEND
        );
    }

    #[test]
    fn test_create_request_mapping() {
        let req = (OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL).create_request("/a/b");
        assert_eq!(req.name, "a\\b");
        assert_eq!(req.create_disposition, CreateDisposition::Create);
        assert!(req.desired_access.contains(DesiredAccess::FILE_WRITE_DATA));
        assert!(!req.desired_access.contains(DesiredAccess::FILE_READ_DATA));
        assert!(req.create_options.contains(CreateOptions::NON_DIRECTORY_FILE));

        let req = (OpenFlags::READ | OpenFlags::TRUNCATE).create_request("x");
        assert_eq!(req.create_disposition, CreateDisposition::Overwrite);
        let req = (OpenFlags::READ | OpenFlags::CREATE).create_request("x");
        assert_eq!(req.create_disposition, CreateDisposition::OpenIf);
        let req = OpenFlags::DIRECTORY.create_request("d");
        assert!(req.create_options.contains(CreateOptions::DIRECTORY_FILE));
        assert!(req.desired_access.contains(DesiredAccess::FILE_READ_DATA));
    }

    #[test]
    fn test_lseek_set_and_cur_complete_at_once() {
        let mut ctx = Context::new(Default::default());
        let fh = ctx.fh_from_file_id(FileId::new(1, 2));
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        ctx.lseek_async(&fh, 100, Whence::Set, move |_, r| s.set(r.unwrap()))
            .unwrap();
        assert_eq!(seen.get(), 100);
        let s = seen.clone();
        ctx.lseek_async(&fh, -40, Whence::Cur, move |_, r| s.set(r.unwrap()))
            .unwrap();
        assert_eq!(seen.get(), 60);
        assert_eq!(fh.clone().offset(), 60);

        let failed = Rc::new(Cell::new(false));
        let f = failed.clone();
        ctx.lseek_async(&fh, -100, Whence::Cur, move |_, r| f.set(r.is_err()))
            .unwrap();
        assert!(failed.get());
        assert!(ctx.lseek_async(&fh, 0, Whence::End, |_, _| {}).is_err());
    }

    #[test]
    fn test_clamp_to_negotiated_maximum() {
        assert_eq!(clamp(1 << 20, 65536), 65536);
        assert_eq!(clamp(100, 65536), 100);
        assert_eq!(clamp(100, 0), 100);
    }
}
