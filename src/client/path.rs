//! Path-based operations, each a CREATE → op → CLOSE compound chain on the
//! compound file id

use super::file::{decode_all_information, end_of_file_request};
use super::{smb_path, Stat, StatVfs};
use crate::connection::{Context, Pdu, PduId, Reply};
use crate::error::{Error, Result};
use crate::protocol::messages::file_info::{
    FileAllInformation, FileFsFullSizeInformation, FileRenameInformation, InfoClass,
    SymlinkReparseBuffer,
};
use crate::protocol::messages::{
    FileId, Smb2CloseRequest, Smb2CreateRequest, Smb2IoctlRequest, Smb2IoctlResponse,
    Smb2QueryInfoRequest, Smb2QueryInfoResponse, Smb2SetInfoRequest, SmbMessage,
};
use crate::protocol::smb2_constants::{
    fsctl, info_type, CreateDisposition, CreateOptions, DesiredAccess, FileAttributes,
    ShareAccess, IOCTL_IS_FSCTL,
};
use std::cell::RefCell;
use std::rc::Rc;

type Slot<T> = Rc<RefCell<Option<Result<T>>>>;

fn open_request(path: &str, access: DesiredAccess, options: CreateOptions) -> Smb2CreateRequest {
    let mut req = Smb2CreateRequest::new(smb_path(path));
    req.desired_access = access;
    req.share_access = ShareAccess::READ | ShareAccess::WRITE | ShareAccess::DELETE;
    req.create_options = options;
    req
}

impl Context {
    /// Queue CREATE, `op` on the compound file id, and CLOSE as one chain.
    /// The first failure in the chain is what the caller sees.
    fn path_compound<M, T>(
        &mut self,
        create: &Smb2CreateRequest,
        op: &M,
        decode: impl FnOnce(&Reply) -> Result<T> + 'static,
        callback: impl FnOnce(&mut Context, Result<T>) + 'static,
    ) -> Result<PduId>
    where
        M: SmbMessage,
        T: 'static,
    {
        let slot: Slot<T> = Rc::new(RefCell::new(None));

        let s = slot.clone();
        let mut pdu = Pdu::new(create, move |_, result| {
            if let Err(e) = result {
                *s.borrow_mut() = Some(Err(e));
            }
        })?;
        let s = slot.clone();
        pdu.add_compound(Pdu::new(op, move |_, result| {
            let mut s = s.borrow_mut();
            if s.is_none() {
                *s = Some(result.and_then(|reply| decode(&reply)));
            }
        })?);
        pdu.add_compound(Pdu::new(
            &Smb2CloseRequest::new(FileId::COMPOUND),
            move |ctx, result| {
                let outcome = slot.borrow_mut().take();
                let outcome = match outcome {
                    Some(outcome) => outcome,
                    None => Err(result.err().unwrap_or_else(|| {
                        Error::InvalidState("compound ended without a result".into())
                    })),
                };
                callback(ctx, outcome)
            },
        )?);
        self.queue(pdu)
    }

    /// CREATE then CLOSE, for operations done by the open itself.
    fn create_close(
        &mut self,
        create: &Smb2CreateRequest,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let slot: Slot<()> = Rc::new(RefCell::new(None));
        let s = slot.clone();
        let mut pdu = Pdu::new(create, move |_, result| {
            *s.borrow_mut() = Some(result.map(|_| ()));
        })?;
        pdu.add_compound(Pdu::new(
            &Smb2CloseRequest::new(FileId::COMPOUND),
            move |ctx, result| {
                let outcome = slot.borrow_mut().take().unwrap_or(result.map(|_| ()));
                callback(ctx, outcome)
            },
        )?);
        self.queue(pdu)
    }

    pub fn stat_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<Stat>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            path,
            DesiredAccess::FILE_READ_ATTRIBUTES | DesiredAccess::FILE_READ_EA,
            CreateOptions::empty(),
        );
        let op = Smb2QueryInfoRequest::new(
            info_type::FILE,
            FileAllInformation::CLASS,
            FileId::COMPOUND,
        );
        self.path_compound(
            &create,
            &op,
            |reply| decode_all_information(&reply.body).map(|info| Stat::from(&info)),
            callback,
        )
    }

    pub fn truncate_async(
        &mut self,
        path: &str,
        length: u64,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            path,
            DesiredAccess::FILE_WRITE_DATA,
            CreateOptions::NON_DIRECTORY_FILE,
        );
        let op = end_of_file_request(FileId::COMPOUND, length);
        self.path_compound(&create, &op, |_| Ok(()), callback)
    }

    /// Rename `old` to `new`, both relative to the share root. An existing
    /// target is not replaced.
    pub fn rename_async(
        &mut self,
        old: &str,
        new: &str,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            old,
            DesiredAccess::DELETE | DesiredAccess::FILE_READ_ATTRIBUTES,
            CreateOptions::empty(),
        );
        let info = FileRenameInformation {
            replace_if_exists: false,
            file_name: smb_path(new),
        };
        let op = Smb2SetInfoRequest::new(
            info_type::FILE,
            FileRenameInformation::CLASS,
            FileId::COMPOUND,
            info.to_bytes(),
        );
        self.path_compound(&create, &op, |_| Ok(()), callback)
    }

    pub fn unlink_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            path,
            DesiredAccess::DELETE,
            CreateOptions::NON_DIRECTORY_FILE | CreateOptions::DELETE_ON_CLOSE,
        );
        self.create_close(&create, callback)
    }

    pub fn rmdir_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            path,
            DesiredAccess::DELETE,
            CreateOptions::DIRECTORY_FILE | CreateOptions::DELETE_ON_CLOSE,
        );
        self.create_close(&create, callback)
    }

    pub fn mkdir_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let mut create = open_request(
            path,
            DesiredAccess::FILE_READ_DATA | DesiredAccess::FILE_READ_ATTRIBUTES,
            CreateOptions::DIRECTORY_FILE,
        );
        create.create_disposition = CreateDisposition::Create;
        create.file_attributes = FileAttributes::DIRECTORY;
        self.create_close(&create, callback)
    }

    /// Target of a symbolic link.
    pub fn readlink_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<String>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            path,
            DesiredAccess::FILE_READ_ATTRIBUTES,
            CreateOptions::OPEN_REPARSE_POINT,
        );
        let op = Smb2IoctlRequest::new(
            fsctl::GET_REPARSE_POINT,
            FileId::COMPOUND,
            IOCTL_IS_FSCTL,
            Vec::new(),
        );
        self.path_compound(
            &create,
            &op,
            |reply| {
                let rep: Smb2IoctlResponse = reply.decode()?;
                let link = SymlinkReparseBuffer::parse(&rep.output)?;
                Ok(link.substitute_name.replace('\\', "/"))
            },
            callback,
        )
    }

    /// File system statistics of the share holding `path`.
    pub fn statvfs_async(
        &mut self,
        path: &str,
        callback: impl FnOnce(&mut Context, Result<StatVfs>) + 'static,
    ) -> Result<PduId> {
        let create = open_request(
            path,
            DesiredAccess::FILE_READ_ATTRIBUTES,
            CreateOptions::DIRECTORY_FILE,
        );
        let op = Smb2QueryInfoRequest::new(
            info_type::FILESYSTEM,
            FileFsFullSizeInformation::CLASS,
            FileId::COMPOUND,
        );
        self.path_compound(
            &create,
            &op,
            |reply| {
                let rep: Smb2QueryInfoResponse = reply.decode()?;
                let info = FileFsFullSizeInformation::parse(&rep.output_buffer)?;
                Ok(StatVfs::from(&info))
            },
            callback,
        )
    }
}
