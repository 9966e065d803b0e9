//! Disk share and srvsvc pipe backed by a local directory

use crate::auth::{ClientIdentity, UserAuthorization};
use crate::connection::Context;
use crate::dcerpc::ndr::{NdrCoder, NdrDecoder, NdrEncoder};
use crate::dcerpc::packet::{BindAck, ContextResult, PacketBody, Response, RpcPacket};
use crate::dcerpc::services::srvsvc::{
    opnum, share_type as srv_type, NetrShareEnumReply, NetrShareEnumRequest, ShareInfo,
};
use crate::dcerpc::{ack_result, interfaces};
use crate::error::NtStatus;
use crate::protocol::header::Smb2Header;
use crate::protocol::messages::file_info::{
    build_id_full_directory, unix_to_filetime, FileAllInformation, FileBasicInformation,
    FileIdFullDirectoryInformation, FileStandardInformation, FileTimes, InfoClass,
};
use crate::protocol::messages::{
    FileId, Smb2CloseRequest, Smb2CloseResponse, Smb2CreateRequest, Smb2CreateResponse,
    Smb2IoctlRequest, Smb2IoctlResponse, Smb2QueryDirectoryRequest, Smb2QueryDirectoryResponse,
    Smb2QueryInfoRequest, Smb2QueryInfoResponse, Smb2ReadRequest, Smb2ReadResponse,
    Smb2TreeConnectRequest, Smb2TreeConnectResponse, Smb2WriteRequest, Smb2WriteResponse,
};
use crate::protocol::smb2_constants::{
    create_action, fsctl, share_type, CreateDisposition, CreateOptions, FileAttributes,
};
use crate::server::{Handled, ServerHandlers};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const USER: &str = "alice";
pub(crate) const PASSWORD: &str = "secret";
pub(crate) const DISK_SHARE: &str = "share";

enum Open {
    File {
        path: PathBuf,
        file: fs::File,
        delete_on_close: bool,
    },
    Dir {
        path: PathBuf,
        listed: bool,
        delete_on_close: bool,
    },
    Pipe,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tree {
    Disk,
    Ipc,
}

/// Serves `root` as share `share` plus `IPC$` with an srvsvc pipe.
pub(crate) struct TestShare {
    root: PathBuf,
    trees: HashMap<u32, Tree>,
    opens: HashMap<FileId, Open>,
    next_file_id: u64,
}

impl TestShare {
    pub(crate) fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            trees: HashMap::new(),
            opens: HashMap::new(),
            next_file_id: 0,
        }
    }

    fn fs_path(&self, name: &str) -> PathBuf {
        let clean = name.trim_start_matches('\\').replace('\\', "/");
        self.root.join(clean)
    }

    fn allocate(&mut self, open: Open) -> FileId {
        self.next_file_id += 1;
        let file_id = FileId::new(self.next_file_id, self.next_file_id);
        self.opens.insert(file_id, open);
        file_id
    }

    fn create_file(
        &mut self,
        req: &Smb2CreateRequest,
    ) -> std::result::Result<Smb2CreateResponse, NtStatus> {
        let path = self.fs_path(&req.name);
        let exists = path.exists();
        let delete_on_close = req.create_options.contains(CreateOptions::DELETE_ON_CLOSE);
        let mut action = create_action::OPENED;

        match req.create_disposition {
            CreateDisposition::Open | CreateDisposition::Overwrite if !exists => {
                return Err(NtStatus::OBJECT_NAME_NOT_FOUND)
            }
            CreateDisposition::Create if exists => return Err(NtStatus::OBJECT_NAME_COLLISION),
            _ => {}
        }

        let want_dir = req.create_options.contains(CreateOptions::DIRECTORY_FILE);
        if exists && path.is_dir() {
            if req.create_options.contains(CreateOptions::NON_DIRECTORY_FILE) {
                return Err(NtStatus::FILE_IS_A_DIRECTORY);
            }
        } else if exists && want_dir {
            return Err(NtStatus::NOT_A_DIRECTORY);
        } else if !exists && want_dir {
            fs::create_dir(&path).map_err(|_| NtStatus::ACCESS_DENIED)?;
            action = create_action::CREATED;
        }

        if path.is_dir() {
            let metadata = fs::metadata(&path).map_err(|_| NtStatus::OBJECT_NAME_NOT_FOUND)?;
            let file_id = self.allocate(Open::Dir {
                path,
                listed: false,
                delete_on_close,
            });
            return Ok(create_response(file_id, &metadata, action));
        }

        let truncate = matches!(
            req.create_disposition,
            CreateDisposition::Overwrite | CreateDisposition::OverwriteIf | CreateDisposition::Supersede
        );
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(!exists)
            .truncate(truncate)
            .open(&path)
            .map_err(|_| NtStatus::ACCESS_DENIED)?;
        if !exists {
            action = create_action::CREATED;
        }
        let metadata = file.metadata().map_err(|_| NtStatus::ACCESS_DENIED)?;
        let file_id = self.allocate(Open::File {
            path,
            file,
            delete_on_close,
        });
        Ok(create_response(file_id, &metadata, action))
    }

    fn transceive(&self, input: &[u8]) -> std::result::Result<Vec<u8>, NtStatus> {
        let (packet, _) = RpcPacket::decode(input).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        let body = match packet.body {
            PacketBody::Bind(bind) => {
                let results = bind
                    .contexts
                    .iter()
                    .map(|c| {
                        let syntax = c.transfer_syntaxes.first().copied().unwrap_or(interfaces::NDR32);
                        if syntax == interfaces::NDR32 {
                            ContextResult {
                                result: ack_result::ACCEPTANCE,
                                reason: 0,
                                transfer_syntax: syntax,
                            }
                        } else {
                            ContextResult {
                                result: ack_result::PROVIDER_REJECTION,
                                reason: 2,
                                transfer_syntax: syntax,
                            }
                        }
                    })
                    .collect();
                PacketBody::BindAck(BindAck {
                    max_xmit_frag: bind.max_recv_frag,
                    max_recv_frag: bind.max_xmit_frag,
                    assoc_group_id: 0x1234,
                    secondary_address: "\\PIPE\\srvsvc".to_string(),
                    results,
                })
            }
            PacketBody::Request(request) if request.opnum == opnum::NETR_SHARE_ENUM => {
                let req = NetrShareEnumRequest::decode(&mut NdrDecoder::new(&request.stub, false))
                    .map_err(|_| NtStatus::INVALID_PARAMETER)?;
                debug!(server = ?req.server_name, level = req.level, "share enum");
                let shares = vec![
                    ShareInfo {
                        name: DISK_SHARE.to_string(),
                        share_type: srv_type::DISKTREE,
                        remark: "test data".to_string(),
                    },
                    ShareInfo {
                        name: "IPC$".to_string(),
                        share_type: srv_type::IPC | srv_type::SPECIAL,
                        remark: "Remote IPC".to_string(),
                    },
                ];
                let reply = NetrShareEnumReply {
                    level: req.level,
                    total_entries: shares.len() as u32,
                    shares,
                    resume_handle: Some(0),
                    status: 0,
                };
                let mut enc = NdrEncoder::new(false);
                reply
                    .encode(&mut enc)
                    .map_err(|_| NtStatus::INVALID_PARAMETER)?;
                let stub = enc.into_bytes();
                PacketBody::Response(Response {
                    alloc_hint: stub.len() as u32,
                    context_id: request.context_id,
                    stub,
                })
            }
            _ => return Err(NtStatus::NOT_SUPPORTED),
        };
        RpcPacket::new(packet.call_id, body)
            .encode()
            .map_err(|_| NtStatus::INVALID_PARAMETER)
    }
}

fn times_of(metadata: &fs::Metadata) -> FileTimes {
    let mtime = unix_to_filetime(metadata.mtime(), metadata.mtime_nsec() as u32);
    FileTimes {
        creation: mtime,
        last_access: unix_to_filetime(metadata.atime(), metadata.atime_nsec() as u32),
        last_write: mtime,
        change: unix_to_filetime(metadata.ctime(), metadata.ctime_nsec() as u32),
    }
}

fn attributes_of(metadata: &fs::Metadata) -> FileAttributes {
    if metadata.is_dir() {
        FileAttributes::DIRECTORY
    } else {
        FileAttributes::ARCHIVE
    }
}

fn create_response(file_id: FileId, metadata: &fs::Metadata, action: u32) -> Smb2CreateResponse {
    let mut rep = Smb2CreateResponse::new(file_id);
    rep.create_action = action;
    rep.times = times_of(metadata);
    rep.end_of_file = if metadata.is_dir() { 0 } else { metadata.len() };
    rep.allocation_size = rep.end_of_file;
    rep.file_attributes = attributes_of(metadata);
    rep
}

impl ServerHandlers for TestShare {
    fn authorize_user(&mut self, identity: &ClientIdentity) -> UserAuthorization {
        if identity.is_anonymous() {
            UserAuthorization::Allow
        } else if identity.user == USER {
            UserAuthorization::Password(PASSWORD.to_string())
        } else {
            UserAuthorization::Deny
        }
    }

    fn tree_connect(
        &mut self,
        _ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2TreeConnectRequest,
    ) -> Handled<Smb2TreeConnectResponse> {
        let (tree, kind) = match req.share_name() {
            s if s.eq_ignore_ascii_case(DISK_SHARE) => (Tree::Disk, share_type::DISK),
            s if s.eq_ignore_ascii_case("IPC$") => (Tree::Ipc, share_type::PIPE),
            _ => return Handled::Error(NtStatus::BAD_NETWORK_NAME),
        };
        self.trees.insert(header.tree_id(), tree);
        Handled::Reply(Smb2TreeConnectResponse {
            share_type: kind,
            share_flags: 0,
            capabilities: 0,
            maximal_access: 0x001f_01ff,
        })
    }

    fn create(
        &mut self,
        _ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2CreateRequest,
    ) -> Handled<Smb2CreateResponse> {
        match self.trees.get(&header.tree_id()) {
            Some(Tree::Ipc) if req.name.eq_ignore_ascii_case("srvsvc") => {
                let file_id = self.allocate(Open::Pipe);
                Handled::Reply(Smb2CreateResponse::new(file_id))
            }
            Some(Tree::Ipc) => Handled::Error(NtStatus::OBJECT_NAME_NOT_FOUND),
            Some(Tree::Disk) => match self.create_file(&req) {
                Ok(rep) => Handled::Reply(rep),
                Err(status) => Handled::Error(status),
            },
            None => Handled::Error(NtStatus::NETWORK_NAME_DELETED),
        }
    }

    fn close(
        &mut self,
        _ctx: &mut Context,
        _header: &Smb2Header,
        req: Smb2CloseRequest,
    ) -> Handled<Smb2CloseResponse> {
        match self.opens.remove(&req.file_id) {
            Some(Open::File {
                path,
                file,
                delete_on_close,
            }) => {
                drop(file);
                if delete_on_close && fs::remove_file(&path).is_err() {
                    return Handled::Error(NtStatus::ACCESS_DENIED);
                }
                Handled::Reply(Smb2CloseResponse::default())
            }
            Some(Open::Dir {
                path,
                delete_on_close,
                ..
            }) => {
                if delete_on_close && fs::remove_dir(&path).is_err() {
                    return Handled::Error(NtStatus::DIRECTORY_NOT_EMPTY);
                }
                Handled::Reply(Smb2CloseResponse::default())
            }
            Some(Open::Pipe) => Handled::Reply(Smb2CloseResponse::default()),
            None => Handled::Error(NtStatus::FILE_CLOSED),
        }
    }

    fn read(
        &mut self,
        _ctx: &mut Context,
        _header: &Smb2Header,
        req: Smb2ReadRequest,
    ) -> Handled<Smb2ReadResponse> {
        let Some(Open::File { file, .. }) = self.opens.get(&req.file_id) else {
            return Handled::Error(NtStatus::INVALID_HANDLE);
        };
        let mut buf = vec![0u8; req.length as usize];
        match file.read_at(&mut buf, req.offset) {
            Ok(0) if req.length > 0 => Handled::Error(NtStatus::END_OF_FILE),
            Ok(n) => {
                buf.truncate(n);
                Handled::Reply(Smb2ReadResponse::new(buf))
            }
            Err(_) => Handled::Error(NtStatus::ACCESS_DENIED),
        }
    }

    fn write(
        &mut self,
        _ctx: &mut Context,
        _header: &Smb2Header,
        req: Smb2WriteRequest,
    ) -> Handled<Smb2WriteResponse> {
        let Some(Open::File { file, .. }) = self.opens.get(&req.file_id) else {
            return Handled::Error(NtStatus::INVALID_HANDLE);
        };
        match file.write_all_at(&req.data, req.offset) {
            Ok(()) => Handled::Reply(Smb2WriteResponse {
                count: req.data.len() as u32,
                remaining: 0,
            }),
            Err(_) => Handled::Error(NtStatus::ACCESS_DENIED),
        }
    }

    fn ioctl(
        &mut self,
        _ctx: &mut Context,
        _header: &Smb2Header,
        req: Smb2IoctlRequest,
    ) -> Handled<Smb2IoctlResponse> {
        if req.ctl_code != fsctl::PIPE_TRANSCEIVE {
            return Handled::Error(NtStatus::NOT_SUPPORTED);
        }
        if !matches!(self.opens.get(&req.file_id), Some(Open::Pipe)) {
            return Handled::Error(NtStatus::INVALID_HANDLE);
        }
        match self.transceive(&req.input) {
            Ok(output) => Handled::Reply(Smb2IoctlResponse {
                ctl_code: req.ctl_code,
                file_id: req.file_id,
                flags: 0,
                output,
            }),
            Err(status) => Handled::Error(status),
        }
    }

    fn query_directory(
        &mut self,
        _ctx: &mut Context,
        _header: &Smb2Header,
        req: Smb2QueryDirectoryRequest,
    ) -> Handled<Smb2QueryDirectoryResponse> {
        let Some(Open::Dir { path, listed, .. }) = self.opens.get_mut(&req.file_id) else {
            return Handled::Error(NtStatus::INVALID_HANDLE);
        };
        if *listed {
            return Handled::Error(NtStatus::NO_MORE_FILES);
        }
        *listed = true;
        let Ok(dir) = fs::read_dir(&*path) else {
            return Handled::Error(NtStatus::ACCESS_DENIED);
        };
        let mut entries: Vec<FileIdFullDirectoryInformation> = dir
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let metadata = e.metadata().ok()?;
                Some(FileIdFullDirectoryInformation {
                    times: times_of(&metadata),
                    end_of_file: if metadata.is_dir() { 0 } else { metadata.len() },
                    file_attributes: attributes_of(&metadata),
                    file_id: metadata.ino(),
                    name: e.file_name().to_string_lossy().into_owned(),
                    ..Default::default()
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Handled::Reply(Smb2QueryDirectoryResponse {
            output_buffer: build_id_full_directory(&entries),
        })
    }

    fn query_info(
        &mut self,
        _ctx: &mut Context,
        _header: &Smb2Header,
        req: Smb2QueryInfoRequest,
    ) -> Handled<Smb2QueryInfoResponse> {
        if req.file_info_class != FileAllInformation::CLASS {
            return Handled::Error(NtStatus::NOT_SUPPORTED);
        }
        let path = match self.opens.get(&req.file_id) {
            Some(Open::File { path, .. }) | Some(Open::Dir { path, .. }) => path,
            _ => return Handled::Error(NtStatus::INVALID_HANDLE),
        };
        let Ok(metadata) = fs::metadata(path) else {
            return Handled::Error(NtStatus::OBJECT_NAME_NOT_FOUND);
        };
        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        let info = FileAllInformation {
            basic: FileBasicInformation {
                times: times_of(&metadata),
                file_attributes: attributes_of(&metadata),
            },
            standard: FileStandardInformation {
                allocation_size: size,
                end_of_file: size,
                number_of_links: metadata.nlink() as u32,
                delete_pending: false,
                directory: metadata.is_dir(),
            },
            index_number: metadata.ino(),
            ..Default::default()
        };
        Handled::Reply(Smb2QueryInfoResponse {
            output_buffer: info.to_bytes(),
        })
    }
}
