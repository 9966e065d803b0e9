//! SMB2 protocol messages organized by category

pub mod common;
pub mod directory;
pub mod file_info;
pub mod file_ops;
pub mod info;
pub mod ioctl;
pub mod negotiate;
pub mod session;
pub mod tree;

pub use common::{
    decode_body, FileId, Smb2Cancel, Smb2Echo, Smb2ErrorResponse, Smb2FlushResponse,
    Smb2LockResponse, Smb2Logoff, Smb2TreeDisconnect, SmbMessage,
};
pub use directory::{
    Smb2ChangeNotifyRequest, Smb2ChangeNotifyResponse, Smb2QueryDirectoryRequest,
    Smb2QueryDirectoryResponse,
};
pub use file_ops::{
    LockElement, Smb2CloseRequest, Smb2CloseResponse, Smb2CreateRequest, Smb2CreateResponse,
    Smb2FlushRequest, Smb2LockRequest, Smb2OplockBreak, Smb2ReadRequest, Smb2ReadResponse,
    Smb2WriteRequest, Smb2WriteResponse,
};
pub use info::{Smb2QueryInfoRequest, Smb2QueryInfoResponse, Smb2SetInfoRequest, Smb2SetInfoResponse};
pub use ioctl::{Smb2IoctlRequest, Smb2IoctlResponse};
pub use negotiate::{NegotiateContext, Smb2NegotiateRequest, Smb2NegotiateResponse};
pub use session::{Smb2SessionSetupRequest, Smb2SessionSetupResponse};
pub use tree::{Smb2TreeConnectRequest, Smb2TreeConnectResponse};

use crate::error::Result;
use crate::protocol::smb2_constants::Smb2Command;

/// Fixed part length of a reply body, given the StructureSize it declares.
///
/// Error replies (size 9) are accepted for every command.
pub fn fixed_len_for(struct_size: u16) -> usize {
    (struct_size & 0xfffe) as usize
}

/// Whether a reply body is an error reply rather than the command's own reply.
///
/// Several replies share StructureSize 9 with the error reply, so the
/// header status decides.
pub fn is_error_reply(failed: bool, body: &[u8]) -> bool {
    failed && Smb2ErrorResponse::matches(body)
}

/// Second decode phase for a reply: the variable byte count referenced by
/// the fixed part of `command`'s reply. `failed` is the header status
/// verdict.
pub fn reply_variable_len(command: Smb2Command, failed: bool, fixed: &[u8]) -> Result<usize> {
    if is_error_reply(failed, fixed) {
        return Smb2ErrorResponse::variable_len(fixed);
    }
    match command {
        Smb2Command::Negotiate => Smb2NegotiateResponse::variable_len(fixed),
        Smb2Command::SessionSetup => Smb2SessionSetupResponse::variable_len(fixed),
        Smb2Command::Create => Smb2CreateResponse::variable_len(fixed),
        Smb2Command::Read => Smb2ReadResponse::variable_len(fixed),
        Smb2Command::Ioctl => Smb2IoctlResponse::variable_len(fixed),
        Smb2Command::QueryDirectory => Smb2QueryDirectoryResponse::variable_len(fixed),
        Smb2Command::ChangeNotify => Smb2ChangeNotifyResponse::variable_len(fixed),
        Smb2Command::QueryInfo => Smb2QueryInfoResponse::variable_len(fixed),
        _ => Ok(0),
    }
}

/// Second decode phase for a request body.
pub fn request_variable_len(command: Smb2Command, fixed: &[u8]) -> Result<usize> {
    match command {
        Smb2Command::Negotiate => Smb2NegotiateRequest::variable_len(fixed),
        Smb2Command::SessionSetup => Smb2SessionSetupRequest::variable_len(fixed),
        Smb2Command::TreeConnect => Smb2TreeConnectRequest::variable_len(fixed),
        Smb2Command::Create => Smb2CreateRequest::variable_len(fixed),
        Smb2Command::Write => Smb2WriteRequest::variable_len(fixed),
        Smb2Command::Lock => Smb2LockRequest::variable_len(fixed),
        Smb2Command::Ioctl => Smb2IoctlRequest::variable_len(fixed),
        Smb2Command::QueryDirectory => Smb2QueryDirectoryRequest::variable_len(fixed),
        Smb2Command::QueryInfo => Smb2QueryInfoRequest::variable_len(fixed),
        Smb2Command::SetInfo => Smb2SetInfoRequest::variable_len(fixed),
        _ => Ok(0),
    }
}
