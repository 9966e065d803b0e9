//! SMB2 server role
//!
//! A [`ServerConnection`] runs the same non-blocking engine as a client
//! context with the roles swapped: the engine answers NEGOTIATE and
//! SESSION_SETUP itself and hands every other request to the application's
//! [`ServerHandlers`], looked up purely by command number.

pub mod connection;

pub use connection::ServerConnection;
pub use crate::transport::tcp::bind_and_listen;

use crate::auth::{ClientIdentity, CryptoFactory, UserAuthorization};
use crate::connection::Context;
use crate::error::NtStatus;
use crate::protocol::header::Smb2Header;
use crate::protocol::messages::{
    Smb2ChangeNotifyRequest, Smb2ChangeNotifyResponse, Smb2CloseRequest, Smb2CloseResponse,
    Smb2CreateRequest, Smb2CreateResponse, Smb2FlushRequest, Smb2FlushResponse,
    Smb2IoctlRequest, Smb2IoctlResponse, Smb2LockRequest, Smb2LockResponse, Smb2Logoff,
    Smb2OplockBreak, Smb2QueryDirectoryRequest, Smb2QueryDirectoryResponse,
    Smb2QueryInfoRequest, Smb2QueryInfoResponse, Smb2ReadRequest, Smb2ReadResponse,
    Smb2SetInfoRequest, Smb2SetInfoResponse, Smb2TreeConnectRequest, Smb2TreeConnectResponse,
    Smb2TreeDisconnect, Smb2WriteRequest, Smb2WriteResponse,
};
use crate::protocol::smb2_constants::Version;
use std::fmt;
use uuid::Uuid;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// NetBIOS/DNS computer name announced by NTLM
    pub server_name: String,
    /// Workgroup or domain announced by NTLM
    pub workgroup: String,
    pub server_guid: Uuid,
    /// Dialects the server is willing to select
    pub version: Version,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    /// Announce SIGNING_REQUIRED in NEGOTIATE
    pub require_signing: bool,
    /// Accept NTLM anonymous logons as null sessions
    pub allow_anonymous: bool,
    /// Signing provider for sessions that sign
    pub crypto: Option<CryptoFactory>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "SMB2-ENGINE".to_string(),
            workgroup: "WORKGROUP".to_string(),
            server_guid: Uuid::new_v4(),
            version: Version::Any,
            max_transact_size: 1024 * 1024,
            max_read_size: 1024 * 1024,
            max_write_size: 1024 * 1024,
            require_signing: false,
            allow_anonymous: false,
            crypto: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("server_name", &self.server_name)
            .field("workgroup", &self.workgroup)
            .field("server_guid", &self.server_guid)
            .field("version", &self.version)
            .field("require_signing", &self.require_signing)
            .field("allow_anonymous", &self.allow_anonymous)
            .field("crypto", &self.crypto.is_some())
            .finish_non_exhaustive()
    }
}

/// What a handler did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled<T> {
    /// The engine sends an error reply with this status
    Error(NtStatus),
    /// The engine encodes and sends this reply with SUCCESS
    Reply(T),
    /// The handler already queued its own reply (for instance an interim
    /// PENDING followed later by an async reply); the engine does nothing
    Queued,
}

impl<T> Handled<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, Handled::Error(_))
    }
}

/// Application callbacks, one per command.
///
/// Every method has a default: session hooks accept everyone, LOGOFF and
/// TREE_DISCONNECT succeed, everything else answers NOT_SUPPORTED. File ids
/// arrive already resolved when a compound request used the
/// related-operation sentinel.
#[allow(unused_variables)]
pub trait ServerHandlers {
    /// Decide about a user whose final NTLM token arrived.
    fn authorize_user(&mut self, identity: &ClientIdentity) -> UserAuthorization {
        UserAuthorization::Allow
    }

    fn session_established(&mut self, ctx: &mut Context, identity: &ClientIdentity) {}

    /// The connection is going away. Called once.
    fn destruction_event(&mut self) {}

    fn logoff(&mut self, ctx: &mut Context, header: &Smb2Header) -> Handled<Smb2Logoff> {
        Handled::Reply(Smb2Logoff)
    }

    /// `header` already carries the tree id the share gets on success.
    fn tree_connect(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2TreeConnectRequest,
    ) -> Handled<Smb2TreeConnectResponse> {
        Handled::Error(NtStatus::BAD_NETWORK_NAME)
    }

    fn tree_disconnect(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
    ) -> Handled<Smb2TreeDisconnect> {
        Handled::Reply(Smb2TreeDisconnect)
    }

    fn create(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2CreateRequest,
    ) -> Handled<Smb2CreateResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn close(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2CloseRequest,
    ) -> Handled<Smb2CloseResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn flush(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2FlushRequest,
    ) -> Handled<Smb2FlushResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn read(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2ReadRequest,
    ) -> Handled<Smb2ReadResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn write(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2WriteRequest,
    ) -> Handled<Smb2WriteResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn lock(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2LockRequest,
    ) -> Handled<Smb2LockResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn ioctl(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2IoctlRequest,
    ) -> Handled<Smb2IoctlResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    /// A CANCEL for an outstanding async request; no reply is sent for it.
    fn cancel(&mut self, ctx: &mut Context, header: &Smb2Header) {}

    fn query_directory(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2QueryDirectoryRequest,
    ) -> Handled<Smb2QueryDirectoryResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn change_notify(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2ChangeNotifyRequest,
    ) -> Handled<Smb2ChangeNotifyResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn query_info(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2QueryInfoRequest,
    ) -> Handled<Smb2QueryInfoResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn set_info(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2SetInfoRequest,
    ) -> Handled<Smb2SetInfoResponse> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }

    fn oplock_break(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: Smb2OplockBreak,
    ) -> Handled<Smb2OplockBreak> {
        Handled::Error(NtStatus::NOT_SUPPORTED)
    }
}
