//! Server end of one connection
//!
//! [`ServerConnection`] wraps an accepted socket in a server-role
//! [`Context`]. The engine's receive path hands each request link to the
//! dispatcher below, which answers NEGOTIATE, SESSION_SETUP, ECHO and the
//! tree/session bookkeeping itself and routes everything else to the
//! application's [`ServerHandlers`].

use super::{Handled, ServerConfig, ServerHandlers};
use crate::auth::{AcceptStep, ClientIdentity, NtlmServer, ServerAuthenticator};
use crate::connection::{ConnectionState, Context, RequestDispatcher};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::header::Smb2Header;
use crate::protocol::messages::file_info::filetime_now;
use crate::protocol::messages::{
    decode_body, FileId, NegotiateContext, Smb2ChangeNotifyRequest, Smb2CloseRequest,
    Smb2CreateRequest, Smb2Echo, Smb2ErrorResponse, Smb2FlushRequest, Smb2IoctlRequest,
    Smb2LockRequest, Smb2NegotiateRequest, Smb2NegotiateResponse, Smb2OplockBreak,
    Smb2QueryDirectoryRequest, Smb2QueryInfoRequest, Smb2ReadRequest, Smb2SessionSetupRequest,
    Smb2SessionSetupResponse, Smb2SetInfoRequest, Smb2TreeConnectRequest, Smb2WriteRequest,
    SmbMessage,
};
use crate::protocol::smb2_constants::{
    dialect, Capabilities, SecurityMode, SessionFlags, Smb2Command, Smb2HeaderFlags,
};
use bytes::Bytes;
use std::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Server side of one accepted connection
pub struct ServerConnection {
    ctx: Context,
}

impl ServerConnection {
    /// Take over an accepted stream. Nothing is read until [`run`] or the
    /// context's service functions are driven.
    ///
    /// [`run`]: ServerConnection::run
    pub fn accept<H>(stream: TcpStream, handlers: H, config: ServerConfig) -> Result<Self>
    where
        H: ServerHandlers + 'static,
    {
        let peer = stream.peer_addr().ok();
        let dispatcher = ServerDispatcher::new(handlers, config);
        let ctx = Context::accepted(stream, Box::new(dispatcher))?;
        debug!(?peer, "accepted connection");
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The context, for callers driving it from their own event loop.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Serve requests until the client goes away.
    pub fn run(&mut self) -> Result<()> {
        while self.ctx.is_connected() {
            match self.ctx.poll_once(1000) {
                Ok(()) => {}
                Err(Error::ConnectionReset) | Err(Error::NotConnected) => break,
                Err(e) => return Err(e),
            }
        }
        debug!("connection finished");
        Ok(())
    }
}

/// Request types naming an open through a file id.
trait OpenRequest {
    fn file_id_mut(&mut self) -> &mut FileId;
}

macro_rules! open_request {
    ($($ty:ty),* $(,)?) => {
        $(impl OpenRequest for $ty {
            fn file_id_mut(&mut self) -> &mut FileId {
                &mut self.file_id
            }
        })*
    };
}

open_request!(
    Smb2CloseRequest,
    Smb2FlushRequest,
    Smb2ReadRequest,
    Smb2WriteRequest,
    Smb2LockRequest,
    Smb2IoctlRequest,
    Smb2QueryDirectoryRequest,
    Smb2ChangeNotifyRequest,
    Smb2QueryInfoRequest,
    Smb2SetInfoRequest,
    Smb2OplockBreak,
);

/// Session progress on this connection
enum SessionState {
    None,
    InProgress(NtlmServer),
    Established,
}

struct ServerDispatcher<H: ServerHandlers> {
    handlers: H,
    config: ServerConfig,
    negotiated: bool,
    client_security_mode: SecurityMode,
    session: SessionState,
    next_tree_id: u32,
    /// Outcome of the CREATE heading the current related chain
    chain_create: Option<std::result::Result<FileId, NtStatus>>,
}

impl<H: ServerHandlers> ServerDispatcher<H> {
    fn new(handlers: H, config: ServerConfig) -> Self {
        Self {
            handlers,
            config,
            negotiated: false,
            client_security_mode: SecurityMode::empty(),
            session: SessionState::None,
            next_tree_id: 0,
            chain_create: None,
        }
    }

    fn security_mode(&self) -> SecurityMode {
        if self.config.require_signing {
            SecurityMode::SIGNING_ENABLED | SecurityMode::SIGNING_REQUIRED
        } else {
            SecurityMode::SIGNING_ENABLED
        }
    }

    fn negotiate_response(&self, dialect_revision: u16) -> Smb2NegotiateResponse {
        let mut capabilities = Capabilities::empty();
        if dialect_revision >= dialect::SMB2_10 {
            capabilities |= Capabilities::LARGE_MTU;
        }
        let contexts = if dialect_revision == dialect::SMB3_11 {
            vec![NegotiateContext::preauth_sha512()]
        } else {
            Vec::new()
        };
        Smb2NegotiateResponse {
            security_mode: self.security_mode(),
            dialect_revision,
            server_guid: self.config.server_guid,
            capabilities,
            max_transact_size: self.config.max_transact_size,
            max_read_size: self.config.max_read_size,
            max_write_size: self.config.max_write_size,
            system_time: filetime_now(),
            server_start_time: 0,
            security_buffer: Vec::new(),
            contexts,
        }
    }

    fn negotiate(&mut self, ctx: &mut Context, header: &Smb2Header, body: &[u8]) -> Result<()> {
        if self.negotiated {
            return Err(Error::InvalidState(
                "second NEGOTIATE on a negotiated connection".into(),
            ));
        }
        let Some(req) = decode_request::<Smb2NegotiateRequest>(ctx, header, body)? else {
            return Ok(());
        };
        let ours = self.config.version.dialects();
        let Some(chosen) = req
            .dialects
            .iter()
            .copied()
            .filter(|d| ours.contains(d))
            .max()
        else {
            debug!(offered = ?req.dialects, "no common dialect");
            return send_error(ctx, header, NtStatus::NOT_SUPPORTED);
        };

        self.negotiated = true;
        self.client_security_mode = req.security_mode;
        ctx.dialect = chosen;
        ctx.server_guid = self.config.server_guid;
        ctx.max_transact_size = self.config.max_transact_size;
        ctx.max_read_size = self.config.max_read_size;
        ctx.max_write_size = self.config.max_write_size;
        info!(
            dialect = format_args!("0x{:04x}", chosen),
            "negotiated"
        );
        let rep = self.negotiate_response(chosen);
        ctx.send_reply(header, NtStatus::SUCCESS, rep.to_bytes()?)?;
        ctx.set_state(ConnectionState::SessionSetup);
        Ok(())
    }

    fn session_setup(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        body: &[u8],
    ) -> Result<()> {
        if !self.negotiated {
            return send_error(ctx, header, NtStatus::INVALID_PARAMETER);
        }
        let Some(req) = decode_request::<Smb2SessionSetupRequest>(ctx, header, body)? else {
            return Ok(());
        };
        if header.session_id == 0 || !matches!(self.session, SessionState::InProgress(_)) {
            // a fresh exchange, possibly re-authenticating
            ctx.session_id = rand::random::<u64>() | 1;
            self.session = SessionState::InProgress(NtlmServer::new(
                self.config.workgroup.clone(),
                self.config.server_name.clone(),
            ));
        } else if header.session_id != ctx.session_id {
            return send_error(ctx, header, NtStatus::USER_SESSION_DELETED);
        }
        let SessionState::InProgress(auth) = &mut self.session else {
            return Err(Error::InvalidState("session exchange lost".into()));
        };

        let step = match auth.accept(&req.security_buffer) {
            Ok(step) => step,
            Err(e) => return self.logon_failure(ctx, header, &e),
        };
        match step {
            AcceptStep::Continue(token) => {
                trace!(session_id = ctx.session_id, "session setup round");
                let rep = Smb2SessionSetupResponse {
                    session_flags: SessionFlags::empty(),
                    security_buffer: token,
                };
                ctx.send_reply(header, NtStatus::MORE_PROCESSING_REQUIRED, rep.to_bytes()?)
            }
            AcceptStep::Complete(identity) => {
                if identity.is_anonymous() && !self.config.allow_anonymous {
                    let e = Error::Status(NtStatus::ACCESS_DENIED);
                    return self.logon_failure(ctx, header, &e);
                }
                let authorization = self.handlers.authorize_user(&identity);
                if let Err(e) = auth.verify(&authorization) {
                    return self.logon_failure(ctx, header, &e);
                }
                let key = auth.session_key();
                self.establish(ctx, header, &req, identity, key)
            }
        }
    }

    fn establish(
        &mut self,
        ctx: &mut Context,
        header: &Smb2Header,
        req: &Smb2SessionSetupRequest,
        identity: ClientIdentity,
        key: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut flags = SessionFlags::empty();
        if identity.is_anonymous() {
            flags |= SessionFlags::IS_NULL;
        }
        let wants_signing = self.config.require_signing
            || self
                .client_security_mode
                .union(req.security_mode)
                .contains(SecurityMode::SIGNING_REQUIRED);
        ctx.signing = false;
        if wants_signing && !identity.is_anonymous() {
            match (&self.config.crypto, key.as_deref()) {
                (Some(factory), Some(key)) => {
                    ctx.set_crypto(factory(key, ctx.dialect)?);
                    ctx.signing = true;
                }
                _ => warn!("signing requested without a crypto provider or session key"),
            }
        }
        ctx.session_key = key;

        let rep = Smb2SessionSetupResponse {
            session_flags: flags,
            security_buffer: Vec::new(),
        };
        ctx.send_reply(header, NtStatus::SUCCESS, rep.to_bytes()?)?;
        self.session = SessionState::Established;
        ctx.set_state(ConnectionState::Active);
        info!(
            session_id = ctx.session_id,
            user = %identity.user,
            domain = %identity.domain,
            signing = ctx.signing,
            "session established"
        );
        self.handlers.session_established(ctx, &identity);
        Ok(())
    }

    fn logon_failure(&mut self, ctx: &mut Context, header: &Smb2Header, err: &Error) -> Result<()> {
        info!(error = %err, "logon failed");
        send_error(ctx, header, NtStatus::LOGON_FAILURE)?;
        self.session = SessionState::None;
        ctx.session_id = 0;
        Ok(())
    }

    fn reset_session(&mut self, ctx: &mut Context) {
        ctx.forget_trees();
        self.session = SessionState::None;
        ctx.session_id = 0;
        ctx.session_key = None;
        ctx.signing = false;
        ctx.crypto = None;
        ctx.set_state(ConnectionState::SessionSetup);
    }

    fn tree_connect(&mut self, ctx: &mut Context, header: &Smb2Header, body: &[u8]) -> Result<()> {
        let Some(req) = decode_request::<Smb2TreeConnectRequest>(ctx, header, body)? else {
            return Ok(());
        };
        self.next_tree_id += 1;
        let tree_id = self.next_tree_id;
        let mut connecting = header.clone();
        connecting.set_tree_id(tree_id);
        debug!(path = %req.path, tree_id, "tree connect");
        let handled = self.handlers.tree_connect(ctx, &connecting, req);
        if !handled.is_error() {
            ctx.connect_tree_id(tree_id);
        }
        answer(ctx, &connecting, handled)
    }

    /// Decode a request naming an open, resolving the related-operation
    /// sentinel against the CREATE that heads the chain.
    fn open_request<T: SmbMessage + OpenRequest>(
        &self,
        ctx: &mut Context,
        header: &Smb2Header,
        body: &[u8],
    ) -> Result<Option<T>> {
        let Some(mut req) = decode_request::<T>(ctx, header, body)? else {
            return Ok(None);
        };
        if req.file_id_mut().is_compound() {
            match self.chain_create {
                Some(Ok(file_id)) if header.flags.contains(Smb2HeaderFlags::RELATED_OPERATIONS) => {
                    *req.file_id_mut() = file_id;
                }
                Some(Err(status))
                    if header.flags.contains(Smb2HeaderFlags::RELATED_OPERATIONS) =>
                {
                    send_error(ctx, header, status)?;
                    return Ok(None);
                }
                _ => {
                    send_error(ctx, header, NtStatus::INVALID_PARAMETER)?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(req))
    }

    fn session_valid(&self, ctx: &Context, header: &Smb2Header) -> bool {
        matches!(self.session, SessionState::Established)
            && ctx.session_id != 0
            && header.session_id == ctx.session_id
    }
}

/// Decode a request body, answering INVALID_PARAMETER when it is malformed.
fn decode_request<T: SmbMessage>(
    ctx: &mut Context,
    header: &Smb2Header,
    body: &[u8],
) -> Result<Option<T>> {
    match decode_body::<T>(body) {
        Ok(req) => Ok(Some(req)),
        Err(e) => {
            debug!(command = header.command.name(), error = %e, "malformed request");
            send_error(ctx, header, NtStatus::INVALID_PARAMETER)?;
            Ok(None)
        }
    }
}

fn send_error(ctx: &mut Context, header: &Smb2Header, status: NtStatus) -> Result<()> {
    trace!(command = header.command.name(), %status, "error reply");
    ctx.send_reply(header, status, Smb2ErrorResponse::default().to_bytes()?)
}

fn answer<T: SmbMessage>(ctx: &mut Context, header: &Smb2Header, handled: Handled<T>) -> Result<()> {
    match handled {
        Handled::Reply(rep) => ctx.send_reply(header, NtStatus::SUCCESS, rep.to_bytes()?),
        Handled::Error(status) => send_error(ctx, header, status),
        Handled::Queued => Ok(()),
    }
}

impl<H: ServerHandlers> RequestDispatcher for ServerDispatcher<H> {
    fn dispatch(&mut self, ctx: &mut Context, header: Smb2Header, body: Bytes) -> Result<()> {
        let related = header.flags.contains(Smb2HeaderFlags::RELATED_OPERATIONS);
        if !related {
            self.chain_create = None;
        }
        trace!(
            command = header.command.name(),
            message_id = header.message_id,
            related,
            "request"
        );

        match header.command {
            Smb2Command::Negotiate => return self.negotiate(ctx, &header, &body),
            Smb2Command::SessionSetup => return self.session_setup(ctx, &header, &body),
            Smb2Command::Echo => {
                return ctx.send_reply(&header, NtStatus::SUCCESS, Smb2Echo.to_bytes()?)
            }
            Smb2Command::Cancel => {
                self.handlers.cancel(ctx, &header);
                return Ok(());
            }
            _ => {}
        }

        if !self.session_valid(ctx, &header) {
            return send_error(ctx, &header, NtStatus::USER_SESSION_DELETED);
        }
        if header.command.uses_tree_id()
            && !related
            && !ctx.tree_ids().contains(&header.tree_id())
        {
            return send_error(ctx, &header, NtStatus::NETWORK_NAME_DELETED);
        }

        let h = &header;
        match header.command {
            Smb2Command::Logoff => {
                let handled = self.handlers.logoff(ctx, h);
                let ok = !handled.is_error();
                answer(ctx, h, handled)?;
                if ok {
                    self.reset_session(ctx);
                }
                Ok(())
            }
            Smb2Command::TreeConnect => self.tree_connect(ctx, h, &body),
            Smb2Command::TreeDisconnect => {
                let handled = self.handlers.tree_disconnect(ctx, h);
                if !handled.is_error() {
                    ctx.disconnect_tree_id(h.tree_id())?;
                }
                answer(ctx, h, handled)
            }
            Smb2Command::Create => {
                let Some(req) = decode_request::<Smb2CreateRequest>(ctx, h, &body)? else {
                    self.chain_create = Some(Err(NtStatus::INVALID_PARAMETER));
                    return Ok(());
                };
                let handled = self.handlers.create(ctx, h, req);
                self.chain_create = match &handled {
                    Handled::Reply(rep) => Some(Ok(rep.file_id)),
                    Handled::Error(status) => Some(Err(*status)),
                    Handled::Queued => None,
                };
                answer(ctx, h, handled)
            }
            Smb2Command::Close => {
                let Some(req) = self.open_request::<Smb2CloseRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.close(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::Flush => {
                let Some(req) = self.open_request::<Smb2FlushRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.flush(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::Read => {
                let Some(req) = self.open_request::<Smb2ReadRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.read(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::Write => {
                let Some(req) = self.open_request::<Smb2WriteRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.write(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::Lock => {
                let Some(req) = self.open_request::<Smb2LockRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.lock(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::Ioctl => {
                let Some(req) = self.open_request::<Smb2IoctlRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.ioctl(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::QueryDirectory => {
                let Some(req) = self.open_request::<Smb2QueryDirectoryRequest>(ctx, h, &body)?
                else {
                    return Ok(());
                };
                let handled = self.handlers.query_directory(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::ChangeNotify => {
                let Some(req) = self.open_request::<Smb2ChangeNotifyRequest>(ctx, h, &body)?
                else {
                    return Ok(());
                };
                let handled = self.handlers.change_notify(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::QueryInfo => {
                let Some(req) = self.open_request::<Smb2QueryInfoRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.query_info(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::SetInfo => {
                let Some(req) = self.open_request::<Smb2SetInfoRequest>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.set_info(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::OplockBreak => {
                let Some(req) = self.open_request::<Smb2OplockBreak>(ctx, h, &body)? else {
                    return Ok(());
                };
                let handled = self.handlers.oplock_break(ctx, h, req);
                answer(ctx, h, handled)
            }
            Smb2Command::Negotiate
            | Smb2Command::SessionSetup
            | Smb2Command::Echo
            | Smb2Command::Cancel => Ok(()),
        }
    }

    fn smb1_negotiate(&mut self, ctx: &mut Context) -> Result<()> {
        debug!("SMB1 negotiate, answering with the SMB2 wildcard dialect");
        let mut request = Smb2Header::new(Smb2Command::Negotiate);
        request.credits = 1;
        let rep = self.negotiate_response(dialect::SMB2_WILDCARD);
        ctx.send_reply(&request, NtStatus::SUCCESS, rep.to_bytes()?)
    }
}

impl<H: ServerHandlers> Drop for ServerDispatcher<H> {
    fn drop(&mut self) {
        self.handlers.destruction_event();
    }
}
