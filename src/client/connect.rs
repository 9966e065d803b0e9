//! Connect chain (socket, NEGOTIATE, SESSION_SETUP rounds, TREE_CONNECT)
//! and the session-level commands

use crate::auth::Authenticator;
use crate::connection::{Chain, ConnectionState, Context, Pdu, PduId, Reply};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::messages::{
    NegotiateContext, Smb2Echo, Smb2Logoff, Smb2NegotiateRequest, Smb2NegotiateResponse,
    Smb2SessionSetupRequest, Smb2SessionSetupResponse, Smb2TreeConnectRequest,
    Smb2TreeConnectResponse, Smb2TreeDisconnect,
};
use crate::protocol::smb2_constants::{dialect, Capabilities, SecurityMode, SessionFlags};
use crate::transport::tcp;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// State carried along the connect chain
struct ConnectFlow {
    host: String,
    share: String,
    auth: RefCell<Box<dyn Authenticator>>,
    done: Chain<()>,
}

impl ConnectFlow {
    /// End the chain. A failure closes the socket before the caller hears
    /// about it.
    fn finish(&self, ctx: &mut Context, result: Result<()>) {
        match &result {
            Ok(()) => ctx.set_state(ConnectionState::Active),
            Err(e) => {
                ctx.set_error(format!("connect to \\\\{}\\{} failed: {}", self.host, self.share, e));
                ctx.close_context();
            }
        }
        self.done.finish(ctx, result);
    }

    fn step(self: &Rc<Self>, ctx: &mut Context, f: impl FnOnce(&mut Context) -> Result<()>) {
        if let Err(e) = f(ctx) {
            self.finish(ctx, Err(e));
        }
    }
}

impl Context {
    /// Connect the socket, negotiate, authenticate and connect `share`.
    ///
    /// `server` is `host`, `host:port` or `[v6]:port`. `user` overrides the
    /// configured user name. With passthrough set the chain ends after
    /// session setup.
    pub fn connect_share_async(
        &mut self,
        server: &str,
        share: &str,
        user: Option<&str>,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<()> {
        if let Some(user) = user {
            self.config_mut()?.user = user.to_string();
        }
        let (host, _) = tcp::split_host_port(server)?;
        self.server = host.to_string();
        let flow = Rc::new(ConnectFlow {
            host: host.to_string(),
            share: share.to_string(),
            auth: RefCell::new((self.config.authenticator)(&self.config)),
            done: Chain::new(callback),
        });
        self.connect_async(server, move |ctx, result| match result {
            Ok(()) => flow.step(ctx, |ctx| ctx.send_negotiate(&flow)),
            Err(e) => flow.done.finish(ctx, Err(e)),
        })
    }

    fn send_negotiate(&mut self, flow: &Rc<ConnectFlow>) -> Result<()> {
        let mut req = Smb2NegotiateRequest::new(self.config.version.dialects());
        req.security_mode = self.config.security_mode;
        req.client_guid = self.config.client_guid;
        if self.config.version.offers_encryption() {
            req.capabilities |= Capabilities::ENCRYPTION;
        }
        if req.offers(dialect::SMB3_11) {
            req.contexts = vec![
                NegotiateContext::preauth_sha512(),
                NegotiateContext::encryption_aes128(),
            ];
        }
        let flow = flow.clone();
        let pdu = Pdu::new(&req, move |ctx, result| {
            match result.and_then(|reply| ctx.apply_negotiate(&reply)) {
                Ok(()) => flow.step(ctx, |ctx| ctx.session_setup_first(&flow)),
                Err(e) => flow.finish(ctx, Err(e)),
            }
        })?;
        self.queue(pdu)?;
        Ok(())
    }

    fn apply_negotiate(&mut self, reply: &Reply) -> Result<()> {
        let rep: Smb2NegotiateResponse = reply.decode()?;
        if !self
            .config
            .version
            .dialects()
            .contains(&rep.dialect_revision)
        {
            return Err(Error::NotSupported(format!(
                "server selected dialect 0x{:04x}, which was not offered",
                rep.dialect_revision
            )));
        }
        self.dialect = rep.dialect_revision;
        self.server_capabilities = rep.capabilities;
        self.server_security_mode = rep.security_mode;
        self.server_guid = rep.server_guid;
        self.max_transact_size = rep.max_transact_size;
        self.max_read_size = rep.max_read_size;
        self.max_write_size = rep.max_write_size;

        if self.config.signing_requested()
            && !rep.security_mode.contains(SecurityMode::SIGNING_ENABLED)
        {
            return Err(Error::NotSupported(
                "signing is required but the server does not support it".into(),
            ));
        }
        self.signing = self.config.signing_requested()
            || rep.security_mode.contains(SecurityMode::SIGNING_REQUIRED);

        if self.config.seal {
            if self.dialect < dialect::SMB3_00 {
                return Err(Error::NotSupported(format!(
                    "sealing needs SMB 3, server selected 0x{:04x}",
                    self.dialect
                )));
            }
            if self.dialect < dialect::SMB3_11
                && !rep.capabilities.contains(Capabilities::ENCRYPTION)
            {
                return Err(Error::NotSupported(
                    "server does not support encryption".into(),
                ));
            }
        }
        info!(
            dialect = format_args!("0x{:04x}", self.dialect),
            max_read = self.max_read_size,
            max_write = self.max_write_size,
            signing = self.signing,
            "negotiated"
        );
        self.set_state(ConnectionState::SessionSetup);
        Ok(())
    }

    fn session_setup_first(&mut self, flow: &Rc<ConnectFlow>) -> Result<()> {
        let token = flow.auth.borrow_mut().initial_token()?;
        self.send_session_setup(flow, token)
    }

    fn send_session_setup(&mut self, flow: &Rc<ConnectFlow>, token: Vec<u8>) -> Result<()> {
        let req = Smb2SessionSetupRequest::new(self.config.security_mode, token);
        let flow = flow.clone();
        let pdu = Pdu::new(&req, move |ctx, result| {
            match result.and_then(|reply| ctx.session_setup_reply(&flow, &reply)) {
                Ok(true) => {}
                Ok(false) => flow.step(ctx, |ctx| ctx.after_session_setup(&flow)),
                Err(e) => flow.finish(ctx, Err(e)),
            }
        })?;
        self.queue(pdu)?;
        Ok(())
    }

    /// True when another round was sent.
    fn session_setup_reply(&mut self, flow: &Rc<ConnectFlow>, reply: &Reply) -> Result<bool> {
        if self.session_id == 0 {
            self.session_id = reply.header.session_id;
        }
        let rep: Smb2SessionSetupResponse = reply.decode()?;
        if reply.status() == NtStatus::MORE_PROCESSING_REQUIRED {
            let token = flow.auth.borrow_mut().next_token(&rep.security_buffer)?;
            debug!(session_id = self.session_id, "session setup round");
            self.send_session_setup(flow, token)?;
            return Ok(true);
        }

        if rep
            .session_flags
            .intersects(SessionFlags::IS_GUEST | SessionFlags::IS_NULL)
        {
            self.signing = false;
        }
        if rep.session_flags.contains(SessionFlags::ENCRYPT_DATA) || self.config.seal {
            self.sealing = true;
        }
        self.session_key = flow.auth.borrow().session_key();
        if self.signing || self.sealing {
            let factory = self.config.crypto.clone().ok_or_else(|| {
                Error::NotSupported("signing or sealing needs a crypto provider".into())
            })?;
            let key = self.session_key.as_deref().ok_or_else(|| {
                Error::AuthenticationFailed("mechanism produced no session key".into())
            })?;
            self.crypto = Some(factory(key, self.dialect)?);
        }
        info!(
            session_id = self.session_id,
            sealing = self.sealing,
            "session established"
        );
        Ok(false)
    }

    fn after_session_setup(&mut self, flow: &Rc<ConnectFlow>) -> Result<()> {
        if self.config.passthrough {
            flow.finish(self, Ok(()));
            return Ok(());
        }
        let req = Smb2TreeConnectRequest::new(&flow.host, &flow.share);
        let flow = flow.clone();
        let pdu = Pdu::new(&req, move |ctx, result| {
            let result = result.and_then(|reply| {
                let rep: Smb2TreeConnectResponse = reply.decode()?;
                let tree_id = reply.header.tree_id();
                debug!(tree_id, share_type = rep.share_type, "tree connected");
                ctx.connect_tree_id(tree_id);
                Ok(())
            });
            if result.is_ok() {
                ctx.set_state(ConnectionState::TreeConnected);
            }
            flow.finish(ctx, result);
        })?;
        self.queue(pdu)?;
        Ok(())
    }

    /// TREE_DISCONNECT the current share, LOGOFF, then close the socket.
    pub fn disconnect_share_async(
        &mut self,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let done = Chain::new(callback);
        if self.tree_ids().is_empty() {
            self.logoff_and_close(done);
            return Ok(());
        }
        let tree_id = self.tree_id();
        let pdu = Pdu::new(&Smb2TreeDisconnect, move |ctx, result| {
            if let Err(e) = result {
                warn!(tree_id, error = %e, "tree disconnect failed");
            }
            if let Err(e) = ctx.disconnect_tree_id(tree_id) {
                warn!(tree_id, error = %e, "tree id already forgotten");
            }
            ctx.logoff_and_close(done);
        })?;
        self.queue(pdu)?;
        Ok(())
    }

    fn logoff_and_close(&mut self, done: Chain<()>) {
        let next = done.clone();
        done.step(self, |ctx| {
            let pdu = Pdu::new(&Smb2Logoff, move |ctx, result| {
                if let Err(e) = result {
                    warn!(error = %e, "logoff failed");
                }
                ctx.session_id = 0;
                ctx.close_context();
                next.finish(ctx, Ok(()));
            })?;
            ctx.queue(pdu)?;
            Ok(())
        });
    }

    pub fn echo_async(
        &mut self,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let pdu = Pdu::new(&Smb2Echo, move |ctx, result| callback(ctx, result.map(|_| ())))?;
        self.queue(pdu)
    }

    /// End the session without closing the socket.
    pub fn logoff_async(
        &mut self,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let pdu = Pdu::new(&Smb2Logoff, move |ctx, result| {
            if result.is_ok() {
                ctx.session_id = 0;
            }
            callback(ctx, result.map(|_| ()))
        })?;
        self.queue(pdu)
    }
}
