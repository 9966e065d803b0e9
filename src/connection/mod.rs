//! Connection engine
//!
//! A [`Context`] owns one socket and everything negotiated over it: the
//! dialect and limits, the session and its tree ids, signing/sealing
//! state, the message id counter and credit pool, the output queue and the
//! table of outstanding commands keyed by message id. It never blocks and
//! never spawns anything; [`Context::service`] drives all I/O.

mod config;
mod events;
mod pdu;
mod recv;

pub use config::ContextConfig;
pub use events::{ChangeFd, ChangeFdCallback, ChangeEventsCallback, ConnectCallback, Events};
pub use pdu::{Completion, Pdu, PduCallback, PduId, Reply};
pub(crate) use pdu::{close_then, Chain};
pub(crate) use recv::RequestDispatcher;

use crate::auth::MessageCrypto;
use crate::error::{Error, Result};
use crate::protocol::messages::Smb2OplockBreak;
use crate::protocol::smb2_constants::{Capabilities, SecurityMode};
use bytes::BytesMut;
use socket2::Socket;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, error};
use uuid::Uuid;

/// Which end of the protocol this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    SessionSetup,
    TreeConnected,
    Active,
    Closing,
}

/// Callback for unsolicited oplock break notifications
pub type OplockBreakCallback = Box<dyn FnMut(&mut Context, Smb2OplockBreak)>;

/// One SMB2 connection
pub struct Context {
    pub(crate) config: ContextConfig,
    pub(crate) role: Role,
    pub(crate) state: ConnectionState,
    pub(crate) socket: Option<Socket>,
    pub(crate) connecting: Option<events::HappyEyeballs>,
    /// Host name the connect chain was given
    pub(crate) server: String,

    pub(crate) dialect: u16,
    pub(crate) server_capabilities: Capabilities,
    pub(crate) server_security_mode: SecurityMode,
    pub(crate) server_guid: Uuid,
    pub(crate) max_transact_size: u32,
    pub(crate) max_read_size: u32,
    pub(crate) max_write_size: u32,
    pub(crate) session_id: u64,
    tree_ids: Vec<u32>,
    current_tree: Option<u32>,

    pub(crate) signing: bool,
    pub(crate) sealing: bool,
    pub(crate) session_key: Option<Vec<u8>>,
    pub(crate) crypto: Option<Box<dyn MessageCrypto>>,

    pub(crate) next_message_id: u64,
    pub(crate) next_async_id: u64,
    pub(crate) credits: u16,
    pub(crate) outqueue: VecDeque<pdu::OutMessage>,
    pub(crate) pending: BTreeMap<u64, pdu::Pending>,
    pub(crate) recv_buf: BytesMut,

    error: String,
    opaque: Option<Box<dyn Any>>,
    pub(crate) oplock_break_cb: Option<OplockBreakCallback>,
    pub(crate) notifier: events::Notifier,
    pub(crate) dispatcher: Option<Box<dyn RequestDispatcher>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("dialect", &format_args!("0x{:04x}", self.dialect))
            .field("session_id", &self.session_id)
            .field("tree_ids", &self.tree_ids)
            .field("credits", &self.credits)
            .field("outstanding", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create an unconnected client context.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            role: Role::Client,
            state: ConnectionState::Disconnected,
            socket: None,
            connecting: None,
            server: String::new(),
            dialect: 0,
            server_capabilities: Capabilities::empty(),
            server_security_mode: SecurityMode::empty(),
            server_guid: Uuid::nil(),
            max_transact_size: 0,
            max_read_size: 0,
            max_write_size: 0,
            session_id: 0,
            tree_ids: Vec::new(),
            current_tree: None,
            signing: false,
            sealing: false,
            session_key: None,
            crypto: None,
            next_message_id: 0,
            next_async_id: 0,
            credits: 0,
            outqueue: VecDeque::new(),
            pending: BTreeMap::new(),
            recv_buf: BytesMut::with_capacity(64 * 1024),
            error: String::new(),
            opaque: None,
            oplock_break_cb: None,
            notifier: events::Notifier::default(),
            dispatcher: None,
        }
    }

    /// Wrap an accepted socket as the server end of a connection.
    pub(crate) fn accepted(
        stream: std::net::TcpStream,
        dispatcher: Box<dyn RequestDispatcher>,
    ) -> Result<Self> {
        let socket = Socket::from(stream);
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let mut ctx = Self::new(ContextConfig::default());
        ctx.role = Role::Server;
        ctx.state = ConnectionState::Negotiating;
        ctx.socket = Some(socket);
        ctx.dispatcher = Some(dispatcher);
        Ok(ctx)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Settings may only change while disconnected.
    pub fn config_mut(&mut self) -> Result<&mut ContextConfig> {
        if self.socket.is_some() || self.connecting.is_some() {
            return Err(Error::InvalidState(
                "configuration is fixed once connected".into(),
            ));
        }
        Ok(&mut self.config)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "connection state");
            self.state = state;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn dialect(&self) -> u16 {
        self.dialect
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_guid(&self) -> Uuid {
        self.config.client_guid
    }

    pub fn server_guid(&self) -> Uuid {
        self.server_guid
    }

    pub fn max_transact_size(&self) -> u32 {
        self.max_transact_size
    }

    pub fn max_read_size(&self) -> u32 {
        self.max_read_size
    }

    pub fn max_write_size(&self) -> u32 {
        self.max_write_size
    }

    pub fn credits(&self) -> u16 {
        self.credits
    }

    pub fn is_signing(&self) -> bool {
        self.signing
    }

    pub fn is_sealing(&self) -> bool {
        self.sealing
    }

    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    /// Last fatal or connect-chain error, human readable.
    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.error = msg.into();
        error!(error = %self.error, "connection error");
    }

    /// Attach caller data to the connection.
    pub fn set_opaque<T: Any>(&mut self, data: T) {
        self.opaque = Some(Box::new(data));
    }

    pub fn opaque<T: Any>(&self) -> Option<&T> {
        self.opaque.as_ref().and_then(|b| b.downcast_ref())
    }

    pub fn opaque_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.opaque.as_mut().and_then(|b| b.downcast_mut())
    }

    pub fn set_oplock_break_cb(
        &mut self,
        cb: impl FnMut(&mut Context, Smb2OplockBreak) + 'static,
    ) {
        self.oplock_break_cb = Some(Box::new(cb));
    }

    /// Tree id used by commands that do not override it.
    pub fn tree_id(&self) -> u32 {
        self.current_tree.unwrap_or(0)
    }

    /// Make a known tree id the current one.
    pub fn select_tree_id(&mut self, tree_id: u32) -> Result<()> {
        if !self.tree_ids.contains(&tree_id) {
            return Err(Error::InvalidParameter(format!(
                "tree id {} is not connected",
                tree_id
            )));
        }
        self.current_tree = Some(tree_id);
        Ok(())
    }

    /// Record a new tree connect and select it.
    pub fn connect_tree_id(&mut self, tree_id: u32) {
        if !self.tree_ids.contains(&tree_id) {
            self.tree_ids.push(tree_id);
        }
        self.current_tree = Some(tree_id);
    }

    /// Drop every tree id, as when the session they belong to ends.
    pub(crate) fn forget_trees(&mut self) {
        self.tree_ids.clear();
        self.current_tree = None;
    }

    /// Forget a tree id; the most recent remaining one becomes current.
    pub fn disconnect_tree_id(&mut self, tree_id: u32) -> Result<()> {
        let pos = self
            .tree_ids
            .iter()
            .position(|&t| t == tree_id)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("tree id {} is not connected", tree_id))
            })?;
        self.tree_ids.remove(pos);
        if self.current_tree == Some(tree_id) {
            self.current_tree = self.tree_ids.last().copied();
        }
        Ok(())
    }

    pub fn tree_ids(&self) -> &[u32] {
        &self.tree_ids
    }

    /// Install the signing/sealing provider for the session.
    pub fn set_crypto(&mut self, crypto: Box<dyn MessageCrypto>) {
        self.crypto = Some(crypto);
    }

    /// Close the socket but keep the context, ready for a new connect.
    ///
    /// Everything negotiated over the old socket goes: dialect, limits,
    /// session, tree ids, keys, the message id counter and credits.
    /// Outstanding commands are completed with a reset, since their message
    /// ids will be handed out again.
    pub fn close_context(&mut self) {
        let was_open = self.socket.is_some() || self.connecting.is_some();
        if was_open {
            self.set_state(ConnectionState::Closing);
        }
        self.socket = None;
        self.connecting = None;
        self.outqueue.clear();
        self.recv_buf.clear();
        self.reset_negotiated();
        if was_open {
            self.update_notifications();
        }
        self.set_state(ConnectionState::Disconnected);
        self.fail_all();
    }

    fn reset_negotiated(&mut self) {
        self.dialect = 0;
        self.server_capabilities = Capabilities::empty();
        self.server_security_mode = SecurityMode::empty();
        self.server_guid = Uuid::nil();
        self.max_transact_size = 0;
        self.max_read_size = 0;
        self.max_write_size = 0;
        self.session_id = 0;
        self.forget_trees();
        self.signing = false;
        self.sealing = false;
        self.session_key = None;
        self.crypto = None;
        self.next_message_id = 0;
        self.next_async_id = 0;
        self.credits = 0;
    }

    /// A connection-level failure: record it, drop the socket and fail
    /// every outstanding command with a reset.
    pub(crate) fn fatal(&mut self, err: &Error) {
        self.set_error(err.to_string());
        self.close_context();
    }

    /// Fail every outstanding command with a reset, in message id order.
    pub(crate) fn fail_all(&mut self) {
        while let Some((message_id, pending)) = self.pending.pop_first() {
            debug!(message_id, "failing outstanding command");
            (pending.callback)(self, Err(Error::ConnectionReset));
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.socket = None;
        self.connecting = None;
        self.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_id_table() {
        let mut ctx = Context::new(ContextConfig::default());
        assert_eq!(ctx.tree_id(), 0);
        ctx.connect_tree_id(5);
        ctx.connect_tree_id(9);
        assert_eq!(ctx.tree_id(), 9);
        ctx.select_tree_id(5).unwrap();
        assert_eq!(ctx.tree_id(), 5);
        assert!(ctx.select_tree_id(7).is_err());
        ctx.disconnect_tree_id(5).unwrap();
        assert_eq!(ctx.tree_id(), 9);
        assert!(ctx.disconnect_tree_id(5).is_err());
    }

    #[test]
    fn test_opaque_data() {
        let mut ctx = Context::new(ContextConfig::default());
        assert!(ctx.opaque::<u32>().is_none());
        ctx.set_opaque(41u32);
        *ctx.opaque_mut::<u32>().unwrap() += 1;
        assert_eq!(ctx.opaque::<u32>(), Some(&42));
        assert!(ctx.opaque::<String>().is_none());
    }

    #[test]
    fn test_close_context_forgets_the_old_connection() {
        let (ours, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut ctx = Context::new(ContextConfig::default());
        ctx.socket = Some(Socket::from(ours));
        ctx.state = ConnectionState::Active;
        ctx.dialect = 0x0302;
        ctx.server_capabilities = Capabilities::LARGE_MTU;
        ctx.max_read_size = 1 << 20;
        ctx.session_id = 0x3493_d9cf_a3f4_e775;
        ctx.connect_tree_id(7);
        ctx.signing = true;
        ctx.session_key = Some(vec![1; 16]);
        ctx.next_message_id = 6;
        ctx.credits = 30;
        ctx.set_opaque(5u8);

        ctx.close_context();
        assert!(!ctx.is_connected());
        assert_eq!(ctx.state(), ConnectionState::Disconnected);
        assert_eq!(ctx.dialect(), 0);
        assert_eq!(ctx.max_read_size(), 0);
        assert_eq!(ctx.session_id(), 0);
        assert!(ctx.tree_ids().is_empty());
        assert_eq!(ctx.tree_id(), 0);
        assert!(!ctx.is_signing());
        assert!(ctx.session_key().is_none());
        assert_eq!(ctx.next_message_id, 0);
        assert_eq!(ctx.credits(), 0);
        // caller data survives
        assert_eq!(ctx.opaque::<u8>(), Some(&5));
        assert!(ctx.config_mut().is_ok());
    }

    #[test]
    fn test_config_locked_while_connected() {
        let mut ctx = Context::new(ContextConfig::default());
        ctx.config_mut().unwrap().user = "bob".into();
        assert_eq!(ctx.config().user, "bob");
        assert_eq!(ctx.state(), ConnectionState::Disconnected);
    }
}
