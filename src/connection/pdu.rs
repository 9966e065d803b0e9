//! PDU construction, message ids, credits and the output queue

use super::{Context, Role};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::cursor::WriteBuf;
use crate::protocol::header::{HeaderIds, Smb2Header, TransformHeader};
use crate::protocol::messages::{decode_body, FileId, Smb2CloseRequest, SmbMessage};
use crate::protocol::smb2_constants::{
    dialect, Capabilities, Smb2Command, Smb2HeaderFlags, MAX_CREDITS, SMB2_CREDIT_UNIT,
    SMB2_HEADER_SIZE, SMB2_MAX_PDU_SIZE,
};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Completion callback of one command.
///
/// Failure statuses arrive as `Err(Error::Status(..))`; success,
/// informational and warning statuses arrive as `Ok`.
pub type PduCallback = Box<dyn FnOnce(&mut Context, Result<Reply>)>;

/// A received reply: its header and the whole body of its link.
#[derive(Debug, Clone)]
pub struct Reply {
    pub header: Smb2Header,
    pub body: Bytes,
}

impl Reply {
    pub fn status(&self) -> NtStatus {
        self.header.status
    }

    pub fn decode<T: SmbMessage>(&self) -> Result<T> {
        decode_body(&self.body)
    }
}

/// Handle of a queued PDU chain, usable to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PduId(pub(crate) u64);

impl PduId {
    /// Message id of the first command of the chain.
    pub fn message_id(self) -> u64 {
        self.0
    }
}

struct PduLink {
    header: Smb2Header,
    body: Vec<u8>,
    payload: usize,
    tree_id: Option<u32>,
    callback: PduCallback,
}

/// One command, or a compound chain of commands sharing a transmission.
pub struct Pdu {
    links: Vec<PduLink>,
}

impl Pdu {
    pub fn new<T, F>(msg: &T, callback: F) -> Result<Self>
    where
        T: SmbMessage,
        F: FnOnce(&mut Context, Result<Reply>) + 'static,
    {
        Ok(Self {
            links: vec![PduLink {
                header: Smb2Header::new(T::COMMAND),
                body: msg.to_bytes()?,
                payload: msg.payload_size(),
                tree_id: None,
                callback: Box::new(callback),
            }],
        })
    }

    /// Chain `next` after this PDU; its commands become related operations.
    pub fn add_compound(&mut self, next: Pdu) {
        for mut link in next.links {
            link.header.flags |= Smb2HeaderFlags::RELATED_OPERATIONS;
            self.links.push(link);
        }
    }

    /// Send every command of the chain to this tree instead of the
    /// selected one.
    pub fn set_tree_id(&mut self, tree_id: u32) {
        for link in &mut self.links {
            link.tree_id = Some(tree_id);
        }
    }

    pub fn command(&self) -> Smb2Command {
        self.links[0].header.command
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Completion callback of a multi-step operation.
pub type Completion<T> = Box<dyn FnOnce(&mut Context, Result<T>)>;

/// The user callback of an operation spanning several PDUs. Every step
/// holds a clone; whichever step ends the operation fires it, once.
pub(crate) struct Chain<T>(Rc<RefCell<Option<Completion<T>>>>);

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Chain(self.0.clone())
    }
}

impl<T: 'static> Chain<T> {
    pub(crate) fn new(callback: impl FnOnce(&mut Context, Result<T>) + 'static) -> Self {
        Chain(Rc::new(RefCell::new(Some(Box::new(callback)))))
    }

    pub(crate) fn finish(&self, ctx: &mut Context, result: Result<T>) {
        let callback = self.0.borrow_mut().take();
        if let Some(callback) = callback {
            callback(ctx, result);
        }
    }

    /// Run the next step; if it cannot even be queued, the operation ends
    /// with that error.
    pub(crate) fn step(&self, ctx: &mut Context, f: impl FnOnce(&mut Context) -> Result<()>) {
        if let Err(e) = f(ctx) {
            self.finish(ctx, Err(e));
        }
    }
}

/// Close `file_id`, then end `done` with `result`. The CLOSE goes to
/// `tree_id`, or the current tree when `None`. A failed close is logged and
/// never replaces `result`.
pub(crate) fn close_then<T: 'static>(
    ctx: &mut Context,
    file_id: FileId,
    tree_id: Option<u32>,
    done: Chain<T>,
    result: Result<T>,
) {
    let slot = Rc::new(RefCell::new(Some(result)));
    let pending = slot.clone();
    let next = done.clone();
    let sent = Pdu::new(&Smb2CloseRequest::new(file_id), move |ctx, closed| {
        if let Err(e) = closed {
            warn!(error = %e, "close failed");
        }
        if let Some(result) = pending.borrow_mut().take() {
            next.finish(ctx, result);
        }
    })
    .and_then(|mut pdu| {
        if let Some(tree_id) = tree_id {
            pdu.set_tree_id(tree_id);
        }
        ctx.queue(pdu)
    });
    if let Err(e) = sent {
        warn!(error = %e, "close not sent");
        if let Some(result) = slot.borrow_mut().take() {
            done.finish(ctx, result);
        }
    }
}

/// Outstanding command, keyed by message id in [`Context::pending`].
pub(crate) struct Pending {
    pub command: Smb2Command,
    pub callback: PduCallback,
    pub deadline: Option<Instant>,
    /// First message id of the chain this command was queued in
    pub chain_head: u64,
    /// Previous link of the chain, which must complete first
    pub prev: Option<u64>,
    pub async_id: Option<u64>,
}

/// A fully encoded stream message waiting for the socket.
pub(crate) struct OutMessage {
    pub data: Vec<u8>,
    pub written: usize,
    pub charge: u16,
    pub chain_head: Option<u64>,
}

fn aligned(len: usize) -> usize {
    (len + 7) & !7
}

impl Context {
    /// Whether a command may be charged more than one credit.
    pub(crate) fn supports_multi_credit(&self) -> bool {
        self.dialect > dialect::SMB2_02
            && self.server_capabilities.contains(Capabilities::LARGE_MTU)
    }

    /// Credit charge of a command moving `payload` bytes.
    pub(crate) fn credit_charge(&self, command: Smb2Command, payload: usize) -> u16 {
        if command == Smb2Command::Negotiate || self.dialect <= dialect::SMB2_02 {
            return 0;
        }
        if !self.supports_multi_credit() {
            return 1;
        }
        let units = (payload + SMB2_CREDIT_UNIT - 1) / SMB2_CREDIT_UNIT;
        units.clamp(1, u16::MAX as usize) as u16
    }

    fn credit_gated(&self) -> bool {
        self.role == Role::Client && self.dialect > dialect::SMB2_02
    }

    /// Whether the message at the head of the output queue may be written.
    pub(crate) fn head_sendable(&self) -> bool {
        match self.outqueue.front() {
            None => false,
            Some(msg) => msg.written > 0 || !self.credit_gated() || msg.charge <= self.credits,
        }
    }

    /// Assign message ids and credits to a PDU chain, encode it and append
    /// it to the output queue.
    pub fn queue(&mut self, pdu: Pdu) -> Result<PduId> {
        if self.socket.is_none() {
            return Err(Error::NotConnected);
        }
        if pdu.is_empty() {
            return Err(Error::InvalidParameter("empty PDU".into()));
        }

        let chain_head = self.next_message_id;
        let count = pdu.links.len();
        let mut wire = WriteBuf::new();
        let mut spans = Vec::with_capacity(count);
        let mut entries = Vec::with_capacity(count);
        let mut total_charge: u16 = 0;
        let mut prev = None;
        let deadline = self.config.timeout.map(|t| Instant::now() + t);

        for (i, link) in pdu.links.into_iter().enumerate() {
            let PduLink {
                mut header,
                body,
                payload,
                tree_id,
                callback,
            } = link;
            let command = header.command;
            let charge = self.credit_charge(command, payload);
            let message_id = self.next_message_id;
            self.next_message_id += charge.max(1) as u64;

            header.message_id = message_id;
            header.credit_charge = charge;
            header.credits = charge
                .max(1)
                .max(MAX_CREDITS.saturating_sub(self.credits));
            header.session_id = if command == Smb2Command::Negotiate {
                0
            } else {
                self.session_id
            };
            header.set_tree_id(if command.uses_tree_id() {
                tree_id.unwrap_or_else(|| self.tree_id())
            } else {
                0
            });
            if self.signs(command) {
                header.flags |= Smb2HeaderFlags::SIGNED;
            }

            let start = wire.len();
            let link_len = SMB2_HEADER_SIZE + body.len();
            header.next_command = if i + 1 < count {
                aligned(link_len) as u32
            } else {
                0
            };
            header.encode(&mut wire);
            wire.put_bytes(&body);
            if i + 1 < count {
                wire.put_zeros(aligned(link_len) - link_len);
            }
            spans.push((start, wire.len(), command));

            trace!(
                message_id,
                command = command.name(),
                credit_charge = charge,
                "queueing command"
            );
            entries.push((
                message_id,
                Pending {
                    command,
                    callback,
                    deadline,
                    chain_head,
                    prev,
                    async_id: None,
                },
            ));
            prev = Some(message_id);
            total_charge = total_charge.saturating_add(charge);
        }

        let mut data = wire.into_inner();
        if data.len() > SMB2_MAX_PDU_SIZE {
            return Err(Error::InvalidParameter(format!(
                "PDU of {} bytes exceeds the stream limit",
                data.len()
            )));
        }
        if let Some(crypto) = &self.crypto {
            for &(start, end, command) in &spans {
                if self.signs(command) {
                    crypto.sign(&mut data[start..end])?;
                }
            }
        }
        let seal = spans.iter().all(|&(_, _, c)| self.seals(c));
        let data = if seal { self.seal(data)? } else { data };

        for (message_id, pending) in entries {
            self.pending.insert(message_id, pending);
        }
        self.push_message(data, total_charge, Some(chain_head));
        debug!(
            message_id = chain_head,
            commands = count,
            credit_charge = total_charge,
            "queued PDU"
        );
        Ok(PduId(chain_head))
    }

    /// Cancel a queued PDU chain. Its callbacks are never invoked; it is
    /// also withdrawn from the output queue if no byte of it was written.
    pub fn free(&mut self, id: PduId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.chain_head != id.0);
        let removed = before != self.pending.len();
        if let Some(pos) = self
            .outqueue
            .iter()
            .position(|m| m.chain_head == Some(id.0) && m.written == 0)
        {
            self.outqueue.remove(pos);
        }
        if removed {
            debug!(message_id = id.0, "cancelled PDU");
            self.update_notifications();
        }
        removed
    }

    /// Number of commands waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Fail every command whose deadline has passed.
    pub fn timeout_sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(&mid, _)| mid)
            .collect();
        for message_id in expired {
            if let Some(pending) = self.pending.remove(&message_id) {
                warn!(
                    message_id,
                    command = pending.command.name(),
                    "command timed out"
                );
                (pending.callback)(self, Err(Error::Timeout));
            }
        }
    }

    /// Send a reply to `request` (server role). Each reply is its own
    /// stream message; credits granted are what the client asked for.
    pub fn send_reply(
        &mut self,
        request: &Smb2Header,
        status: NtStatus,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut header = self.reply_header(request, status);
        if let Some(async_id) = request.async_id() {
            header.set_async_id(async_id);
        }
        self.send_reply_header(header, body)
    }

    /// Send an interim PENDING reply and return the async id the final
    /// reply must carry (see [`Context::send_async_reply`]).
    pub fn send_pending_reply(&mut self, request: &Smb2Header) -> Result<u64> {
        self.next_async_id += 1;
        let async_id = self.next_async_id;
        let mut header = self.reply_header(request, NtStatus::PENDING);
        header.set_async_id(async_id);
        let body = crate::protocol::messages::Smb2ErrorResponse::default().to_bytes()?;
        self.send_reply_header(header, body)?;
        Ok(async_id)
    }

    pub fn send_async_reply(
        &mut self,
        request: &Smb2Header,
        async_id: u64,
        status: NtStatus,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut header = self.reply_header(request, status);
        header.set_async_id(async_id);
        header.credits = 0;
        self.send_reply_header(header, body)
    }

    fn reply_header(&self, request: &Smb2Header, status: NtStatus) -> Smb2Header {
        let mut header = Smb2Header::new(request.command);
        header.status = status;
        header.credit_charge = request.credit_charge;
        header.credits = request.credits.max(1);
        header.flags = Smb2HeaderFlags::SERVER_TO_REDIR;
        header.message_id = request.message_id;
        header.session_id = if self.session_id != 0 {
            self.session_id
        } else {
            request.session_id
        };
        if let HeaderIds::Sync {
            process_id,
            tree_id,
        } = request.ids
        {
            header.ids = HeaderIds::Sync {
                process_id,
                tree_id,
            };
        }
        header
    }

    fn send_reply_header(&mut self, mut header: Smb2Header, body: Vec<u8>) -> Result<()> {
        if self.socket.is_none() {
            return Err(Error::NotConnected);
        }
        let command = header.command;
        if self.signs(command) {
            header.flags |= Smb2HeaderFlags::SIGNED;
        }
        let mut w = WriteBuf::with_capacity(SMB2_HEADER_SIZE + body.len());
        header.encode(&mut w);
        w.put_bytes(&body);
        let mut data = w.into_inner();
        if let (true, Some(crypto)) = (self.signs(command), &self.crypto) {
            crypto.sign(&mut data)?;
        }
        let data = if self.seals(command) {
            self.seal(data)?
        } else {
            data
        };
        trace!(
            message_id = header.message_id,
            command = command.name(),
            status = %header.status,
            "queueing reply"
        );
        self.push_message(data, 0, None);
        Ok(())
    }

    fn signs(&self, command: Smb2Command) -> bool {
        self.signing
            && !self.sealing
            && !matches!(command, Smb2Command::Negotiate | Smb2Command::SessionSetup)
    }

    fn seals(&self, command: Smb2Command) -> bool {
        self.sealing && !matches!(command, Smb2Command::Negotiate | Smb2Command::SessionSetup)
    }

    fn seal(&self, plain: Vec<u8>) -> Result<Vec<u8>> {
        let crypto = self
            .crypto
            .as_ref()
            .ok_or_else(|| Error::CryptoError("sealing without a crypto provider".into()))?;
        let mut transform = TransformHeader::new(self.session_id, plain.len() as u32);
        transform.nonce = rand::random();
        let mut aad = WriteBuf::with_capacity(TransformHeader::SIZE);
        transform.encode(&mut aad);
        let (cipher, signature) = crypto.encrypt(&transform.nonce, &aad.as_slice()[20..], &plain)?;
        transform.signature = signature;
        let mut w = WriteBuf::with_capacity(TransformHeader::SIZE + cipher.len());
        transform.encode(&mut w);
        w.put_bytes(&cipher);
        Ok(w.into_inner())
    }

    fn push_message(&mut self, message: Vec<u8>, charge: u16, chain_head: Option<u64>) {
        let mut data = Vec::with_capacity(4 + message.len());
        data.extend_from_slice(&(message.len() as u32).to_be_bytes());
        data.extend_from_slice(&message);
        self.outqueue.push_back(OutMessage {
            data,
            written: 0,
            charge,
            chain_head,
        });
        self.update_notifications();
    }

    /// Write as much of the output queue as the socket accepts.
    pub(crate) fn flush_outqueue(&mut self) -> Result<()> {
        while self.head_sendable() {
            let gated = self.credit_gated();
            let Some(socket) = self.socket.as_ref() else {
                return Err(Error::NotConnected);
            };
            let Some(msg) = self.outqueue.front_mut() else {
                break;
            };
            if msg.written == 0 && gated {
                self.credits -= msg.charge;
            }
            match socket.send(&msg.data[msg.written..]) {
                Ok(n) => {
                    msg.written += n;
                    if msg.written == msg.data.len() {
                        self.outqueue.pop_front();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if msg.written == 0 && gated {
                        self.credits += msg.charge;
                    }
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if msg.written == 0 && gated {
                        self.credits += msg.charge;
                    }
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ContextConfig;
    use crate::protocol::messages::{Smb2Echo, Smb2ReadRequest, FileId};

    #[test]
    fn test_credit_charge_rules() {
        let mut ctx = Context::new(ContextConfig::default());
        assert_eq!(ctx.credit_charge(Smb2Command::Read, 1 << 20), 0);
        ctx.dialect = dialect::SMB2_02;
        assert_eq!(ctx.credit_charge(Smb2Command::Read, 1 << 20), 0);
        ctx.dialect = dialect::SMB3_02;
        assert_eq!(ctx.credit_charge(Smb2Command::Read, 1 << 20), 1);
        ctx.server_capabilities = Capabilities::LARGE_MTU;
        assert_eq!(ctx.credit_charge(Smb2Command::Negotiate, 0), 0);
        assert_eq!(ctx.credit_charge(Smb2Command::Echo, 0), 1);
        assert_eq!(ctx.credit_charge(Smb2Command::Read, 65536), 1);
        assert_eq!(ctx.credit_charge(Smb2Command::Read, 65537), 2);
        assert_eq!(ctx.credit_charge(Smb2Command::Read, 1 << 20), 16);
    }

    #[test]
    fn test_close_then_unsent_keeps_result() {
        let mut ctx = Context::new(ContextConfig::default());
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        let done = Chain::new(move |_, r: Result<u32>| *g.borrow_mut() = Some(r));
        close_then(&mut ctx, FileId::new(1, 2), Some(7), done, Ok(42));
        assert!(matches!(got.borrow_mut().take(), Some(Ok(42))));
    }

    #[test]
    fn test_queue_requires_socket() {
        let mut ctx = Context::new(ContextConfig::default());
        let pdu = Pdu::new(&Smb2Echo, |_, _| {}).unwrap();
        assert!(matches!(ctx.queue(pdu), Err(Error::NotConnected)));
    }

    #[test]
    fn test_compound_marks_related() {
        let mut pdu = Pdu::new(&Smb2Echo, |_, _| {}).unwrap();
        pdu.add_compound(
            Pdu::new(&Smb2ReadRequest::new(FileId::COMPOUND, 0, 10), |_, _| {}).unwrap(),
        );
        assert_eq!(pdu.len(), 2);
        assert!(!pdu.links[0]
            .header
            .flags
            .contains(Smb2HeaderFlags::RELATED_OPERATIONS));
        assert!(pdu.links[1]
            .header
            .flags
            .contains(Smb2HeaderFlags::RELATED_OPERATIONS));
        assert_eq!(pdu.links[1].payload, 10);
    }
}
