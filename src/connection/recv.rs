//! Receive path: stream framing, decryption and reply/request dispatch

use super::{Context, Reply, Role};
use crate::error::{Error, NtStatus, Result};
use crate::protocol::header::{Smb2Header, TransformHeader};
use crate::protocol::messages::{
    decode_body, fixed_len_for, is_error_reply, reply_variable_len, Smb2OplockBreak,
};
use crate::protocol::smb2_constants::{
    structure_size, Smb2Command, Smb2HeaderFlags, NOTIFICATION_MESSAGE_ID, SMB1_MAGIC,
    SMB1_NEGOTIATE, SMB2_HEADER_SIZE, SMB2_MAX_PDU_SIZE, SMB2_SPL_SIZE, SMB2_TRANSFORM_MAGIC,
};
use bytes::{Buf, Bytes};
use std::io::{self, Read};
use tracing::{debug, trace, warn};

/// Server-side consumer of incoming requests.
pub(crate) trait RequestDispatcher {
    /// Handle one request link. Replies are queued on `ctx`.
    fn dispatch(&mut self, ctx: &mut Context, header: Smb2Header, body: Bytes) -> Result<()>;

    /// A legacy SMB1 NEGOTIATE arrived on a fresh connection.
    fn smb1_negotiate(&mut self, ctx: &mut Context) -> Result<()>;
}

impl Context {
    /// Drain the socket into the receive buffer. Returns true on EOF.
    pub(crate) fn read_available(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return Err(Error::NotConnected);
            };
            let mut socket = socket;
            match socket.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Process every complete stream message in the receive buffer.
    pub(crate) fn process_input(&mut self) -> Result<()> {
        while self.socket.is_some() && self.recv_buf.len() >= SMB2_SPL_SIZE {
            let len = u32::from_be_bytes([
                self.recv_buf[0],
                self.recv_buf[1],
                self.recv_buf[2],
                self.recv_buf[3],
            ]) as usize;
            if len > SMB2_MAX_PDU_SIZE {
                return Err(Error::InvalidHeader(format!(
                    "stream message of {} bytes exceeds the limit",
                    len
                )));
            }
            if self.recv_buf.len() < SMB2_SPL_SIZE + len {
                break;
            }
            self.recv_buf.advance(SMB2_SPL_SIZE);
            let segment = self.recv_buf.split_to(len).freeze();
            self.process_segment(segment)?;
        }
        Ok(())
    }

    fn process_segment(&mut self, segment: Bytes) -> Result<()> {
        if segment.len() < 4 {
            return Err(Error::InvalidHeader(format!(
                "{} byte stream message",
                segment.len()
            )));
        }
        if segment[..4] == SMB2_TRANSFORM_MAGIC {
            let plain = self.decrypt_segment(&segment)?;
            return self.process_links(plain, true);
        }
        if segment[..4] == SMB1_MAGIC {
            if self.role == Role::Server && segment.len() > 4 && segment[4] == SMB1_NEGOTIATE {
                return self.with_dispatcher(|d, ctx| d.smb1_negotiate(ctx));
            }
            return Err(Error::InvalidHeader("unexpected SMB1 message".into()));
        }
        self.process_links(segment, false)
    }

    fn decrypt_segment(&self, segment: &[u8]) -> Result<Bytes> {
        let transform = TransformHeader::parse(segment)?;
        let crypto = self
            .crypto
            .as_ref()
            .ok_or_else(|| Error::CryptoError("encrypted message without a session".into()))?;
        let plain = crypto.decrypt(
            &transform.nonce,
            &segment[20..TransformHeader::SIZE],
            &segment[TransformHeader::SIZE..],
            &transform.signature,
        )?;
        if plain.len() != transform.original_message_size as usize {
            return Err(Error::CryptoError(format!(
                "decrypted {} bytes, transform header announced {}",
                plain.len(),
                transform.original_message_size
            )));
        }
        Ok(Bytes::from(plain))
    }

    /// Walk the compound chain of one plain segment.
    fn process_links(&mut self, segment: Bytes, sealed: bool) -> Result<()> {
        let mut offset = 0;
        loop {
            let rest = segment.slice(offset..);
            let header = Smb2Header::parse(&rest)?;
            let next = header.next_command as usize;
            let link_len = if next == 0 {
                rest.len()
            } else if next < SMB2_HEADER_SIZE || next > rest.len() || next % 8 != 0 {
                return Err(Error::InvalidOffset(format!(
                    "next command offset {} in a {} byte chain",
                    next,
                    rest.len()
                )));
            } else {
                next
            };
            let link = rest.slice(..link_len);

            if !sealed && self.signing && header.flags.contains(Smb2HeaderFlags::SIGNED) {
                if let Some(crypto) = &self.crypto {
                    crypto.verify(&link)?;
                }
            }

            let body = link.slice(SMB2_HEADER_SIZE..);
            match self.role {
                Role::Client => self.handle_reply(header, body)?,
                Role::Server => self.with_dispatcher(|d, ctx| d.dispatch(ctx, header, body))?,
            }
            if next == 0 || self.socket.is_none() {
                return Ok(());
            }
            offset += next;
        }
    }

    fn with_dispatcher(
        &mut self,
        f: impl FnOnce(&mut dyn RequestDispatcher, &mut Context) -> Result<()>,
    ) -> Result<()> {
        let Some(mut dispatcher) = self.dispatcher.take() else {
            warn!("request received without a dispatcher");
            return Ok(());
        };
        let result = f(dispatcher.as_mut(), self);
        if self.dispatcher.is_none() {
            self.dispatcher = Some(dispatcher);
        }
        result
    }

    fn handle_reply(&mut self, header: Smb2Header, body: Bytes) -> Result<()> {
        self.credits = self.credits.saturating_add(header.credits);

        if header.message_id == NOTIFICATION_MESSAGE_ID
            && header.command == Smb2Command::OplockBreak
        {
            return self.handle_oplock_break(&body);
        }

        let message_id = header.message_id;
        let Some((command, prev)) = self.pending.get(&message_id).map(|p| (p.command, p.prev))
        else {
            debug!(
                message_id,
                command = header.command.name(),
                "dropping reply for unknown message id"
            );
            return Ok(());
        };

        if header.status == NtStatus::PENDING && header.is_async() {
            if let Some(pending) = self.pending.get_mut(&message_id) {
                pending.async_id = header.async_id();
            }
            trace!(message_id, async_id = ?header.async_id(), "interim reply");
            return Ok(());
        }
        if let Some(prev) = prev {
            if self.pending.contains_key(&prev) {
                return Err(Error::InvalidHeader(format!(
                    "reply to message {} arrived before its compound predecessor {}",
                    message_id, prev
                )));
            }
        }

        let Some(pending) = self.pending.remove(&message_id) else {
            return Ok(());
        };
        let result = validate_reply(command, &header, &body).and_then(|()| {
            if header.status.is_failure() {
                Err(Error::Status(header.status))
            } else {
                Ok(Reply {
                    header: header.clone(),
                    body,
                })
            }
        });
        trace!(
            message_id,
            command = command.name(),
            status = %header.status,
            "reply"
        );
        (pending.callback)(self, result);
        Ok(())
    }

    fn handle_oplock_break(&mut self, body: &[u8]) -> Result<()> {
        let notification = match decode_body::<Smb2OplockBreak>(body) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "ignoring malformed break notification");
                return Ok(());
            }
        };
        debug!(
            file_id = ?notification.file_id,
            level = notification.oplock_level,
            "oplock break"
        );
        if let Some(mut cb) = self.oplock_break_cb.take() {
            cb(self, notification);
            if self.oplock_break_cb.is_none() {
                self.oplock_break_cb = Some(cb);
            }
        }
        Ok(())
    }
}

/// Check a reply body against the command it answers: structure size of
/// the fixed part, then the variable part its offsets reference.
fn validate_reply(command: Smb2Command, header: &Smb2Header, body: &[u8]) -> Result<()> {
    if header.command != command {
        return Err(Error::InvalidHeader(format!(
            "{} reply to a {} request",
            header.command.name(),
            command.name()
        )));
    }
    let failed = header.status.is_failure();
    let expected = if is_error_reply(failed, body) {
        structure_size::ERROR_REPLY
    } else {
        command.reply_struct_size()
    };
    if body.len() < 2 {
        return Err(Error::BufferTooSmall {
            need: 2,
            have: body.len(),
        });
    }
    let found = u16::from_le_bytes([body[0], body[1]]);
    if found != expected {
        return Err(Error::StructureSize {
            command: command.name(),
            expected,
            found,
        });
    }
    let fixed = fixed_len_for(expected);
    if body.len() < fixed {
        return Err(Error::BufferTooSmall {
            need: fixed,
            have: body.len(),
        });
    }
    let variable = reply_variable_len(command, failed, &body[..fixed])?;
    if fixed + variable > body.len() {
        return Err(Error::InvalidOffset(format!(
            "{} reply references {} bytes past a {} byte body",
            command.name(),
            fixed + variable - body.len(),
            body.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{close_then, Chain, ContextConfig, Events, Pdu};
    use crate::protocol::header::HeaderIds;
    use crate::protocol::messages::{FileId, Smb2Echo, Smb2ErrorResponse, SmbMessage};
    use socket2::Socket;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;

    fn connected_client() -> (Context, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut ctx = Context::new(ContextConfig::default());
        ctx.socket = Some(Socket::from(ours));
        (ctx, peer)
    }

    fn read_request(peer: &mut UnixStream) -> Smb2Header {
        let mut len = [0u8; 4];
        peer.read_exact(&mut len).unwrap();
        let mut msg = vec![0u8; u32::from_be_bytes(len) as usize];
        peer.read_exact(&mut msg).unwrap();
        Smb2Header::parse(&msg).unwrap()
    }

    fn send_reply(peer: &mut UnixStream, request: &Smb2Header, status: NtStatus, body: &[u8]) {
        let mut header = Smb2Header::new(request.command);
        header.flags = Smb2HeaderFlags::SERVER_TO_REDIR;
        header.message_id = request.message_id;
        header.status = status;
        header.credits = 1;
        let mut msg = header.to_bytes();
        msg.extend_from_slice(body);
        peer.write_all(&(msg.len() as u32).to_be_bytes()).unwrap();
        peer.write_all(&msg).unwrap();
    }

    fn queue_echo(ctx: &mut Context, log: &Rc<RefCell<Vec<(u64, Result<Reply>)>>>, tag: u64) {
        let l = log.clone();
        let pdu = Pdu::new(&Smb2Echo, move |_, r| l.borrow_mut().push((tag, r))).unwrap();
        ctx.queue(pdu).unwrap();
    }

    fn pump(ctx: &mut Context, events: Events) -> Result<()> {
        let fd = ctx.socket.as_ref().unwrap().as_raw_fd();
        ctx.service_fd(fd, events)
    }

    #[test]
    fn test_out_of_order_replies_complete_by_message_id() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        queue_echo(&mut ctx, &log, 2);
        pump(&mut ctx, Events::WRITE).unwrap();

        let first = read_request(&mut peer);
        let second = read_request(&mut peer);
        assert_eq!(second.message_id, first.message_id + 1);

        let echo = Smb2Echo.to_bytes().unwrap();
        send_reply(&mut peer, &second, NtStatus::SUCCESS, &echo);
        send_reply(&mut peer, &first, NtStatus::SUCCESS, &echo);
        pump(&mut ctx, Events::READ).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, 2);
        assert_eq!(log[1].0, 1);
        assert!(log.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(ctx.outstanding(), 0);
        assert_eq!(ctx.credits(), 2);
    }

    #[test]
    fn test_failure_status_reaches_callback() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        pump(&mut ctx, Events::WRITE).unwrap();
        let req = read_request(&mut peer);

        let err = crate::protocol::messages::Smb2ErrorResponse::default()
            .to_bytes()
            .unwrap();
        send_reply(&mut peer, &req, NtStatus::ACCESS_DENIED, &err);
        pump(&mut ctx, Events::READ).unwrap();

        let log = log.borrow();
        assert!(matches!(
            log[0].1,
            Err(Error::Status(NtStatus::ACCESS_DENIED))
        ));
    }

    #[test]
    fn test_bad_structure_size_fails_only_that_command() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        pump(&mut ctx, Events::WRITE).unwrap();
        let req = read_request(&mut peer);

        send_reply(&mut peer, &req, NtStatus::SUCCESS, &[6, 0, 0, 0, 0, 0]);
        pump(&mut ctx, Events::READ).unwrap();

        assert!(matches!(
            log.borrow()[0].1,
            Err(Error::StructureSize { expected: 4, found: 6, .. })
        ));
        assert!(ctx.is_connected());
    }

    #[test]
    fn test_unknown_message_id_is_dropped() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        pump(&mut ctx, Events::WRITE).unwrap();
        let mut req = read_request(&mut peer);
        req.message_id += 40;

        send_reply(&mut peer, &req, NtStatus::SUCCESS, &Smb2Echo.to_bytes().unwrap());
        pump(&mut ctx, Events::READ).unwrap();
        assert!(log.borrow().is_empty());
        assert_eq!(ctx.outstanding(), 1);
    }

    #[test]
    fn test_interim_pending_keeps_command_outstanding() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        pump(&mut ctx, Events::WRITE).unwrap();
        let req = read_request(&mut peer);

        let mut interim = Smb2Header::new(Smb2Command::Echo);
        interim.flags = Smb2HeaderFlags::SERVER_TO_REDIR;
        interim.message_id = req.message_id;
        interim.status = NtStatus::PENDING;
        interim.set_async_id(77);
        let mut msg = interim.to_bytes();
        msg.extend_from_slice(
            &crate::protocol::messages::Smb2ErrorResponse::default()
                .to_bytes()
                .unwrap(),
        );
        peer.write_all(&(msg.len() as u32).to_be_bytes()).unwrap();
        peer.write_all(&msg).unwrap();
        pump(&mut ctx, Events::READ).unwrap();

        assert!(log.borrow().is_empty());
        assert_eq!(ctx.pending[&req.message_id].async_id, Some(77));

        send_reply(&mut peer, &req, NtStatus::SUCCESS, &Smb2Echo.to_bytes().unwrap());
        pump(&mut ctx, Events::READ).unwrap();
        assert!(log.borrow()[0].1.is_ok());
    }

    #[test]
    fn test_oversized_segment_resets_everything() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        queue_echo(&mut ctx, &log, 2);
        pump(&mut ctx, Events::WRITE).unwrap();

        peer.write_all(&(SMB2_MAX_PDU_SIZE as u32 + 1).to_be_bytes())
            .unwrap();
        assert!(pump(&mut ctx, Events::READ).is_err());
        assert!(!ctx.is_connected());
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert!(log
            .iter()
            .all(|(_, r)| matches!(r, Err(Error::ConnectionReset))));
    }

    #[test]
    fn test_peer_close_is_a_reset() {
        let (mut ctx, peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        drop(peer);
        assert!(pump(&mut ctx, Events::READ).is_err());
        assert!(matches!(log.borrow()[0].1, Err(Error::ConnectionReset)));
    }

    #[test]
    fn test_oplock_break_notification() {
        let (mut ctx, mut peer) = connected_client();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        ctx.set_oplock_break_cb(move |_, brk| *s.borrow_mut() = Some(brk.oplock_level));

        let mut header = Smb2Header::new(Smb2Command::OplockBreak);
        header.flags = Smb2HeaderFlags::SERVER_TO_REDIR;
        header.message_id = NOTIFICATION_MESSAGE_ID;
        let body = Smb2OplockBreak {
            oplock_level: 1,
            file_id: crate::protocol::messages::FileId::new(1, 2),
        }
        .to_bytes()
        .unwrap();
        let mut msg = header.to_bytes();
        msg.extend_from_slice(&body);
        peer.write_all(&(msg.len() as u32).to_be_bytes()).unwrap();
        peer.write_all(&msg).unwrap();
        pump(&mut ctx, Events::READ).unwrap();
        assert_eq!(*seen.borrow(), Some(1));
    }

    #[test]
    fn test_partial_segment_waits_for_rest() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        pump(&mut ctx, Events::WRITE).unwrap();
        let req = read_request(&mut peer);

        let mut header = Smb2Header::new(Smb2Command::Echo);
        header.flags = Smb2HeaderFlags::SERVER_TO_REDIR;
        header.message_id = req.message_id;
        let mut msg = header.to_bytes();
        msg.extend_from_slice(&Smb2Echo.to_bytes().unwrap());
        let mut framed = (msg.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&msg);

        peer.write_all(&framed[..30]).unwrap();
        pump(&mut ctx, Events::READ).unwrap();
        assert!(log.borrow().is_empty());
        peer.write_all(&framed[30..]).unwrap();
        pump(&mut ctx, Events::READ).unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_freed_command_never_completes() {
        let (mut ctx, mut peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let pdu = Pdu::new(&Smb2Echo, move |_, r| l.borrow_mut().push((1, r))).unwrap();
        let id = ctx.queue(pdu).unwrap();
        queue_echo(&mut ctx, &log, 2);
        pump(&mut ctx, Events::WRITE).unwrap();
        let first = read_request(&mut peer);
        let second = read_request(&mut peer);

        assert!(ctx.free(id));
        assert!(!ctx.free(id));
        let echo = Smb2Echo.to_bytes().unwrap();
        send_reply(&mut peer, &first, NtStatus::SUCCESS, &echo);
        send_reply(&mut peer, &second, NtStatus::SUCCESS, &echo);
        pump(&mut ctx, Events::READ).unwrap();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 2);
        assert_eq!(ctx.outstanding(), 0);
    }

    #[test]
    fn test_free_before_write_withdraws_the_message() {
        let (mut ctx, _peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let pdu = Pdu::new(&Smb2Echo, move |_, r| l.borrow_mut().push((1, r))).unwrap();
        let id = ctx.queue(pdu).unwrap();
        assert_eq!(ctx.outqueue.len(), 1);
        assert!(ctx.free(id));
        assert!(ctx.outqueue.is_empty());
        drop(ctx);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_drop_resets_each_outstanding_command_once() {
        let (mut ctx, _peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in 1..=3 {
            queue_echo(&mut ctx, &log, tag);
        }
        pump(&mut ctx, Events::WRITE).unwrap();
        assert_eq!(ctx.outstanding(), 3);
        drop(ctx);

        let log = log.borrow();
        assert_eq!(log.len(), 3);
        let tags: Vec<u64> = log.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert!(log
            .iter()
            .all(|(_, r)| matches!(r, Err(Error::ConnectionReset))));
    }

    #[test]
    fn test_close_context_resets_outstanding_commands() {
        let (mut ctx, _peer) = connected_client();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        queue_echo(&mut ctx, &log, 2);
        pump(&mut ctx, Events::WRITE).unwrap();
        ctx.close_context();
        assert_eq!(ctx.outstanding(), 0);
        assert_eq!(log.borrow().len(), 2);
        drop(ctx);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_timer_tick_times_out_once() {
        let (mut ctx, mut peer) = connected_client();
        ctx.config.timeout = Some(Duration::from_millis(1));
        let log = Rc::new(RefCell::new(Vec::new()));
        queue_echo(&mut ctx, &log, 1);
        pump(&mut ctx, Events::WRITE).unwrap();
        let req = read_request(&mut peer);

        std::thread::sleep(Duration::from_millis(10));
        ctx.service_fd(-1, Events::empty()).unwrap();
        ctx.service_fd(-1, Events::empty()).unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(matches!(log.borrow()[0].1, Err(Error::Timeout)));
        assert_eq!(ctx.outstanding(), 0);

        // the late reply has nobody waiting for it
        send_reply(&mut peer, &req, NtStatus::SUCCESS, &Smb2Echo.to_bytes().unwrap());
        pump(&mut ctx, Events::READ).unwrap();
        assert_eq!(log.borrow().len(), 1);
        assert!(ctx.is_connected());
    }

    #[test]
    fn test_close_then_failed_close_keeps_result() {
        let (mut ctx, mut peer) = connected_client();
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        let done = Chain::new(move |_, r: Result<&'static str>| *g.borrow_mut() = Some(r));
        close_then(&mut ctx, FileId::new(3, 4), Some(9), done, Ok("listed"));
        pump(&mut ctx, Events::WRITE).unwrap();

        let close = read_request(&mut peer);
        assert_eq!(close.command, Smb2Command::Close);
        assert!(matches!(close.ids, HeaderIds::Sync { tree_id: 9, .. }));
        assert!(got.borrow().is_none());

        let err = Smb2ErrorResponse::default().to_bytes().unwrap();
        send_reply(&mut peer, &close, NtStatus::FILE_CLOSED, &err);
        pump(&mut ctx, Events::READ).unwrap();
        assert!(matches!(got.borrow_mut().take(), Some(Ok("listed"))));
        assert_eq!(ctx.outstanding(), 0);
    }
}
