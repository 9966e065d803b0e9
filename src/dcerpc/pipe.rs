//! Named pipe transport for DCE/RPC calls

use super::ndr::{NdrCoder, NdrDecoder, NdrEncoder};
use super::packet::{
    Bind, ContextElement, PacketBody, Reassembly, Request, RpcPacket, MAX_FRAG, RPC_HEADER_LEN,
};
use super::{ack_result, interfaces, Ndr, SyntaxId, NDR32_CONTEXT_ID, NDR64_CONTEXT_ID};
use crate::connection::{Chain, Context, Pdu, PduId};
use crate::error::{Error, Result};
use crate::protocol::messages::{
    FileId, Smb2CloseRequest, Smb2CreateRequest, Smb2CreateResponse, Smb2IoctlRequest,
    Smb2IoctlResponse, Smb2ReadRequest, Smb2ReadResponse,
};
use crate::protocol::smb2_constants::{
    fsctl, CreateDisposition, DesiredAccess, ShareAccess, IOCTL_IS_FSCTL,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace};

/// Request header plus alloc_hint, context id and opnum
const REQUEST_HEADER_LEN: usize = RPC_HEADER_LEN + 8;

#[derive(Debug)]
struct PipeState {
    file_id: FileId,
    tree_id: u32,
    call_id: u32,
    context_id: Option<u16>,
    ndr64: bool,
    /// Largest fragment the server accepts
    max_xmit_frag: u16,
}

/// An open pipe on the `IPC$` tree. Clones refer to the same pipe.
#[derive(Debug, Clone)]
pub struct RpcPipe(Rc<RefCell<PipeState>>);

impl RpcPipe {
    fn new(file_id: FileId, tree_id: u32) -> Self {
        RpcPipe(Rc::new(RefCell::new(PipeState {
            file_id,
            tree_id,
            // call id 1 is the bind
            call_id: 1,
            context_id: None,
            ndr64: false,
            max_xmit_frag: MAX_FRAG,
        })))
    }

    pub fn file_id(&self) -> FileId {
        self.0.borrow().file_id
    }

    pub fn tree_id(&self) -> u32 {
        self.0.borrow().tree_id
    }

    /// Presentation context accepted by the last bind.
    pub fn context_id(&self) -> Option<u16> {
        self.0.borrow().context_id
    }

    pub fn is_ndr64(&self) -> bool {
        self.0.borrow().ndr64
    }

    fn next_call_id(&self) -> u32 {
        let mut state = self.0.borrow_mut();
        let id = state.call_id;
        state.call_id = state.call_id.wrapping_add(1).max(1);
        id
    }

    /// Bind the pipe to `interface`, offering the transfer syntaxes the
    /// context is configured for. The first accepted context wins.
    pub fn bind_async(
        &self,
        ctx: &mut Context,
        interface: &SyntaxId,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<()> {
        let mut contexts = Vec::new();
        if ctx.config().ndr != Ndr::Ndr64 {
            contexts.push(ContextElement {
                context_id: NDR32_CONTEXT_ID,
                abstract_syntax: *interface,
                transfer_syntaxes: vec![interfaces::NDR32],
            });
        }
        if ctx.config().ndr != Ndr::Ndr32 {
            contexts.push(ContextElement {
                context_id: NDR64_CONTEXT_ID,
                abstract_syntax: *interface,
                transfer_syntaxes: vec![interfaces::NDR64],
            });
        }
        let call_id = self.next_call_id();
        let packet = RpcPacket::new(
            call_id,
            PacketBody::Bind(Bind {
                max_xmit_frag: MAX_FRAG,
                max_recv_frag: MAX_FRAG,
                assoc_group_id: 0,
                contexts: contexts.clone(),
            }),
        );
        let pipe = self.clone();
        self.transceive(ctx, packet.encode()?, call_id, move |ctx, result| {
            let result = result.and_then(|packet| pipe.bound(packet, &contexts));
            callback(ctx, result)
        })?;
        Ok(())
    }

    fn bound(&self, packet: RpcPacket, offered: &[ContextElement]) -> Result<()> {
        let ack = match packet.body {
            PacketBody::BindAck(ack) => ack,
            PacketBody::BindNak(nak) => {
                return Err(Error::Rpc(format!("bind rejected, reason {}", nak.reason)))
            }
            other => {
                return Err(Error::Rpc(format!(
                    "unexpected {:?} in reply to bind",
                    other.packet_type()
                )))
            }
        };
        let accepted = ack
            .results
            .iter()
            .zip(offered)
            .find(|(res, _)| res.result == ack_result::ACCEPTANCE)
            .ok_or_else(|| Error::Rpc("no presentation context accepted".into()))?;
        let mut state = self.0.borrow_mut();
        state.context_id = Some(accepted.1.context_id);
        state.ndr64 = accepted.0.transfer_syntax == interfaces::NDR64;
        state.max_xmit_frag = ack.max_recv_frag.min(MAX_FRAG);
        debug!(
            context_id = accepted.1.context_id,
            ndr64 = state.ndr64,
            address = %ack.secondary_address,
            "pipe bound"
        );
        Ok(())
    }

    /// Invoke `opnum` with `request` and decode the reply stub as `Rep`.
    pub fn call_async<Req, Rep>(
        &self,
        ctx: &mut Context,
        opnum: u16,
        request: &Req,
        callback: impl FnOnce(&mut Context, Result<Rep>) + 'static,
    ) -> Result<()>
    where
        Req: NdrCoder,
        Rep: NdrCoder + 'static,
    {
        let (context_id, ndr64, max_frag) = {
            let state = self.0.borrow();
            let context_id = state
                .context_id
                .ok_or_else(|| Error::InvalidState("pipe is not bound".into()))?;
            (context_id, state.ndr64, state.max_xmit_frag as usize)
        };
        let mut enc = NdrEncoder::new(ndr64);
        request.encode(&mut enc)?;
        let stub = enc.into_bytes();
        if REQUEST_HEADER_LEN + stub.len() > max_frag {
            return Err(Error::NotSupported(format!(
                "request stub of {} bytes needs fragmenting",
                stub.len()
            )));
        }
        let call_id = self.next_call_id();
        trace!(call_id, opnum, len = stub.len(), "rpc request");
        let packet = RpcPacket::new(
            call_id,
            PacketBody::Request(Request {
                context_id,
                opnum,
                stub,
            }),
        );
        self.transceive(ctx, packet.encode()?, call_id, move |ctx, result| {
            let result = result.and_then(|packet| match packet.body {
                PacketBody::Response(rsp) => {
                    let mut dec = NdrDecoder::new(&rsp.stub, ndr64);
                    Rep::decode(&mut dec)
                }
                PacketBody::Fault(fault) => {
                    Err(Error::Rpc(format!("fault 0x{:08x}", fault.status)))
                }
                other => Err(Error::Rpc(format!(
                    "unexpected {:?} in reply to request",
                    other.packet_type()
                ))),
            });
            callback(ctx, result)
        })?;
        Ok(())
    }

    /// Send one PDU and collect the reply, reading from the pipe while the
    /// server reports more data.
    fn transceive(
        &self,
        ctx: &mut Context,
        data: Vec<u8>,
        call_id: u32,
        callback: impl FnOnce(&mut Context, Result<RpcPacket>) + 'static,
    ) -> Result<PduId> {
        let (file_id, tree_id) = {
            let state = self.0.borrow();
            (state.file_id, state.tree_id)
        };
        let mut req = Smb2IoctlRequest::new(fsctl::PIPE_TRANSCEIVE, file_id, IOCTL_IS_FSCTL, data);
        req.max_output_response = MAX_FRAG as u32;
        let mut reassembly = Reassembly::new(call_id);
        let pipe = self.clone();
        let mut pdu = Pdu::new(&req, move |ctx, result| {
            let fed = result
                .and_then(|reply| reply.decode::<Smb2IoctlResponse>())
                .and_then(|rep| reassembly.feed(&rep.output));
            match fed {
                Ok(Some(packet)) => callback(ctx, Ok(packet)),
                Ok(None) => pipe.read_more(ctx, reassembly, Box::new(callback)),
                Err(e) => callback(ctx, Err(e)),
            }
        })?;
        pdu.set_tree_id(tree_id);
        ctx.queue(pdu)
    }

    fn read_more(
        &self,
        ctx: &mut Context,
        mut reassembly: Reassembly,
        callback: Box<dyn FnOnce(&mut Context, Result<RpcPacket>)>,
    ) {
        let (file_id, tree_id) = {
            let state = self.0.borrow();
            (state.file_id, state.tree_id)
        };
        let done = Chain::new(callback);
        let next = done.clone();
        let pipe = self.clone();
        done.step(ctx, move |ctx| {
            let req = Smb2ReadRequest::new(file_id, 0, MAX_FRAG as u32);
            let mut pdu = Pdu::new(&req, move |ctx, result| {
                let fed = result
                    .and_then(|reply| reply.decode::<Smb2ReadResponse>())
                    .and_then(|rep| reassembly.feed(&rep.data));
                match fed {
                    Ok(Some(packet)) => next.finish(ctx, Ok(packet)),
                    Ok(None) => pipe.read_more(
                        ctx,
                        reassembly,
                        Box::new(move |ctx, result| next.finish(ctx, result)),
                    ),
                    Err(e) => next.finish(ctx, Err(e)),
                }
            })?;
            pdu.set_tree_id(tree_id);
            ctx.queue(pdu).map(|_| ())
        });
    }

    pub fn close_async(
        &self,
        ctx: &mut Context,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<PduId> {
        let (file_id, tree_id) = {
            let state = self.0.borrow();
            (state.file_id, state.tree_id)
        };
        let mut pdu = Pdu::new(&Smb2CloseRequest::new(file_id), move |ctx, result| {
            callback(ctx, result.map(|_| ()))
        })?;
        pdu.set_tree_id(tree_id);
        ctx.queue(pdu)
    }
}

impl Context {
    /// Open the named pipe `name` (without the `\PIPE\` prefix) on the
    /// current tree, which should be `IPC$`.
    pub fn dcerpc_open_async(
        &mut self,
        name: &str,
        callback: impl FnOnce(&mut Context, Result<RpcPipe>) + 'static,
    ) -> Result<PduId> {
        let mut req = Smb2CreateRequest::new(name);
        req.desired_access = DesiredAccess::FILE_READ_DATA
            | DesiredAccess::FILE_WRITE_DATA
            | DesiredAccess::FILE_APPEND_DATA
            | DesiredAccess::FILE_READ_EA
            | DesiredAccess::FILE_WRITE_EA
            | DesiredAccess::FILE_READ_ATTRIBUTES
            | DesiredAccess::FILE_WRITE_ATTRIBUTES
            | DesiredAccess::READ_CONTROL
            | DesiredAccess::SYNCHRONIZE;
        req.share_access = ShareAccess::READ | ShareAccess::WRITE | ShareAccess::DELETE;
        req.create_disposition = CreateDisposition::Open;
        let tree_id = self.tree_id();
        let pipe_name = name.to_string();
        let pdu = Pdu::new(&req, move |ctx, result| {
            let result = result
                .and_then(|reply| reply.decode::<Smb2CreateResponse>())
                .map(|rep| {
                    debug!(pipe = %pipe_name, tree_id, "pipe opened");
                    RpcPipe::new(rep.file_id, tree_id)
                });
            callback(ctx, result)
        })?;
        self.queue(pdu)
    }
}
