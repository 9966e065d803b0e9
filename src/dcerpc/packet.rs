//! Connection-oriented DCE/RPC PDUs

use super::{
    PacketFlags, PacketType, SyntaxId, DCERPC_VERSION_MAJOR, DCERPC_VERSION_MINOR,
};
use crate::error::{Error, Result};
use crate::protocol::cursor::{ReadCursor, WriteBuf};
use std::convert::TryFrom;
use uuid::Uuid;

pub const RPC_HEADER_LEN: usize = 16;

/// Fragment size offered in binds, both directions
pub const MAX_FRAG: u16 = 32768;

/// Largest reassembled stub accepted from a peer
pub const MAX_ALLOC_HINT: u32 = 16 * 1024 * 1024;

/// Little-endian integers, ASCII characters, IEEE floats
const DREP_LE: [u8; 4] = [0x10, 0, 0, 0];

/// Common header of every PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl RpcHeader {
    pub fn read(cur: &mut ReadCursor<'_>) -> Result<Self> {
        let major = cur.u8()?;
        let minor = cur.u8()?;
        if major != DCERPC_VERSION_MAJOR || minor != DCERPC_VERSION_MINOR {
            return Err(Error::Rpc(format!("unsupported version {}.{}", major, minor)));
        }
        let packet_type = PacketType::try_from(cur.u8()?)?;
        let flags = PacketFlags::from_bits_retain(cur.u8()?);
        let drep: [u8; 4] = cur.array()?;
        if drep[0] & 0xf0 != DREP_LE[0] {
            return Err(Error::Rpc("big-endian data representation".into()));
        }
        Ok(Self {
            packet_type,
            flags,
            frag_length: cur.u16()?,
            auth_length: cur.u16()?,
            call_id: cur.u32()?,
        })
    }

    fn write(&self, w: &mut WriteBuf) {
        w.put_u8(DCERPC_VERSION_MAJOR);
        w.put_u8(DCERPC_VERSION_MINOR);
        w.put_u8(self.packet_type as u8);
        w.put_u8(self.flags.bits());
        w.put_bytes(&DREP_LE);
        w.put_u16(self.frag_length);
        w.put_u16(self.auth_length);
        w.put_u32(self.call_id);
    }

    pub fn is_last_frag(&self) -> bool {
        self.flags.contains(PacketFlags::LAST_FRAG)
    }
}

fn read_syntax(cur: &mut ReadCursor<'_>) -> Result<SyntaxId> {
    let uuid = Uuid::from_bytes_le(cur.array()?);
    Ok(SyntaxId {
        uuid,
        version_major: cur.u16()?,
        version_minor: cur.u16()?,
    })
}

fn write_syntax(w: &mut WriteBuf, syntax: &SyntaxId) {
    w.put_bytes(&syntax.uuid.to_bytes_le());
    w.put_u16(syntax.version_major);
    w.put_u16(syntax.version_minor);
}

/// One presentation context offered in a bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub contexts: Vec<ContextElement>,
}

/// Server verdict on one offered context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextResult {
    pub result: u16,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAck {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Port specifier, e.g. `\PIPE\srvsvc`
    pub secondary_address: String,
    pub results: Vec<ContextResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindNak {
    pub reason: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub context_id: u16,
    pub opnum: u16,
    pub stub: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Total stub size of the whole call, as announced by the sender
    pub alloc_hint: u32,
    pub context_id: u16,
    pub stub: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub context_id: u16,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Bind(Bind),
    BindAck(BindAck),
    BindNak(BindNak),
    Request(Request),
    Response(Response),
    Fault(Fault),
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Bind(_) => PacketType::Bind,
            PacketBody::BindAck(_) => PacketType::BindAck,
            PacketBody::BindNak(_) => PacketType::BindNak,
            PacketBody::Request(_) => PacketType::Request,
            PacketBody::Response(_) => PacketType::Response,
            PacketBody::Fault(_) => PacketType::Fault,
        }
    }
}

/// A complete PDU: one fragment on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcPacket {
    pub call_id: u32,
    pub flags: PacketFlags,
    pub body: PacketBody,
}

impl RpcPacket {
    /// Single-fragment packet
    pub fn new(call_id: u32, body: PacketBody) -> Self {
        Self {
            call_id,
            flags: PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG,
            body,
        }
    }

    /// Encode, filling in `frag_length` and `alloc_hint`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WriteBuf::with_capacity(64);
        RpcHeader {
            packet_type: self.body.packet_type(),
            flags: self.flags,
            frag_length: 0,
            auth_length: 0,
            call_id: self.call_id,
        }
        .write(&mut w);

        match &self.body {
            PacketBody::Bind(b) => {
                w.put_u16(b.max_xmit_frag);
                w.put_u16(b.max_recv_frag);
                w.put_u32(b.assoc_group_id);
                w.put_u8(b.contexts.len() as u8);
                w.put_zeros(3);
                for ctx in &b.contexts {
                    w.put_u16(ctx.context_id);
                    w.put_u8(ctx.transfer_syntaxes.len() as u8);
                    w.put_u8(0);
                    write_syntax(&mut w, &ctx.abstract_syntax);
                    for ts in &ctx.transfer_syntaxes {
                        write_syntax(&mut w, ts);
                    }
                }
            }
            PacketBody::BindAck(a) => {
                w.put_u16(a.max_xmit_frag);
                w.put_u16(a.max_recv_frag);
                w.put_u32(a.assoc_group_id);
                let mut addr = a.secondary_address.as_bytes().to_vec();
                if !addr.is_empty() {
                    addr.push(0);
                }
                w.put_u16(addr.len() as u16);
                w.put_bytes(&addr);
                w.pad_to(4);
                w.put_u8(a.results.len() as u8);
                w.put_zeros(3);
                for r in &a.results {
                    w.put_u16(r.result);
                    w.put_u16(r.reason);
                    write_syntax(&mut w, &r.transfer_syntax);
                }
            }
            PacketBody::BindNak(n) => {
                w.put_u16(n.reason);
                w.put_u8(0);
            }
            PacketBody::Request(r) => {
                w.put_u32(stub_len(&r.stub)?);
                w.put_u16(r.context_id);
                w.put_u16(r.opnum);
                w.put_bytes(&r.stub);
            }
            PacketBody::Response(r) => {
                w.put_u32(r.alloc_hint.max(stub_len(&r.stub)?));
                w.put_u16(r.context_id);
                w.put_u8(0);
                w.put_u8(0);
                w.put_bytes(&r.stub);
            }
            PacketBody::Fault(f) => {
                w.put_u32(0);
                w.put_u16(f.context_id);
                w.put_u8(0);
                w.put_u8(0);
                w.put_u32(f.status);
                w.put_u32(0);
            }
        }

        let frag_length = u16::try_from(w.len())
            .map_err(|_| Error::Rpc(format!("{} byte PDU exceeds a fragment", w.len())))?;
        w.set_u16_at(8, frag_length)?;
        Ok(w.into_inner())
    }

    /// Decode the first PDU in `data`. Returns the packet and the number of
    /// bytes it occupied.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cur = ReadCursor::new(data);
        let header = RpcHeader::read(&mut cur)?;
        let frag_len = header.frag_length as usize;
        if frag_len < RPC_HEADER_LEN {
            return Err(Error::Rpc(format!("frag_length {} below header size", frag_len)));
        }
        if data.len() < frag_len {
            return Err(Error::BufferTooSmall {
                need: frag_len,
                have: data.len(),
            });
        }
        // auth trailers are not used; drop them from the body
        let body_end = frag_len
            .checked_sub(header.auth_length as usize)
            .filter(|&end| end >= RPC_HEADER_LEN)
            .ok_or_else(|| Error::Rpc("auth_length exceeds fragment".into()))?;
        let mut cur = ReadCursor::new(&data[..body_end]);
        cur.seek(RPC_HEADER_LEN)?;

        let body = match header.packet_type {
            PacketType::Bind => {
                let max_xmit_frag = cur.u16()?;
                let max_recv_frag = cur.u16()?;
                let assoc_group_id = cur.u32()?;
                let n = cur.u8()?;
                cur.skip(3)?;
                let mut contexts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let context_id = cur.u16()?;
                    let n_ts = cur.u8()?;
                    cur.skip(1)?;
                    let abstract_syntax = read_syntax(&mut cur)?;
                    let transfer_syntaxes = (0..n_ts)
                        .map(|_| read_syntax(&mut cur))
                        .collect::<Result<_>>()?;
                    contexts.push(ContextElement {
                        context_id,
                        abstract_syntax,
                        transfer_syntaxes,
                    });
                }
                PacketBody::Bind(Bind {
                    max_xmit_frag,
                    max_recv_frag,
                    assoc_group_id,
                    contexts,
                })
            }
            PacketType::BindAck => {
                let max_xmit_frag = cur.u16()?;
                let max_recv_frag = cur.u16()?;
                let assoc_group_id = cur.u32()?;
                let addr_len = cur.u16()? as usize;
                let addr = cur.bytes(addr_len)?;
                let end = addr.iter().position(|&b| b == 0).unwrap_or(addr.len());
                let secondary_address = String::from_utf8_lossy(&addr[..end]).into_owned();
                cur.align(4)?;
                let n = cur.u8()?;
                cur.skip(3)?;
                let mut results = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    results.push(ContextResult {
                        result: cur.u16()?,
                        reason: cur.u16()?,
                        transfer_syntax: read_syntax(&mut cur)?,
                    });
                }
                PacketBody::BindAck(BindAck {
                    max_xmit_frag,
                    max_recv_frag,
                    assoc_group_id,
                    secondary_address,
                    results,
                })
            }
            PacketType::BindNak => PacketBody::BindNak(BindNak { reason: cur.u16()? }),
            PacketType::Request => {
                let _alloc_hint = cur.u32()?;
                let context_id = cur.u16()?;
                let opnum = cur.u16()?;
                if header.flags.contains(PacketFlags::OBJECT_UUID) {
                    cur.skip(16)?;
                }
                PacketBody::Request(Request {
                    context_id,
                    opnum,
                    stub: cur.bytes(cur.remaining())?.to_vec(),
                })
            }
            PacketType::Response => {
                let alloc_hint = cur.u32()?;
                if alloc_hint > MAX_ALLOC_HINT {
                    return Err(Error::Rpc(format!(
                        "alloc_hint {} above the {} byte limit",
                        alloc_hint, MAX_ALLOC_HINT
                    )));
                }
                let context_id = cur.u16()?;
                cur.skip(2)?;
                PacketBody::Response(Response {
                    alloc_hint,
                    context_id,
                    stub: cur.bytes(cur.remaining())?.to_vec(),
                })
            }
            PacketType::Fault => {
                let _alloc_hint = cur.u32()?;
                let context_id = cur.u16()?;
                cur.skip(2)?;
                PacketBody::Fault(Fault {
                    context_id,
                    status: cur.u32()?,
                })
            }
        };

        Ok((
            Self {
                call_id: header.call_id,
                flags: header.flags,
                body,
            },
            frag_len,
        ))
    }
}

fn stub_len(stub: &[u8]) -> Result<u32> {
    u32::try_from(stub.len()).map_err(|_| Error::Rpc("stub too large".into()))
}

/// Collects the fragments of one call's reply.
///
/// Bytes arrive in arbitrary slices (ioctl output, then pipe reads); whole
/// fragments are peeled off as they complete and response stubs are
/// concatenated until the LAST_FRAG fragment.
#[derive(Debug)]
pub struct Reassembly {
    call_id: u32,
    pending: Vec<u8>,
    stub: Vec<u8>,
    context_id: u16,
    alloc_hint: u32,
}

impl Reassembly {
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            pending: Vec::new(),
            stub: Vec::new(),
            context_id: 0,
            alloc_hint: 0,
        }
    }

    /// Feed received bytes. Returns the complete reply once the last
    /// fragment has been seen; a fragmented response comes back as one
    /// `Response` holding the whole stub.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<RpcPacket>> {
        self.pending.extend_from_slice(data);
        loop {
            if self.pending.len() < RPC_HEADER_LEN {
                return Ok(None);
            }
            let frag_len = u16::from_le_bytes([self.pending[8], self.pending[9]]) as usize;
            if self.pending.len() < frag_len {
                return Ok(None);
            }
            let (packet, used) = RpcPacket::decode(&self.pending)?;
            self.pending.drain(..used);
            if packet.call_id != self.call_id {
                return Err(Error::Rpc(format!(
                    "reply for call {} while waiting for call {}",
                    packet.call_id, self.call_id
                )));
            }
            let last = packet.flags.contains(PacketFlags::LAST_FRAG);
            match packet.body {
                PacketBody::Response(rsp) => {
                    if packet.flags.contains(PacketFlags::FIRST_FRAG) {
                        self.context_id = rsp.context_id;
                        self.alloc_hint = rsp.alloc_hint;
                        self.stub.reserve(rsp.alloc_hint as usize);
                    }
                    if self.stub.len() + rsp.stub.len() > MAX_ALLOC_HINT as usize {
                        return Err(Error::Rpc("reassembled reply exceeds 16 MiB".into()));
                    }
                    self.stub.extend_from_slice(&rsp.stub);
                    if last {
                        return Ok(Some(RpcPacket {
                            call_id: self.call_id,
                            flags: PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG,
                            body: PacketBody::Response(Response {
                                alloc_hint: self.alloc_hint,
                                context_id: self.context_id,
                                stub: std::mem::take(&mut self.stub),
                            }),
                        }));
                    }
                }
                body => {
                    return Ok(Some(RpcPacket {
                        call_id: packet.call_id,
                        flags: packet.flags,
                        body,
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::interfaces;

    fn response(call_id: u32, flags: PacketFlags, stub: &[u8]) -> Vec<u8> {
        RpcPacket {
            call_id,
            flags,
            body: PacketBody::Response(Response {
                alloc_hint: 6,
                context_id: 0,
                stub: stub.to_vec(),
            }),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_bind_wire_layout() {
        let bind = RpcPacket::new(
            2,
            PacketBody::Bind(Bind {
                max_xmit_frag: MAX_FRAG,
                max_recv_frag: MAX_FRAG,
                assoc_group_id: 0,
                contexts: vec![ContextElement {
                    context_id: 0,
                    abstract_syntax: interfaces::SRVSVC,
                    transfer_syntaxes: vec![interfaces::NDR32],
                }],
            }),
        );
        let data = bind.encode().unwrap();
        assert_eq!(data.len(), 72);
        assert_eq!(&data[..4], &[5, 0, 11, 0x03]);
        assert_eq!(&data[4..8], &[0x10, 0, 0, 0]);
        assert_eq!(u16::from_le_bytes([data[8], data[9]]), 72);
        assert_eq!(u32::from_le_bytes([data[12], data[13], data[14], data[15]]), 2);
        // uuid fields are little-endian on the wire
        assert_eq!(&data[32..36], &[0xc8, 0x4f, 0x32, 0x4b]);
        let (decoded, used) = RpcPacket::decode(&data).unwrap();
        assert_eq!(used, 72);
        assert_eq!(decoded, bind);
    }

    #[test]
    fn test_bind_ack_secondary_address_padding() {
        let ack = RpcPacket::new(
            2,
            PacketBody::BindAck(BindAck {
                max_xmit_frag: 4280,
                max_recv_frag: 4280,
                assoc_group_id: 0x1234,
                secondary_address: "\\PIPE\\srvsvc".into(),
                results: vec![ContextResult {
                    result: 0,
                    reason: 0,
                    transfer_syntax: interfaces::NDR32,
                }],
            }),
        );
        let data = ack.encode().unwrap();
        // 16 + 8 + 2 + 13, padded to 40, + 4 + 24
        assert_eq!(data.len(), 68);
        let (decoded, _) = RpcPacket::decode(&data).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_alloc_hint_limit() {
        let mut data = response(3, PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG, &[1]);
        data[16..20].copy_from_slice(&(MAX_ALLOC_HINT + 1).to_le_bytes());
        assert!(matches!(RpcPacket::decode(&data), Err(Error::Rpc(_))));
    }

    #[test]
    fn test_reassembly_across_fragments_and_slices() {
        let mut wire = response(5, PacketFlags::FIRST_FRAG, b"abc");
        wire.extend(response(5, PacketFlags::LAST_FRAG, b"def"));

        let mut r = Reassembly::new(5);
        assert!(r.feed(&wire[..10]).unwrap().is_none());
        assert!(r.feed(&wire[10..30]).unwrap().is_none());
        let done = r.feed(&wire[30..]).unwrap().unwrap();
        match done.body {
            PacketBody::Response(rsp) => assert_eq!(rsp.stub, b"abcdef"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reassembly_fault_and_wrong_call() {
        let fault = RpcPacket::new(
            7,
            PacketBody::Fault(Fault {
                context_id: 0,
                status: 0x1c01_0003,
            }),
        )
        .encode()
        .unwrap();
        let mut r = Reassembly::new(7);
        let done = r.feed(&fault).unwrap().unwrap();
        assert_eq!(
            done.body,
            PacketBody::Fault(Fault {
                context_id: 0,
                status: 0x1c01_0003
            })
        );

        let mut r = Reassembly::new(8);
        assert!(matches!(r.feed(&fault), Err(Error::Rpc(_))));
    }

    #[test]
    fn test_rejects_big_endian_drep() {
        let mut data = response(1, PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG, &[]);
        data[4] = 0x00;
        assert!(RpcPacket::decode(&data).is_err());
    }
}
