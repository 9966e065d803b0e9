use super::ndr::{NdrCoder, NdrDecoder, NdrEncoder};
use super::packet::*;
use super::services::srvsvc::{share_type, NetrShareEnumReply, NetrShareEnumRequest, ShareInfo};
use super::*;

/// Split a reply stub into response fragments of at most `frag` bytes.
fn fragment(call_id: u32, stub: &[u8], frag: usize) -> Vec<u8> {
    let chunks: Vec<&[u8]> = stub.chunks(frag).collect();
    let mut out = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let mut flags = PacketFlags::empty();
        if i == 0 {
            flags |= PacketFlags::FIRST_FRAG;
        }
        if i + 1 == chunks.len() {
            flags |= PacketFlags::LAST_FRAG;
        }
        let packet = RpcPacket {
            call_id,
            flags,
            body: PacketBody::Response(Response {
                alloc_hint: stub.len() as u32,
                context_id: NDR32_CONTEXT_ID,
                stub: chunk.to_vec(),
            }),
        };
        out.extend(packet.encode().unwrap());
    }
    out
}

#[test]
fn test_ndr_parse() {
    assert_eq!(Ndr::parse("0"), Some(Ndr::Any));
    assert_eq!(Ndr::parse("ndr64"), Some(Ndr::Ndr64));
    assert_eq!(Ndr::parse("3"), None);
    assert_eq!(Ndr::default(), Ndr::Any);
}

#[test]
fn test_packet_type_codes() {
    assert_eq!(PacketType::try_from(12).unwrap(), PacketType::BindAck);
    assert!(PacketType::try_from(14).is_err());
}

#[test]
fn test_share_enum_call_over_fragments() {
    let request = RpcPacket::new(
        7,
        PacketBody::Request(Request {
            context_id: NDR32_CONTEXT_ID,
            opnum: services::srvsvc::opnum::NETR_SHARE_ENUM,
            stub: {
                let mut enc = NdrEncoder::new(false);
                NetrShareEnumRequest::new("fileserver", 1).encode(&mut enc).unwrap();
                enc.into_bytes()
            },
        }),
    );

    // the server side sees the request as sent
    let wire = request.encode().unwrap();
    let (decoded, used) = RpcPacket::decode(&wire).unwrap();
    assert_eq!(used, wire.len());
    let stub = match decoded.body {
        PacketBody::Request(r) => r.stub,
        other => panic!("unexpected {:?}", other),
    };
    let req = NetrShareEnumRequest::decode(&mut NdrDecoder::new(&stub, false)).unwrap();
    assert_eq!(req.server_name.as_deref(), Some("\\\\fileserver"));

    let shares: Vec<ShareInfo> = (0..200)
        .map(|i| ShareInfo {
            name: format!("share{:03}", i),
            share_type: share_type::DISKTREE,
            remark: "x".repeat(i % 17),
        })
        .collect();
    let reply = NetrShareEnumReply {
        level: 1,
        total_entries: shares.len() as u32,
        shares,
        resume_handle: Some(0),
        status: 0,
    };
    let mut enc = NdrEncoder::new(false);
    reply.encode(&mut enc).unwrap();
    let stub = enc.into_bytes();
    let bytes = fragment(7, &stub, 1024);

    // delivered in uneven slices, as ioctl output and pipe reads would be
    let mut reassembly = Reassembly::new(7);
    let mut complete = None;
    for piece in bytes.chunks(777) {
        if let Some(packet) = reassembly.feed(piece).unwrap() {
            complete = Some(packet);
        }
    }
    let packet = complete.expect("reply completes on the last fragment");
    let body = match packet.body {
        PacketBody::Response(r) => r.stub,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(body, stub);
    let decoded = NetrShareEnumReply::decode(&mut NdrDecoder::new(&body, false)).unwrap();
    assert_eq!(decoded, reply);
}
