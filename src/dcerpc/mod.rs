//! DCE/RPC over SMB2 named pipes
//!
//! A pipe is opened on the `IPC$` tree, bound to one interface with a
//! negotiated transfer syntax, and then carries request/response PDUs as
//! FSCTL_PIPE_TRANSCEIVE ioctls. Interface operations are expressed as
//! [`ndr::NdrCoder`] pairs (one request type, one reply type) so no
//! interface carries transport code of its own.

pub mod ndr;
pub mod packet;
pub mod pipe;
pub mod services;

#[cfg(test)]
mod tests;

pub use pipe::RpcPipe;
pub use services::{lsa, srvsvc};

use crate::error::Error;
use bitflags::bitflags;
use std::convert::TryFrom;
use uuid::{uuid, Uuid};

/// DCE/RPC connection-oriented protocol version
pub const DCERPC_VERSION_MAJOR: u8 = 5;
pub const DCERPC_VERSION_MINOR: u8 = 0;

/// Transfer syntax preference for binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ndr {
    /// Offer NDR32 and NDR64, take what the server accepts first
    #[default]
    Any,
    Ndr32,
    Ndr64,
}

impl Ndr {
    /// `0`/`any`, `1`/`ndr32`, `2`/`ndr64`
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "0" | "any" => Ndr::Any,
            "1" | "ndr32" => Ndr::Ndr32,
            "2" | "ndr64" => Ndr::Ndr64,
            _ => return None,
        })
    }
}

/// Connection-oriented PDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Request),
            2 => Ok(PacketType::Response),
            3 => Ok(PacketType::Fault),
            11 => Ok(PacketType::Bind),
            12 => Ok(PacketType::BindAck),
            13 => Ok(PacketType::BindNak),
            _ => Err(Error::Rpc(format!("unsupported packet type {}", value))),
        }
    }
}

bitflags! {
    /// `pfc_flags` of the common header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const FIRST_FRAG = 0x01;
        const LAST_FRAG = 0x02;
        const PENDING_CANCEL = 0x04;
        const CONC_MPX = 0x10;
        const DID_NOT_EXECUTE = 0x20;
        const MAYBE = 0x40;
        const OBJECT_UUID = 0x80;
    }
}

/// An interface or transfer syntax identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version_major: u16,
    pub version_minor: u16,
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, version_major: u16, version_minor: u16) -> Self {
        Self {
            uuid,
            version_major,
            version_minor,
        }
    }
}

/// Well known syntaxes
pub mod interfaces {
    use super::*;

    pub const NDR32: SyntaxId = SyntaxId::new(uuid!("8a885d04-1ceb-11c9-9fe8-08002b104860"), 2, 0);
    pub const NDR64: SyntaxId = SyntaxId::new(uuid!("71710533-beba-4937-8319-b5dbef9ccc36"), 1, 0);

    /// Server Service, for share enumeration
    pub const SRVSVC: SyntaxId = SyntaxId::new(uuid!("4b324fc8-1670-01d3-1278-5a47bf6ee188"), 3, 0);

    /// Local Security Authority, for SID lookup
    pub const LSARPC: SyntaxId = SyntaxId::new(uuid!("12345778-1234-abcd-ef00-0123456789ab"), 0, 0);
}

/// Presentation context ids used in binds
pub const NDR32_CONTEXT_ID: u16 = 0;
pub const NDR64_CONTEXT_ID: u16 = 1;

/// Bind result codes
pub mod ack_result {
    pub const ACCEPTANCE: u16 = 0;
    pub const USER_REJECTION: u16 = 1;
    pub const PROVIDER_REJECTION: u16 = 2;
}
