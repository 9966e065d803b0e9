//! Server Service (srvsvc): share enumeration and share information

use super::check_werror;
use crate::connection::{close_then, Chain, Context};
use crate::dcerpc::interfaces;
use crate::dcerpc::ndr::{NdrCoder, NdrDecoder, NdrEncoder, PtrKind};
use crate::dcerpc::pipe::RpcPipe;
use crate::error::{Error, Result};
use tracing::debug;

pub const SRVSVC_PIPE: &str = "srvsvc";

pub mod opnum {
    pub const NETR_SHARE_ENUM: u16 = 15;
    pub const NETR_SHARE_GET_INFO: u16 = 16;
}

/// Share types; the high bits qualify the base type.
pub mod share_type {
    pub const DISKTREE: u32 = 0;
    pub const PRINTQ: u32 = 1;
    pub const DEVICE: u32 = 2;
    pub const IPC: u32 = 3;
    pub const TEMPORARY: u32 = 0x4000_0000;
    pub const SPECIAL: u32 = 0x8000_0000;
    pub const HIDDEN: u32 = SPECIAL;
}

/// Ask for everything in one reply
pub const MAX_PREFERRED_LENGTH: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShareInfo {
    pub name: String,
    pub share_type: u32,
    pub remark: String,
}

impl ShareInfo {
    pub fn base_type(&self) -> u32 {
        self.share_type & 0x0FFF_FFFF
    }

    pub fn is_hidden(&self) -> bool {
        self.share_type & share_type::HIDDEN != 0
    }

    pub fn is_temporary(&self) -> bool {
        self.share_type & share_type::TEMPORARY != 0
    }

    fn check_level(level: u32) -> Result<()> {
        match level {
            0 | 1 => Ok(()),
            other => Err(Error::NotSupported(format!("share info level {}", other))),
        }
    }

    /// Fixed part of SHARE_INFO_0/1: string pointers inline
    fn encode_fixed(&self, enc: &mut NdrEncoder, level: u32) -> Result<()> {
        enc.align_ptr();
        enc.pointer(PtrKind::Unique, true)?;
        if level == 1 {
            enc.u32(self.share_type);
            enc.pointer(PtrKind::Unique, true)?;
        }
        Ok(())
    }

    fn encode_deferred(&self, enc: &mut NdrEncoder, level: u32) -> Result<()> {
        enc.string(&self.name)?;
        if level == 1 {
            enc.string(&self.remark)?;
        }
        Ok(())
    }

    fn decode_fixed(dec: &mut NdrDecoder<'_>, level: u32) -> Result<(bool, u32, bool)> {
        dec.align_ptr()?;
        let name = dec.pointer(PtrKind::Unique)?;
        if level == 1 {
            let share_type = dec.u32()?;
            let remark = dec.pointer(PtrKind::Unique)?;
            Ok((name, share_type, remark))
        } else {
            Ok((name, 0, false))
        }
    }

    fn decode_deferred(
        dec: &mut NdrDecoder<'_>,
        (name, share_type, remark): (bool, u32, bool),
    ) -> Result<Self> {
        let name = if name { dec.string()? } else { String::new() };
        let remark = if remark { dec.string()? } else { String::new() };
        Ok(Self {
            name,
            share_type,
            remark,
        })
    }
}

/// NetrShareEnum request. The container is always sent empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrShareEnumRequest {
    pub server_name: Option<String>,
    pub level: u32,
    pub preferred_maximum_length: u32,
    pub resume_handle: Option<u32>,
}

impl NetrShareEnumRequest {
    pub fn new(server: &str, level: u32) -> Self {
        Self {
            server_name: Some(format!("\\\\{}", server)),
            level,
            preferred_maximum_length: MAX_PREFERRED_LENGTH,
            resume_handle: Some(0),
        }
    }
}

impl NdrCoder for NetrShareEnumRequest {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        ShareInfo::check_level(self.level)?;
        enc.unique_string(self.server_name.as_deref())?;
        enc.u32(self.level);
        // union discriminant, then the container arm
        enc.u32(self.level);
        enc.pointer(PtrKind::Unique, true)?;
        enc.u32(0);
        enc.pointer(PtrKind::Unique, false)?;
        enc.u32(self.preferred_maximum_length);
        if enc.pointer(PtrKind::Unique, self.resume_handle.is_some())? {
            enc.u32(self.resume_handle.unwrap_or(0));
        }
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let server_name = dec.unique_string()?;
        let level = dec.u32()?;
        let arm = dec.u32()?;
        if arm != level {
            return Err(Error::Rpc(format!("union arm {} for level {}", arm, level)));
        }
        ShareInfo::check_level(level)?;
        if dec.pointer(PtrKind::Unique)? {
            let _entries = dec.u32()?;
            if dec.pointer(PtrKind::Unique)? {
                return Err(Error::NotSupported("populated share container in request".into()));
            }
        }
        let preferred_maximum_length = dec.u32()?;
        let resume_handle = if dec.pointer(PtrKind::Unique)? {
            Some(dec.u32()?)
        } else {
            None
        };
        Ok(Self {
            server_name,
            level,
            preferred_maximum_length,
            resume_handle,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetrShareEnumReply {
    pub level: u32,
    pub shares: Vec<ShareInfo>,
    pub total_entries: u32,
    pub resume_handle: Option<u32>,
    pub status: u32,
}

impl NdrCoder for NetrShareEnumReply {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        ShareInfo::check_level(self.level)?;
        enc.u32(self.level);
        enc.u32(self.level);
        enc.pointer(PtrKind::Unique, true)?;
        enc.u32(self.shares.len() as u32);
        if enc.pointer(PtrKind::Unique, !self.shares.is_empty())? {
            enc.conformance(self.shares.len())?;
            for share in &self.shares {
                share.encode_fixed(enc, self.level)?;
            }
            for share in &self.shares {
                share.encode_deferred(enc, self.level)?;
            }
        }
        enc.u32(self.total_entries);
        if enc.pointer(PtrKind::Unique, self.resume_handle.is_some())? {
            enc.u32(self.resume_handle.unwrap_or(0));
        }
        enc.u32(self.status);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let level = dec.u32()?;
        let arm = dec.u32()?;
        if arm != level {
            return Err(Error::Rpc(format!("union arm {} for level {}", arm, level)));
        }
        ShareInfo::check_level(level)?;
        let mut shares = Vec::new();
        if dec.pointer(PtrKind::Unique)? {
            let entries = dec.u32()? as usize;
            if dec.pointer(PtrKind::Unique)? {
                let min = if level == 1 { 12 } else { 4 };
                let fixed = dec.conformant_array(min, |d| ShareInfo::decode_fixed(d, level))?;
                if fixed.len() != entries {
                    return Err(Error::Rpc("share count disagrees with array size".into()));
                }
                for parts in fixed {
                    shares.push(ShareInfo::decode_deferred(dec, parts)?);
                }
            }
        }
        let total_entries = dec.u32()?;
        let resume_handle = if dec.pointer(PtrKind::Unique)? {
            Some(dec.u32()?)
        } else {
            None
        };
        Ok(Self {
            level,
            shares,
            total_entries,
            resume_handle,
            status: dec.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrShareGetInfoRequest {
    pub server_name: Option<String>,
    pub share: String,
    pub level: u32,
}

impl NdrCoder for NetrShareGetInfoRequest {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        ShareInfo::check_level(self.level)?;
        enc.unique_string(self.server_name.as_deref())?;
        enc.string(&self.share)?;
        enc.u32(self.level);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            server_name: dec.unique_string()?,
            share: dec.string()?,
            level: dec.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetrShareGetInfoReply {
    pub level: u32,
    pub info: Option<ShareInfo>,
    pub status: u32,
}

impl NdrCoder for NetrShareGetInfoReply {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        ShareInfo::check_level(self.level)?;
        enc.u32(self.level);
        if enc.pointer(PtrKind::Unique, self.info.is_some())? {
            if let Some(info) = &self.info {
                info.encode_fixed(enc, self.level)?;
                info.encode_deferred(enc, self.level)?;
            }
        }
        enc.u32(self.status);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let level = dec.u32()?;
        ShareInfo::check_level(level)?;
        let info = if dec.pointer(PtrKind::Unique)? {
            let parts = ShareInfo::decode_fixed(dec, level)?;
            Some(ShareInfo::decode_deferred(dec, parts)?)
        } else {
            None
        };
        Ok(Self {
            level,
            info,
            status: dec.u32()?,
        })
    }
}

impl Context {
    /// List the server's shares at level 1. The context must be connected
    /// to `IPC$`.
    pub fn share_enum_async(
        &mut self,
        callback: impl FnOnce(&mut Context, Result<Vec<ShareInfo>>) + 'static,
    ) -> Result<()> {
        let done = Chain::new(callback);
        let request = NetrShareEnumRequest::new(self.server(), 1);
        self.dcerpc_open_async(SRVSVC_PIPE, move |ctx, result| {
            let pipe = match result {
                Ok(pipe) => pipe,
                Err(e) => return done.finish(ctx, Err(e)),
            };
            let bound = pipe.clone();
            let next = done.clone();
            done.step(ctx, move |ctx| {
                pipe.bind_async(ctx, &interfaces::SRVSVC, move |ctx, result| match result {
                    Ok(()) => share_enum_call(ctx, bound, request, next),
                    Err(e) => {
                        close_then(ctx, bound.file_id(), Some(bound.tree_id()), next, Err(e))
                    }
                })
            });
        })?;
        Ok(())
    }
}

fn share_enum_call(
    ctx: &mut Context,
    pipe: RpcPipe,
    request: NetrShareEnumRequest,
    done: Chain<Vec<ShareInfo>>,
) {
    let p = pipe.clone();
    let next = done.clone();
    done.step(ctx, move |ctx| {
        p.call_async(ctx, opnum::NETR_SHARE_ENUM, &request, move |ctx, result| {
            let shares = result.and_then(|rep: NetrShareEnumReply| {
                check_werror(rep.status)?;
                debug!(count = rep.shares.len(), total = rep.total_entries, "shares enumerated");
                Ok(rep.shares)
            });
            close_then(ctx, pipe.file_id(), Some(pipe.tree_id()), next, shares)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares() -> Vec<ShareInfo> {
        vec![
            ShareInfo {
                name: "IPC$".into(),
                share_type: share_type::IPC | share_type::SPECIAL,
                remark: "Remote IPC".into(),
            },
            ShareInfo {
                name: "data".into(),
                share_type: share_type::DISKTREE,
                remark: String::new(),
            },
        ]
    }

    #[test]
    fn test_share_type_bits() {
        let ipc = &shares()[0];
        assert_eq!(ipc.base_type(), share_type::IPC);
        assert!(ipc.is_hidden());
        assert!(!ipc.is_temporary());
    }

    #[test]
    fn test_share_enum_request_layout() {
        let req = NetrShareEnumRequest::new("host", 1);
        let mut enc = NdrEncoder::new(false);
        req.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        // pointer + 3 counts + "\\host\0" padded to 16, then level, arm,
        // container pointer, empty container, max length, resume handle
        assert_eq!(bytes.len(), 4 + 12 + 16 + 4 * 8);
        assert_eq!(&bytes[32..36], &1u32.to_le_bytes());
        assert_eq!(&bytes[52..56], &MAX_PREFERRED_LENGTH.to_le_bytes());
        let mut dec = NdrDecoder::new(&bytes, false);
        assert_eq!(NetrShareEnumRequest::decode(&mut dec).unwrap(), req);
    }

    #[test]
    fn test_share_enum_reply_levels_and_syntaxes() {
        for ndr64 in [false, true] {
            let reply = NetrShareEnumReply {
                level: 1,
                shares: shares(),
                total_entries: 2,
                resume_handle: Some(0),
                status: 0,
            };
            let mut enc = NdrEncoder::new(ndr64);
            reply.encode(&mut enc).unwrap();
            let bytes = enc.into_bytes();
            let mut dec = NdrDecoder::new(&bytes, ndr64);
            assert_eq!(NetrShareEnumReply::decode(&mut dec).unwrap(), reply);

            let level0 = NetrShareEnumReply {
                level: 0,
                shares: shares()
                    .into_iter()
                    .map(|s| ShareInfo {
                        name: s.name,
                        ..Default::default()
                    })
                    .collect(),
                total_entries: 2,
                resume_handle: None,
                status: 0,
            };
            let mut enc = NdrEncoder::new(ndr64);
            level0.encode(&mut enc).unwrap();
            let bytes = enc.into_bytes();
            let mut dec = NdrDecoder::new(&bytes, ndr64);
            assert_eq!(NetrShareEnumReply::decode(&mut dec).unwrap(), level0);
        }
    }

    #[test]
    fn test_share_get_info() {
        let req = NetrShareGetInfoRequest {
            server_name: None,
            share: "data".into(),
            level: 1,
        };
        let mut enc = NdrEncoder::new(false);
        req.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        let mut dec = NdrDecoder::new(&bytes, false);
        assert_eq!(NetrShareGetInfoRequest::decode(&mut dec).unwrap(), req);

        let reply = NetrShareGetInfoReply {
            level: 1,
            info: Some(shares().remove(1)),
            status: 0,
        };
        let mut enc = NdrEncoder::new(false);
        reply.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        let mut dec = NdrDecoder::new(&bytes, false);
        assert_eq!(NetrShareGetInfoReply::decode(&mut dec).unwrap(), reply);
    }

    #[test]
    fn test_unknown_level_rejected() {
        let mut req = NetrShareEnumRequest::new("host", 2);
        let mut enc = NdrEncoder::new(false);
        assert!(req.encode(&mut enc).is_err());
        req.level = 1;
        assert!(req.encode(&mut NdrEncoder::new(false)).is_ok());
    }
}
