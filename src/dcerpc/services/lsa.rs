//! Local Security Authority (lsarpc): policy handles and SID to name lookup

use super::{check_ntstatus, PolicyHandle, Sid};
use crate::connection::{close_then, Chain, Context};
use crate::dcerpc::interfaces;
use crate::dcerpc::ndr::{NdrCoder, NdrDecoder, NdrEncoder, PtrKind};
use crate::dcerpc::pipe::RpcPipe;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

pub const LSARPC_PIPE: &str = "lsarpc";

pub mod opnum {
    pub const CLOSE: u16 = 0;
    pub const OPEN_POLICY2: u16 = 44;
    pub const LOOKUP_SIDS2: u16 = 57;
}

/// POLICY_LOOKUP_NAMES access right
pub const POLICY_LOOKUP_NAMES: u32 = 0x0000_0800;
/// LsapLookupWksta
pub const LOOKUP_LEVEL_WKSTA: u16 = 1;
/// Size of LSAPR_OBJECT_ATTRIBUTES in NDR32
const OBJECT_ATTRIBUTES_LEN: u32 = 24;

/// SID_NAME_USE values
pub mod sid_type {
    pub const USER: u16 = 1;
    pub const GROUP: u16 = 2;
    pub const DOMAIN: u16 = 3;
    pub const ALIAS: u16 = 4;
    pub const WELL_KNOWN_GROUP: u16 = 5;
    pub const UNKNOWN: u16 = 8;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPolicy2Request {
    pub system_name: Option<String>,
    pub desired_access: u32,
}

impl NdrCoder for OpenPolicy2Request {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        enc.unique_string(self.system_name.as_deref())?;
        // object attributes, every pointer null
        enc.align_ptr();
        enc.u32(OBJECT_ATTRIBUTES_LEN);
        for _ in 0..2 {
            enc.pointer(PtrKind::Unique, false)?;
        }
        enc.u32(0);
        for _ in 0..2 {
            enc.pointer(PtrKind::Unique, false)?;
        }
        enc.u32(self.desired_access);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let system_name = dec.unique_string()?;
        dec.align_ptr()?;
        let _length = dec.u32()?;
        let mut present = dec.pointer(PtrKind::Unique)? | dec.pointer(PtrKind::Unique)?;
        let _attributes = dec.u32()?;
        present |= dec.pointer(PtrKind::Unique)? | dec.pointer(PtrKind::Unique)?;
        if present {
            return Err(Error::NotSupported("object attributes with pointees".into()));
        }
        Ok(Self {
            system_name,
            desired_access: dec.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPolicy2Reply {
    pub handle: PolicyHandle,
    pub status: u32,
}

impl NdrCoder for OpenPolicy2Reply {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        self.handle.encode(enc)?;
        enc.u32(self.status);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            handle: PolicyHandle::decode(dec)?,
            status: dec.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub handle: PolicyHandle,
}

impl NdrCoder for CloseRequest {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        self.handle.encode(enc)
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            handle: PolicyHandle::decode(dec)?,
        })
    }
}

/// The handle comes back zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReply {
    pub handle: PolicyHandle,
    pub status: u32,
}

impl NdrCoder for CloseReply {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        self.handle.encode(enc)?;
        enc.u32(self.status);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            handle: PolicyHandle::decode(dec)?,
            status: dec.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSids2Request {
    pub handle: PolicyHandle,
    pub sids: Vec<Sid>,
    pub lookup_level: u16,
    pub lookup_options: u32,
    pub client_revision: u32,
}

impl LookupSids2Request {
    pub fn new(handle: PolicyHandle, sids: Vec<Sid>) -> Self {
        Self {
            handle,
            sids,
            lookup_level: LOOKUP_LEVEL_WKSTA,
            lookup_options: 0,
            client_revision: 2,
        }
    }
}

impl NdrCoder for LookupSids2Request {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        self.handle.encode(enc)?;
        // LSAPR_SID_ENUM_BUFFER
        enc.u32(self.sids.len() as u32);
        if enc.pointer(PtrKind::Unique, !self.sids.is_empty())? {
            enc.conformance(self.sids.len())?;
            for _ in &self.sids {
                enc.pointer(PtrKind::Unique, true)?;
            }
            for sid in &self.sids {
                sid.encode(enc)?;
            }
        }
        // translated names going in are always empty
        enc.u32(0);
        enc.pointer(PtrKind::Unique, false)?;
        enc.enum16(self.lookup_level);
        enc.u32(0);
        enc.u32(self.lookup_options);
        enc.u32(self.client_revision);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let handle = PolicyHandle::decode(dec)?;
        let entries = dec.u32()? as usize;
        let mut sids = Vec::new();
        if dec.pointer(PtrKind::Unique)? {
            let tags = dec.conformant_array(4, |d| d.pointer(PtrKind::Unique))?;
            if tags.len() != entries {
                return Err(Error::Rpc("SID count disagrees with array size".into()));
            }
            for present in tags {
                if !present {
                    return Err(Error::Rpc("null SID in lookup request".into()));
                }
                sids.push(Sid::decode(dec)?);
            }
        }
        let _names = dec.u32()?;
        if dec.pointer(PtrKind::Unique)? {
            return Err(Error::NotSupported("names supplied to LookupSids2".into()));
        }
        let lookup_level = dec.enum16()?;
        let _mapped = dec.u32()?;
        Ok(Self {
            handle,
            sids,
            lookup_level,
            lookup_options: dec.u32()?,
            client_revision: dec.u32()?,
        })
    }
}

/// A domain referenced by translated names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustInformation {
    pub name: String,
    pub sid: Option<Sid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedName {
    pub sid_type: u16,
    pub name: String,
    /// Index into the referenced domains, -1 when none
    pub domain_index: i32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupSids2Reply {
    pub domains: Vec<TrustInformation>,
    pub names: Vec<TranslatedName>,
    pub mapped_count: u32,
    pub status: u32,
}

impl NdrCoder for LookupSids2Reply {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        // referenced domain list
        enc.pointer(PtrKind::Unique, true)?;
        enc.u32(self.domains.len() as u32);
        if enc.pointer(PtrKind::Unique, !self.domains.is_empty())? {
            enc.u32(self.domains.len() as u32);
            enc.conformance(self.domains.len())?;
            for d in &self.domains {
                enc.unicode_string_header(&d.name)?;
                enc.pointer(PtrKind::Unique, d.sid.is_some())?;
            }
            for d in &self.domains {
                enc.unicode_string_buffer(&d.name)?;
                if let Some(sid) = &d.sid {
                    sid.encode(enc)?;
                }
            }
        } else {
            enc.u32(0);
        }

        enc.u32(self.names.len() as u32);
        if enc.pointer(PtrKind::Unique, !self.names.is_empty())? {
            enc.conformance(self.names.len())?;
            for n in &self.names {
                enc.align_ptr();
                enc.enum16(n.sid_type);
                enc.unicode_string_header(&n.name)?;
                enc.u32(n.domain_index as u32);
                enc.u32(n.flags);
            }
            for n in &self.names {
                enc.unicode_string_buffer(&n.name)?;
            }
        }
        enc.u32(self.mapped_count);
        enc.u32(self.status);
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let mut domains = Vec::new();
        if dec.pointer(PtrKind::Unique)? {
            let entries = dec.u32()? as usize;
            let present = dec.pointer(PtrKind::Unique)?;
            let _max_entries = dec.u32()?;
            if present {
                let fixed = dec.conformant_array(8, |d| {
                    let name = d.unicode_string_header()?;
                    let sid = d.pointer(PtrKind::Unique)?;
                    Ok((name, sid))
                })?;
                if fixed.len() != entries {
                    return Err(Error::Rpc("domain count disagrees with array size".into()));
                }
                for (has_name, has_sid) in fixed {
                    let name = if has_name {
                        dec.unicode_string_buffer()?
                    } else {
                        String::new()
                    };
                    let sid = if has_sid { Some(Sid::decode(dec)?) } else { None };
                    domains.push(TrustInformation { name, sid });
                }
            }
        }

        let entries = dec.u32()? as usize;
        let mut names = Vec::new();
        if dec.pointer(PtrKind::Unique)? {
            let fixed = dec.conformant_array(16, |d| {
                d.align_ptr()?;
                let sid_type = d.enum16()?;
                let has_name = d.unicode_string_header()?;
                let domain_index = d.u32()? as i32;
                let flags = d.u32()?;
                Ok((sid_type, has_name, domain_index, flags))
            })?;
            if fixed.len() != entries {
                return Err(Error::Rpc("name count disagrees with array size".into()));
            }
            for (sid_type, has_name, domain_index, flags) in fixed {
                let name = if has_name {
                    dec.unicode_string_buffer()?
                } else {
                    String::new()
                };
                names.push(TranslatedName {
                    sid_type,
                    name,
                    domain_index,
                    flags,
                });
            }
        }
        Ok(Self {
            domains,
            names,
            mapped_count: dec.u32()?,
            status: dec.u32()?,
        })
    }
}

/// A SID resolved to an account name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub sid: Sid,
    pub domain: Option<String>,
    pub name: String,
    pub sid_type: u16,
}

impl LookupSids2Reply {
    /// Pair each translated name with its SID and domain name.
    pub fn resolve(&self, sids: &[Sid]) -> Vec<ResolvedName> {
        sids.iter()
            .zip(&self.names)
            .map(|(sid, n)| ResolvedName {
                sid: sid.clone(),
                domain: usize::try_from(n.domain_index)
                    .ok()
                    .and_then(|i| self.domains.get(i))
                    .map(|d| d.name.clone()),
                name: n.name.clone(),
                sid_type: n.sid_type,
            })
            .collect()
    }
}

impl Context {
    /// Resolve SIDs to account names through the server's LSA. The context
    /// must be connected to `IPC$`.
    pub fn lookup_sids_async(
        &mut self,
        sids: Vec<Sid>,
        callback: impl FnOnce(&mut Context, Result<Vec<ResolvedName>>) + 'static,
    ) -> Result<()> {
        let done = Chain::new(callback);
        let system_name = format!("\\\\{}", self.server());
        self.dcerpc_open_async(LSARPC_PIPE, move |ctx, result| {
            let pipe = match result {
                Ok(pipe) => pipe,
                Err(e) => return done.finish(ctx, Err(e)),
            };
            let bound = pipe.clone();
            let next = done.clone();
            done.step(ctx, move |ctx| {
                pipe.bind_async(ctx, &interfaces::LSARPC, move |ctx, result| match result {
                    Ok(()) => lookup_open_policy(ctx, bound, system_name, sids, next),
                    Err(e) => {
                        close_then(ctx, bound.file_id(), Some(bound.tree_id()), next, Err(e))
                    }
                })
            });
        })?;
        Ok(())
    }
}

fn lookup_open_policy(
    ctx: &mut Context,
    pipe: RpcPipe,
    system_name: String,
    sids: Vec<Sid>,
    done: Chain<Vec<ResolvedName>>,
) {
    let req = OpenPolicy2Request {
        system_name: Some(system_name),
        desired_access: POLICY_LOOKUP_NAMES,
    };
    let p = pipe.clone();
    let next = done.clone();
    done.step(ctx, move |ctx| {
        p.call_async(ctx, opnum::OPEN_POLICY2, &req, move |ctx, result| {
            let handle = result.and_then(|rep: OpenPolicy2Reply| {
                check_ntstatus(rep.status)?;
                Ok(rep.handle)
            });
            match handle {
                Ok(handle) => lookup_sids(ctx, pipe, handle, sids, next),
                Err(e) => {
                    close_then(ctx, pipe.file_id(), Some(pipe.tree_id()), next, Err(e))
                }
            }
        })
    });
}

fn lookup_sids(
    ctx: &mut Context,
    pipe: RpcPipe,
    handle: PolicyHandle,
    sids: Vec<Sid>,
    done: Chain<Vec<ResolvedName>>,
) {
    let req = LookupSids2Request::new(handle, sids.clone());
    let p = pipe.clone();
    let next = done.clone();
    done.step(ctx, move |ctx| {
        p.call_async(ctx, opnum::LOOKUP_SIDS2, &req, move |ctx, result| {
            let resolved = result.and_then(|rep: LookupSids2Reply| {
                check_ntstatus(rep.status)?;
                debug!(mapped = rep.mapped_count, "sids looked up");
                Ok(rep.resolve(&sids))
            });
            lookup_close_policy(ctx, pipe, handle, resolved, next);
        })
    });
}

fn lookup_close_policy(
    ctx: &mut Context,
    pipe: RpcPipe,
    handle: PolicyHandle,
    resolved: Result<Vec<ResolvedName>>,
    done: Chain<Vec<ResolvedName>>,
) {
    let req = CloseRequest { handle };
    let slot = Rc::new(RefCell::new(Some((done, resolved))));
    let pending = slot.clone();
    let p = pipe.clone();
    let sent = pipe.call_async(ctx, opnum::CLOSE, &req, move |ctx, result| {
        if let Err(e) = result.and_then(|rep: CloseReply| check_ntstatus(rep.status)) {
            debug!(error = %e, "policy close failed");
        }
        if let Some((done, resolved)) = pending.borrow_mut().take() {
            close_then(ctx, p.file_id(), Some(p.tree_id()), done, resolved);
        }
    });
    if let Err(e) = sent {
        debug!(error = %e, "policy close not sent");
        if let Some((done, resolved)) = slot.borrow_mut().take() {
            close_then(ctx, pipe.file_id(), Some(pipe.tree_id()), done, resolved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> Sid {
        s.parse().unwrap()
    }

    #[test]
    fn test_open_policy2_ndr32_layout() {
        let req = OpenPolicy2Request {
            system_name: Some("\\\\h".into()),
            desired_access: POLICY_LOOKUP_NAMES,
        };
        let mut enc = NdrEncoder::new(false);
        req.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        // ptr + 3 counts + "\\h\0" (8 bytes) + attributes (24) + access
        assert_eq!(bytes.len(), 4 + 12 + 8 + 24 + 4);
        assert_eq!(&bytes[24..28], &OBJECT_ATTRIBUTES_LEN.to_le_bytes());
        let mut dec = NdrDecoder::new(&bytes, false);
        assert_eq!(OpenPolicy2Request::decode(&mut dec).unwrap(), req);
    }

    #[test]
    fn test_lookup_sids2_request_defers_sids() {
        let req = LookupSids2Request::new(
            PolicyHandle::default(),
            vec![sid("S-1-5-32-544"), sid("S-1-1-0")],
        );
        let mut enc = NdrEncoder::new(false);
        req.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        // handle, count, array pointer, conformance, then both SID pointers
        // precede the first SID body
        assert_eq!(&bytes[20..24], &2u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &2u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &0x0002_0004u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &0x0002_0008u32.to_le_bytes());
        let mut dec = NdrDecoder::new(&bytes, false);
        assert_eq!(LookupSids2Request::decode(&mut dec).unwrap(), req);
    }

    #[test]
    fn test_lookup_sids2_reply_both_syntaxes() {
        let reply = LookupSids2Reply {
            domains: vec![TrustInformation {
                name: "BUILTIN".into(),
                sid: Some(sid("S-1-5-32")),
            }],
            names: vec![
                TranslatedName {
                    sid_type: sid_type::ALIAS,
                    name: "Administrators".into(),
                    domain_index: 0,
                    flags: 0,
                },
                TranslatedName {
                    sid_type: sid_type::WELL_KNOWN_GROUP,
                    name: "Everyone".into(),
                    domain_index: -1,
                    flags: 0,
                },
            ],
            mapped_count: 2,
            status: 0,
        };
        for ndr64 in [false, true] {
            let mut enc = NdrEncoder::new(ndr64);
            reply.encode(&mut enc).unwrap();
            let bytes = enc.into_bytes();
            let mut dec = NdrDecoder::new(&bytes, ndr64);
            assert_eq!(LookupSids2Reply::decode(&mut dec).unwrap(), reply);
            assert_eq!(dec.remaining(), 0);
        }

        let resolved = reply.resolve(&[sid("S-1-5-32-544"), sid("S-1-1-0")]);
        assert_eq!(resolved[0].domain.as_deref(), Some("BUILTIN"));
        assert_eq!(resolved[0].name, "Administrators");
        assert_eq!(resolved[1].domain, None);
    }
}
