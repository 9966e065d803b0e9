//! SMB2 NEGOTIATE messages and SMB 3.1.1 negotiate contexts

use super::common::{wire_offset, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::cursor::{body_slice, variable_extent, ReadCursor, WriteBuf};
use crate::protocol::smb2_constants::{
    dialect, negotiate_context, structure_size, Capabilities, SecurityMode, Smb2Command,
    SMB2_HEADER_SIZE,
};
use uuid::Uuid;

/// One negotiate context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateContext {
    PreauthIntegrity {
        hash_algorithms: Vec<u16>,
        salt: Vec<u8>,
    },
    Encryption {
        ciphers: Vec<u16>,
    },
    /// Any context type the engine does not interpret
    Other {
        context_type: u16,
        data: Vec<u8>,
    },
}

impl NegotiateContext {
    /// SHA-512 preauth integrity with a fresh random salt.
    pub fn preauth_sha512() -> Self {
        let salt: [u8; negotiate_context::PREAUTH_SALT_SIZE] = rand::random();
        NegotiateContext::PreauthIntegrity {
            hash_algorithms: vec![negotiate_context::HASH_SHA_512],
            salt: salt.to_vec(),
        }
    }

    pub fn encryption_aes128() -> Self {
        NegotiateContext::Encryption {
            ciphers: vec![
                negotiate_context::CIPHER_AES_128_GCM,
                negotiate_context::CIPHER_AES_128_CCM,
            ],
        }
    }

    fn context_type(&self) -> u16 {
        match self {
            NegotiateContext::PreauthIntegrity { .. } => {
                negotiate_context::PREAUTH_INTEGRITY_CAPABILITIES
            }
            NegotiateContext::Encryption { .. } => negotiate_context::ENCRYPTION_CAPABILITIES,
            NegotiateContext::Other { context_type, .. } => *context_type,
        }
    }

    fn data(&self) -> Vec<u8> {
        let mut w = WriteBuf::new();
        match self {
            NegotiateContext::PreauthIntegrity {
                hash_algorithms,
                salt,
            } => {
                w.put_u16(hash_algorithms.len() as u16);
                w.put_u16(salt.len() as u16);
                for alg in hash_algorithms {
                    w.put_u16(*alg);
                }
                w.put_bytes(salt);
            }
            NegotiateContext::Encryption { ciphers } => {
                w.put_u16(ciphers.len() as u16);
                for c in ciphers {
                    w.put_u16(*c);
                }
            }
            NegotiateContext::Other { data, .. } => w.put_bytes(data),
        }
        w.into_inner()
    }

    fn parse_data(context_type: u16, data: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(data);
        Ok(match context_type {
            negotiate_context::PREAUTH_INTEGRITY_CAPABILITIES => {
                let count = cur.u16()? as usize;
                let salt_len = cur.u16()? as usize;
                let hash_algorithms = (0..count).map(|_| cur.u16()).collect::<Result<_>>()?;
                let salt = cur.bytes(salt_len)?.to_vec();
                NegotiateContext::PreauthIntegrity {
                    hash_algorithms,
                    salt,
                }
            }
            negotiate_context::ENCRYPTION_CAPABILITIES => {
                let count = cur.u16()? as usize;
                let ciphers = (0..count).map(|_| cur.u16()).collect::<Result<_>>()?;
                NegotiateContext::Encryption { ciphers }
            }
            _ => NegotiateContext::Other {
                context_type,
                data: data.to_vec(),
            },
        })
    }
}

/// Write contexts 8-byte aligned; returns the wire offset of the first one.
fn write_contexts(w: &mut WriteBuf, contexts: &[NegotiateContext]) -> u32 {
    w.pad_to(8);
    let offset = wire_offset(w) as u32;
    for (i, ctx) in contexts.iter().enumerate() {
        if i > 0 {
            w.pad_to(8);
        }
        let data = ctx.data();
        w.put_u16(ctx.context_type());
        w.put_u16(data.len() as u16);
        w.put_u32(0);
        w.put_bytes(&data);
    }
    offset
}

fn read_contexts(body: &[u8], offset: u32, count: u16) -> Result<Vec<NegotiateContext>> {
    let start = (offset as usize)
        .checked_sub(SMB2_HEADER_SIZE)
        .ok_or_else(|| Error::InvalidOffset(format!("negotiate context offset {}", offset)))?;
    let mut cur = ReadCursor::new(body);
    cur.seek(start)?;
    let mut contexts = Vec::with_capacity(count as usize);
    for i in 0..count {
        if i > 0 {
            cur.align(8)?;
        }
        let context_type = cur.u16()?;
        let len = cur.u16()? as usize;
        cur.skip(4)?;
        let data = cur.bytes(len)?;
        contexts.push(NegotiateContext::parse_data(context_type, data)?);
    }
    Ok(contexts)
}

/// SMB2 NEGOTIATE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateRequest {
    pub security_mode: SecurityMode,
    pub capabilities: Capabilities,
    pub client_guid: Uuid,
    pub dialects: Vec<u16>,
    pub contexts: Vec<NegotiateContext>,
}

impl Smb2NegotiateRequest {
    pub fn new(dialects: Vec<u16>) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Capabilities::LARGE_MTU,
            client_guid: Uuid::new_v4(),
            dialects,
            contexts: Vec::new(),
        }
    }

    pub fn offers(&self, d: u16) -> bool {
        self.dialects.contains(&d)
    }
}

impl SmbMessage for Smb2NegotiateRequest {
    const COMMAND: Smb2Command = Smb2Command::Negotiate;
    const STRUCTURE_SIZE: u16 = structure_size::NEGOTIATE_REQUEST;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.skip(2)?;
        let dialect_count = cur.u16()? as usize;
        Ok(dialect_count * 2)
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("NEGOTIATE", Self::STRUCTURE_SIZE)?;
        let dialect_count = cur.u16()? as usize;
        let security_mode = SecurityMode::from_bits_truncate(cur.u16()?);
        cur.skip(2)?;
        let capabilities = Capabilities::from_bits_truncate(cur.u32()?);
        let client_guid = Uuid::from_bytes(cur.array::<16>()?);
        let context_offset = cur.u32()?;
        let context_count = cur.u16()?;
        cur.skip(2)?;
        let dialects: Vec<u16> = (0..dialect_count)
            .map(|_| cur.u16())
            .collect::<Result<_>>()?;

        // Only 3.1.1 clients put contexts where ClientStartTime would be.
        let contexts = if dialects.contains(&dialect::SMB3_11) && context_count > 0 {
            read_contexts(body, context_offset, context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            contexts,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let start = w.len();
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_len16("dialect count", self.dialects.len())?;
        w.put_u16(self.security_mode.bits());
        w.put_u16(0);
        w.put_u32(self.capabilities.bits());
        w.put_bytes(self.client_guid.as_bytes());
        // ClientStartTime, or context offset/count for 3.1.1
        w.put_u64(0);
        for d in &self.dialects {
            w.put_u16(*d);
        }
        if self.offers(dialect::SMB3_11) && !self.contexts.is_empty() {
            let offset = write_contexts(w, &self.contexts);
            w.set_u32_at(start + 28, offset)?;
            w.set_u16_at(start + 32, self.contexts.len() as u16)?;
        }
        Ok(())
    }
}

/// SMB2 NEGOTIATE reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2NegotiateResponse {
    pub security_mode: SecurityMode,
    pub dialect_revision: u16,
    pub server_guid: Uuid,
    pub capabilities: Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    /// FILETIME
    pub system_time: u64,
    pub server_start_time: u64,
    pub security_buffer: Vec<u8>,
    pub contexts: Vec<NegotiateContext>,
}

impl Default for Smb2NegotiateResponse {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            dialect_revision: dialect::SMB2_02,
            server_guid: Uuid::nil(),
            capabilities: Capabilities::empty(),
            max_transact_size: 65536,
            max_read_size: 65536,
            max_write_size: 65536,
            system_time: 0,
            server_start_time: 0,
            security_buffer: Vec::new(),
            contexts: Vec::new(),
        }
    }
}

impl SmbMessage for Smb2NegotiateResponse {
    const COMMAND: Smb2Command = Smb2Command::Negotiate;
    const STRUCTURE_SIZE: u16 = structure_size::NEGOTIATE_REPLY;

    fn variable_len(fixed: &[u8]) -> Result<usize> {
        let mut cur = ReadCursor::new(fixed);
        cur.seek(6)?;
        let context_count = cur.u16()?;
        cur.seek(56)?;
        let sec_offset = cur.u16()? as u32;
        let sec_len = cur.u16()? as u32;
        let context_offset = cur.u32()?;
        let mut need = variable_extent(sec_offset, sec_len, Self::fixed_len())?;
        if context_count > 0 {
            // at least one 8 byte context header past the offset
            need = need.max(variable_extent(context_offset, 8, Self::fixed_len())?);
        }
        Ok(need)
    }

    fn parse(body: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(body);
        cur.struct_size("NEGOTIATE", Self::STRUCTURE_SIZE)?;
        let security_mode = SecurityMode::from_bits_truncate(cur.u16()?);
        let dialect_revision = cur.u16()?;
        let context_count = cur.u16()?;
        let server_guid = Uuid::from_bytes(cur.array::<16>()?);
        let capabilities = Capabilities::from_bits_truncate(cur.u32()?);
        let max_transact_size = cur.u32()?;
        let max_read_size = cur.u32()?;
        let max_write_size = cur.u32()?;
        let system_time = cur.u64()?;
        let server_start_time = cur.u64()?;
        let sec_offset = cur.u16()?;
        let sec_len = cur.u16()?;
        let context_offset = cur.u32()?;

        let security_buffer =
            body_slice(body, sec_offset as u32, sec_len as u32, Self::fixed_len())?.to_vec();
        let contexts = if dialect_revision == dialect::SMB3_11 && context_count > 0 {
            read_contexts(body, context_offset, context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            dialect_revision,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_buffer,
            contexts,
        })
    }

    fn serialize(&self, w: &mut WriteBuf) -> Result<()> {
        let start = w.len();
        let with_contexts = self.dialect_revision == dialect::SMB3_11 && !self.contexts.is_empty();
        w.put_u16(Self::STRUCTURE_SIZE);
        w.put_u16(self.security_mode.bits());
        w.put_u16(self.dialect_revision);
        w.put_u16(if with_contexts {
            self.contexts.len() as u16
        } else {
            0
        });
        w.put_bytes(self.server_guid.as_bytes());
        w.put_u32(self.capabilities.bits());
        w.put_u32(self.max_transact_size);
        w.put_u32(self.max_read_size);
        w.put_u32(self.max_write_size);
        w.put_u64(self.system_time);
        w.put_u64(self.server_start_time);
        let sec_offset = if self.security_buffer.is_empty() {
            0
        } else {
            SMB2_HEADER_SIZE + 64
        };
        w.put_u16(sec_offset as u16);
        w.put_len16("security buffer", self.security_buffer.len())?;
        w.put_u32(0);
        if self.security_buffer.is_empty() {
            w.put_u8(0);
        } else {
            w.put_bytes(&self.security_buffer);
        }
        if with_contexts {
            let offset = write_contexts(w, &self.contexts);
            w.set_u32_at(start + 60, offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::common::decode_body;

    #[test]
    fn test_request_dialects_and_contexts() {
        let mut req = Smb2NegotiateRequest::new(vec![0x0202, 0x0210, 0x0300, 0x0302, 0x0311]);
        req.capabilities |= Capabilities::ENCRYPTION;
        req.contexts = vec![
            NegotiateContext::preauth_sha512(),
            NegotiateContext::encryption_aes128(),
        ];
        let bytes = req.to_bytes().unwrap();
        // dialects end at 36 + 10 = 46, contexts start 8 aligned on the wire
        let ctx_offset = u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
        assert_eq!(ctx_offset as usize % 8, 0);
        assert_eq!(ctx_offset, 64 + 48);
        let parsed: Smb2NegotiateRequest = decode_body(&bytes).unwrap();
        assert_eq!(parsed, req);
        match &parsed.contexts[0] {
            NegotiateContext::PreauthIntegrity { salt, .. } => assert_eq!(salt.len(), 32),
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[test]
    fn test_request_without_311_has_no_contexts() {
        let req = Smb2NegotiateRequest::new(vec![0x0202, 0x0210]);
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), 36 + 4);
        let parsed: Smb2NegotiateRequest = decode_body(&bytes).unwrap();
        assert!(parsed.contexts.is_empty());
        assert_eq!(parsed.dialects, vec![0x0202, 0x0210]);
    }

    #[test]
    fn test_response_with_security_buffer() {
        let rep = Smb2NegotiateResponse {
            dialect_revision: 0x0302,
            server_guid: Uuid::new_v4(),
            capabilities: Capabilities::LARGE_MTU | Capabilities::ENCRYPTION,
            max_read_size: 8 * 1024 * 1024,
            security_buffer: vec![0x60, 0x01, 0x02],
            ..Default::default()
        };
        let bytes = rep.to_bytes().unwrap();
        let parsed: Smb2NegotiateResponse = decode_body(&bytes).unwrap();
        assert_eq!(parsed, rep);
    }

    #[test]
    fn test_response_security_buffer_out_of_range() {
        let rep = Smb2NegotiateResponse {
            security_buffer: vec![1, 2, 3, 4],
            ..Default::default()
        };
        let mut bytes = rep.to_bytes().unwrap();
        // claim a longer buffer than the body holds
        bytes[58] = 40;
        assert!(decode_body::<Smb2NegotiateResponse>(&bytes).is_err());
        // offset pointing back into the fixed part
        let mut bytes = rep.to_bytes().unwrap();
        bytes[56] = 64;
        assert!(matches!(
            decode_body::<Smb2NegotiateResponse>(&bytes),
            Err(Error::InvalidOffset(_))
        ));
    }

    #[test]
    fn test_response_311_contexts() {
        let rep = Smb2NegotiateResponse {
            dialect_revision: 0x0311,
            contexts: vec![
                NegotiateContext::preauth_sha512(),
                NegotiateContext::Encryption {
                    ciphers: vec![negotiate_context::CIPHER_AES_128_GCM],
                },
            ],
            ..Default::default()
        };
        let parsed: Smb2NegotiateResponse = decode_body(&rep.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.contexts, rep.contexts);
    }
}
