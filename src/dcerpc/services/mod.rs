//! Interface coders
//!
//! Each operation is a request/reply pair of [`NdrCoder`] types that can be
//! coded in both directions, so the same definitions serve a caller and a
//! test peer.

pub mod lsa;
pub mod srvsvc;

use crate::dcerpc::ndr::{NdrCoder, NdrDecoder, NdrEncoder};
use crate::error::{Error, NtStatus, Result};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque server-side handle returned by open operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyHandle {
    pub attributes: u32,
    pub uuid: Uuid,
}

impl NdrCoder for PolicyHandle {
    fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        enc.u32(self.attributes);
        enc.bytes(&self.uuid.to_bytes_le());
        Ok(())
    }

    fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let attributes = dec.u32()?;
        let raw: [u8; 16] = dec
            .bytes(16)?
            .try_into()
            .map_err(|_| Error::parse("short policy handle"))?;
        Ok(Self {
            attributes,
            uuid: Uuid::from_bytes_le(raw),
        })
    }
}

/// Security identifier, `S-1-5-21-...`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid {
    pub revision: u8,
    pub identifier_authority: [u8; 6],
    pub sub_authorities: Vec<u32>,
}

impl Sid {
    /// Conformant structure: the sub-authority count is hoisted in front.
    pub fn encode(&self, enc: &mut NdrEncoder) -> Result<()> {
        enc.conformance(self.sub_authorities.len())?;
        enc.u8(self.revision);
        enc.u8(self.sub_authorities.len() as u8);
        enc.bytes(&self.identifier_authority);
        for &sub in &self.sub_authorities {
            enc.u32(sub);
        }
        Ok(())
    }

    pub fn decode(dec: &mut NdrDecoder<'_>) -> Result<Self> {
        let conformance = dec.conformance(4)?;
        let revision = dec.u8()?;
        let count = dec.u8()? as usize;
        if count != conformance {
            return Err(Error::Rpc(format!(
                "SID sub-authority count {} disagrees with conformance {}",
                count, conformance
            )));
        }
        let mut identifier_authority = [0u8; 6];
        identifier_authority.copy_from_slice(dec.bytes(6)?);
        let sub_authorities = (0..count).map(|_| dec.u32()).collect::<Result<_>>()?;
        Ok(Self {
            revision,
            identifier_authority,
            sub_authorities,
        })
    }

    fn authority(&self) -> u64 {
        self.identifier_authority
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-{}", self.revision, self.authority())?;
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl FromStr for Sid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidParameter(format!("malformed SID {:?}", s));
        let mut parts = s.split('-');
        if !parts.next().is_some_and(|p| p.eq_ignore_ascii_case("S")) {
            return Err(bad());
        }
        let revision = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let authority: u64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        if authority >= 1 << 48 {
            return Err(bad());
        }
        let mut identifier_authority = [0u8; 6];
        identifier_authority.copy_from_slice(&authority.to_be_bytes()[2..]);
        let sub_authorities = parts
            .map(|p| p.parse::<u32>().map_err(|_| bad()))
            .collect::<Result<Vec<_>>>()?;
        if sub_authorities.len() > 15 {
            return Err(bad());
        }
        Ok(Self {
            revision,
            identifier_authority,
            sub_authorities,
        })
    }
}

/// Map an NTSTATUS returned in a reply stub.
pub(crate) fn check_ntstatus(status: u32) -> Result<()> {
    let status = NtStatus(status);
    if status.is_failure() {
        Err(Error::Status(status))
    } else {
        Ok(())
    }
}

/// Map a WERROR returned in a reply stub.
pub(crate) fn check_werror(werror: u32) -> Result<()> {
    match werror {
        0 => Ok(()),
        code => Err(Error::Rpc(format!("WERROR 0x{:08x}", code))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_text_form() {
        let sid: Sid = "S-1-5-21-1004336348-1177238915-682003330-512".parse().unwrap();
        assert_eq!(sid.revision, 1);
        assert_eq!(sid.identifier_authority, [0, 0, 0, 0, 0, 5]);
        assert_eq!(sid.sub_authorities.len(), 5);
        assert_eq!(sid.to_string(), "S-1-5-21-1004336348-1177238915-682003330-512");
        assert!("S-1".parse::<Sid>().is_err());
        assert!("X-1-5".parse::<Sid>().is_err());
    }

    #[test]
    fn test_sid_ndr32_layout() {
        let sid: Sid = "S-1-5-32-544".parse().unwrap();
        let mut enc = NdrEncoder::new(false);
        sid.encode(&mut enc).unwrap();
        let bytes = enc.into_bytes();
        assert_eq!(
            bytes,
            vec![2, 0, 0, 0, 1, 2, 0, 0, 0, 0, 0, 5, 32, 0, 0, 0, 0x20, 0x02, 0, 0]
        );
        let mut dec = NdrDecoder::new(&bytes, false);
        assert_eq!(Sid::decode(&mut dec).unwrap(), sid);
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_ntstatus(0).is_ok());
        assert!(check_ntstatus(0x0000_0107).is_ok());
        assert!(matches!(
            check_ntstatus(0xC000_0073),
            Err(Error::Status(NtStatus::NONE_MAPPED))
        ));
        assert!(check_werror(5).is_err());
    }
}
