//! NTLMv2 key derivation and proof computation

use crate::error::{Error, Result};
use crate::protocol::cursor::{utf16_encode, WriteBuf};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("HMAC error: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// NT one-way function: MD4 of the UTF-16LE password
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md4::digest(utf16_encode(password)));
    out
}

/// NTOWFv2: HMAC-MD5 keyed by the NT hash over upper(user) + domain
pub fn ntowf_v2(user: &str, domain: &str, password: &str) -> Result<[u8; 16]> {
    let identity = utf16_encode(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity])
}

/// Client blob appended to the NTProofStr in an NTLMv2 response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmV2Blob {
    pub timestamp: u64,
    pub client_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl NtlmV2Blob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WriteBuf::with_capacity(32 + self.target_info.len());
        w.put_u8(1);
        w.put_u8(1);
        w.put_zeros(6);
        w.put_u64(self.timestamp);
        w.put_bytes(&self.client_challenge);
        w.put_zeros(4);
        w.put_bytes(&self.target_info);
        w.put_zeros(4);
        w.into_inner()
    }
}

/// NTProofStr over the server challenge and a serialized blob
pub fn nt_proof(ntowf: &[u8; 16], server_challenge: &[u8; 8], blob: &[u8]) -> Result<[u8; 16]> {
    hmac_md5(ntowf, &[server_challenge, blob])
}

/// NtChallengeResponse = NTProofStr || blob
pub fn ntlmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    blob: &NtlmV2Blob,
) -> Result<Vec<u8>> {
    let blob = blob.to_bytes();
    let mut response = nt_proof(ntowf, server_challenge, &blob)?.to_vec();
    response.extend_from_slice(&blob);
    Ok(response)
}

/// LmChallengeResponse for NTLMv2
pub fn lmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>> {
    let mut response = hmac_md5(ntowf, &[server_challenge, client_challenge])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

/// SessionBaseKey = HMAC-MD5(NTOWFv2, NTProofStr)
pub fn session_base_key(ntowf: &[u8; 16], proof: &[u8]) -> Result<[u8; 16]> {
    hmac_md5(ntowf, &[proof])
}

pub fn random_challenge() -> [u8; 8] {
    rand::random()
}
