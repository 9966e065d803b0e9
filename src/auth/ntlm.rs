//! Raw NTLMSSP for both session-setup roles
//!
//! Only NTLMv2 responses are produced or accepted. Key exchange is never
//! negotiated, so the session key is the SessionBaseKey.

use super::ntlm_crypto::{
    lmv2_response, nt_proof, ntlmv2_response, ntowf_v2, random_challenge, session_base_key,
    NtlmV2Blob,
};
use super::{AcceptStep, Authenticator, ClientIdentity, ServerAuthenticator, UserAuthorization};
use crate::error::{Error, Result};
use crate::protocol::cursor::{utf16_decode, utf16_encode, ReadCursor, WriteBuf};
use crate::protocol::messages::file_info::filetime_now;
use bitflags::bitflags;
use tracing::debug;

pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_MESSAGE: u32 = 1;
const CHALLENGE_MESSAGE: u32 = 2;
const AUTHENTICATE_MESSAGE: u32 = 3;

bitflags! {
    /// NTLM negotiate flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NtlmFlags: u32 {
        const NEGOTIATE_UNICODE = 0x0000_0001;
        const REQUEST_TARGET = 0x0000_0004;
        const NEGOTIATE_SIGN = 0x0000_0010;
        const NEGOTIATE_SEAL = 0x0000_0020;
        const NEGOTIATE_NTLM = 0x0000_0200;
        const NEGOTIATE_ANONYMOUS = 0x0000_0800;
        const NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const NEGOTIATE_EXTENDED_SESSIONSECURITY = 0x0008_0000;
        const NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const NEGOTIATE_VERSION = 0x0200_0000;
        const NEGOTIATE_128 = 0x2000_0000;
        const NEGOTIATE_KEY_EXCH = 0x4000_0000;
        const NEGOTIATE_56 = 0x8000_0000;
    }
}

impl NtlmFlags {
    fn client_default() -> Self {
        Self::NEGOTIATE_UNICODE
            | Self::REQUEST_TARGET
            | Self::NEGOTIATE_NTLM
            | Self::NEGOTIATE_ALWAYS_SIGN
            | Self::NEGOTIATE_EXTENDED_SESSIONSECURITY
            | Self::NEGOTIATE_TARGET_INFO
            | Self::NEGOTIATE_128
            | Self::NEGOTIATE_56
    }
}

/// AV_PAIR ids used in the challenge target info
pub mod av_id {
    pub const EOL: u16 = 0;
    pub const NB_COMPUTER_NAME: u16 = 1;
    pub const NB_DOMAIN_NAME: u16 = 2;
    pub const DNS_COMPUTER_NAME: u16 = 3;
    pub const DNS_DOMAIN_NAME: u16 = 4;
    pub const TIMESTAMP: u16 = 7;
}

/// Read the (len, maxlen, offset) descriptor at the cursor and borrow the
/// field it points at.
fn read_field<'a>(cur: &mut ReadCursor<'_>, message: &'a [u8]) -> Result<&'a [u8]> {
    let len = cur.u16()? as usize;
    cur.skip(2)?;
    let offset = cur.u32()? as usize;
    if len == 0 {
        return Ok(&[]);
    }
    message
        .get(offset..offset + len)
        .ok_or_else(|| Error::parse("NTLM field runs past the message"))
}

/// Lays out the fixed descriptors and the payload of one NTLM message.
struct FieldWriter {
    head: WriteBuf,
    payload: Vec<u8>,
    payload_start: usize,
}

impl FieldWriter {
    fn new(message_type: u32, payload_start: usize) -> Self {
        let mut head = WriteBuf::with_capacity(payload_start);
        head.put_bytes(NTLMSSP_SIGNATURE);
        head.put_u32(message_type);
        Self {
            head,
            payload: Vec::new(),
            payload_start,
        }
    }

    fn field(&mut self, data: &[u8]) {
        let offset = if data.is_empty() {
            0
        } else {
            self.payload_start + self.payload.len()
        };
        self.head.put_u16(data.len() as u16);
        self.head.put_u16(data.len() as u16);
        self.head.put_u32(offset as u32);
        self.payload.extend_from_slice(data);
    }

    fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.head.len(), self.payload_start);
        let mut out = self.head.into_inner();
        out.extend_from_slice(&self.payload);
        out
    }
}

fn check_header(cur: &mut ReadCursor<'_>, expected: u32) -> Result<()> {
    if cur.bytes(8)? != NTLMSSP_SIGNATURE {
        return Err(Error::AuthenticationFailed("bad NTLMSSP signature".into()));
    }
    let message_type = cur.u32()?;
    if message_type != expected {
        return Err(Error::AuthenticationFailed(format!(
            "expected NTLM message type {}, got {}",
            expected, message_type
        )));
    }
    Ok(())
}

fn message_type(token: &[u8]) -> Result<u32> {
    let mut cur = ReadCursor::new(token);
    if cur.bytes(8)? != NTLMSSP_SIGNATURE {
        return Err(Error::AuthenticationFailed("bad NTLMSSP signature".into()));
    }
    cur.u32()
}

/// Type 1 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateMessage {
    pub flags: NtlmFlags,
}

impl NegotiateMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = FieldWriter::new(NEGOTIATE_MESSAGE, 32);
        w.head.put_u32(self.flags.bits());
        w.field(&[]);
        w.field(&[]);
        w.finish()
    }

    pub fn parse(token: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(token);
        check_header(&mut cur, NEGOTIATE_MESSAGE)?;
        Ok(Self {
            flags: NtlmFlags::from_bits_retain(cur.u32()?),
        })
    }
}

/// Type 2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub flags: NtlmFlags,
    pub server_challenge: [u8; 8],
    pub target_name: String,
    pub target_info: Vec<u8>,
}

impl ChallengeMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = FieldWriter::new(CHALLENGE_MESSAGE, 48);
        w.field(&utf16_encode(&self.target_name));
        w.head.put_u32(self.flags.bits());
        w.head.put_bytes(&self.server_challenge);
        w.head.put_zeros(8);
        w.field(&self.target_info);
        w.finish()
    }

    pub fn parse(token: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(token);
        check_header(&mut cur, CHALLENGE_MESSAGE)?;
        let target_name = utf16_decode(read_field(&mut cur, token)?)?;
        let flags = NtlmFlags::from_bits_retain(cur.u32()?);
        let server_challenge = cur.array::<8>()?;
        cur.skip(8)?;
        let target_info = read_field(&mut cur, token)?.to_vec();
        Ok(Self {
            flags,
            server_challenge,
            target_name,
            target_info,
        })
    }
}

/// Type 3 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateMessage {
    pub flags: NtlmFlags,
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    pub domain: String,
    pub user: String,
    pub workstation: String,
    pub encrypted_session_key: Vec<u8>,
}

impl AuthenticateMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = FieldWriter::new(AUTHENTICATE_MESSAGE, 64);
        w.field(&self.lm_response);
        w.field(&self.nt_response);
        w.field(&utf16_encode(&self.domain));
        w.field(&utf16_encode(&self.user));
        w.field(&utf16_encode(&self.workstation));
        w.field(&self.encrypted_session_key);
        w.head.put_u32(self.flags.bits());
        w.finish()
    }

    pub fn parse(token: &[u8]) -> Result<Self> {
        let mut cur = ReadCursor::new(token);
        check_header(&mut cur, AUTHENTICATE_MESSAGE)?;
        let lm_response = read_field(&mut cur, token)?.to_vec();
        let nt_response = read_field(&mut cur, token)?.to_vec();
        let domain = utf16_decode(read_field(&mut cur, token)?)?;
        let user = utf16_decode(read_field(&mut cur, token)?)?;
        let workstation = utf16_decode(read_field(&mut cur, token)?)?;
        let encrypted_session_key = read_field(&mut cur, token)?.to_vec();
        let flags = NtlmFlags::from_bits_retain(cur.u32()?);
        Ok(Self {
            flags,
            lm_response,
            nt_response,
            domain,
            user,
            workstation,
            encrypted_session_key,
        })
    }
}

/// Build an AV_PAIR list terminated by MsvAvEOL.
pub fn build_target_info(pairs: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut w = WriteBuf::new();
    for (id, value) in pairs {
        w.put_u16(*id);
        w.put_u16(value.len() as u16);
        w.put_bytes(value);
    }
    w.put_u16(av_id::EOL);
    w.put_u16(0);
    w.into_inner()
}

/// Look up one AV_PAIR value.
pub fn find_av_pair(target_info: &[u8], wanted: u16) -> Option<&[u8]> {
    let mut cur = ReadCursor::new(target_info);
    loop {
        let id = cur.u16().ok()?;
        let len = cur.u16().ok()? as usize;
        if id == av_id::EOL {
            return None;
        }
        let value = cur.bytes(len).ok()?;
        if id == wanted {
            return Some(value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Initial,
    NegotiateSent,
    Done,
}

/// Client NTLM mechanism
pub struct NtlmClient {
    user: String,
    password: String,
    domain: String,
    workstation: String,
    state: ClientState,
    session_key: Option<[u8; 16]>,
}

impl NtlmClient {
    pub fn new(user: String, password: String, domain: String, workstation: String) -> Self {
        Self {
            user,
            password,
            domain,
            workstation,
            state: ClientState::Initial,
            session_key: None,
        }
    }

    fn authenticate(&mut self, challenge: &ChallengeMessage) -> Result<AuthenticateMessage> {
        let mut flags = NtlmFlags::client_default() & challenge.flags;
        flags |= NtlmFlags::NEGOTIATE_UNICODE | NtlmFlags::NEGOTIATE_NTLM;

        if self.user.is_empty() {
            flags |= NtlmFlags::NEGOTIATE_ANONYMOUS;
            return Ok(AuthenticateMessage {
                flags,
                lm_response: vec![0],
                nt_response: Vec::new(),
                domain: String::new(),
                user: String::new(),
                workstation: self.workstation.clone(),
                encrypted_session_key: Vec::new(),
            });
        }

        let timestamp = find_av_pair(&challenge.target_info, av_id::TIMESTAMP)
            .and_then(|v| <[u8; 8]>::try_from(v).ok())
            .map(u64::from_le_bytes)
            .unwrap_or_else(filetime_now);
        let client_challenge = random_challenge();
        let ntowf = ntowf_v2(&self.user, &self.domain, &self.password)?;
        let blob = NtlmV2Blob {
            timestamp,
            client_challenge,
            target_info: challenge.target_info.clone(),
        };
        let nt_response = ntlmv2_response(&ntowf, &challenge.server_challenge, &blob)?;
        let lm_response = lmv2_response(&ntowf, &challenge.server_challenge, &client_challenge)?;
        self.session_key = Some(session_base_key(&ntowf, &nt_response[..16])?);

        Ok(AuthenticateMessage {
            flags,
            lm_response,
            nt_response,
            domain: self.domain.clone(),
            user: self.user.clone(),
            workstation: self.workstation.clone(),
            encrypted_session_key: Vec::new(),
        })
    }
}

impl Authenticator for NtlmClient {
    fn initial_token(&mut self) -> Result<Vec<u8>> {
        self.state = ClientState::NegotiateSent;
        Ok(NegotiateMessage {
            flags: NtlmFlags::client_default(),
        }
        .to_bytes())
    }

    fn next_token(&mut self, server_token: &[u8]) -> Result<Vec<u8>> {
        if self.state != ClientState::NegotiateSent {
            return Err(Error::AuthenticationFailed(
                "unexpected NTLM challenge".into(),
            ));
        }
        let challenge = ChallengeMessage::parse(server_token)?;
        debug!(target_name = %challenge.target_name, "NTLM challenge received");
        let auth = self.authenticate(&challenge)?;
        self.state = ClientState::Done;
        Ok(auth.to_bytes())
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        self.session_key.map(|k| k.to_vec())
    }
}

/// Server NTLM mechanism
pub struct NtlmServer {
    target_name: String,
    computer_name: String,
    server_challenge: [u8; 8],
    authenticate: Option<AuthenticateMessage>,
    session_key: Option<[u8; 16]>,
}

impl NtlmServer {
    pub fn new(target_name: impl Into<String>, computer_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            computer_name: computer_name.into(),
            server_challenge: random_challenge(),
            authenticate: None,
            session_key: None,
        }
    }

    fn challenge(&self, client_flags: NtlmFlags) -> ChallengeMessage {
        let target_info = build_target_info(&[
            (av_id::NB_DOMAIN_NAME, utf16_encode(&self.target_name)),
            (av_id::NB_COMPUTER_NAME, utf16_encode(&self.computer_name)),
            (av_id::DNS_DOMAIN_NAME, utf16_encode(&self.target_name)),
            (av_id::DNS_COMPUTER_NAME, utf16_encode(&self.computer_name)),
            (av_id::TIMESTAMP, filetime_now().to_le_bytes().to_vec()),
        ]);
        ChallengeMessage {
            flags: (client_flags & NtlmFlags::client_default())
                | NtlmFlags::NEGOTIATE_UNICODE
                | NtlmFlags::NEGOTIATE_NTLM
                | NtlmFlags::NEGOTIATE_TARGET_INFO
                | NtlmFlags::TARGET_TYPE_SERVER,
            server_challenge: self.server_challenge,
            target_name: self.target_name.clone(),
            target_info,
        }
    }

    fn check_proof(&mut self, auth: &AuthenticateMessage, password: &str) -> Result<()> {
        if auth.nt_response.len() < 16 + 28 {
            return Err(Error::AuthenticationFailed(
                "NTLMv2 response too short".into(),
            ));
        }
        let (proof, blob) = auth.nt_response.split_at(16);
        // some clients hash the identity without a domain
        for domain in [auth.domain.as_str(), ""] {
            let ntowf = ntowf_v2(&auth.user, domain, password)?;
            if nt_proof(&ntowf, &self.server_challenge, blob)?[..] == *proof {
                self.session_key = Some(session_base_key(&ntowf, proof)?);
                return Ok(());
            }
        }
        Err(Error::AuthenticationFailed(format!(
            "bad NTLMv2 proof for user {}",
            auth.user
        )))
    }
}

impl ServerAuthenticator for NtlmServer {
    fn accept(&mut self, client_token: &[u8]) -> Result<AcceptStep> {
        match message_type(client_token)? {
            NEGOTIATE_MESSAGE => {
                let negotiate = NegotiateMessage::parse(client_token)?;
                Ok(AcceptStep::Continue(self.challenge(negotiate.flags).to_bytes()))
            }
            AUTHENTICATE_MESSAGE => {
                let auth = AuthenticateMessage::parse(client_token)?;
                let identity = ClientIdentity {
                    user: auth.user.clone(),
                    domain: auth.domain.clone(),
                    workstation: auth.workstation.clone(),
                };
                self.authenticate = Some(auth);
                Ok(AcceptStep::Complete(identity))
            }
            other => Err(Error::AuthenticationFailed(format!(
                "unexpected NTLM message type {}",
                other
            ))),
        }
    }

    fn verify(&mut self, authorization: &UserAuthorization) -> Result<()> {
        let auth = self
            .authenticate
            .take()
            .ok_or_else(|| Error::AuthenticationFailed("no AUTHENTICATE message".into()))?;
        match authorization {
            UserAuthorization::Deny => Err(Error::AuthenticationFailed(format!(
                "user {} not authorized",
                auth.user
            ))),
            UserAuthorization::Allow => Ok(()),
            UserAuthorization::Password(password) => self.check_proof(&auth, password),
        }
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        self.session_key.map(|k| k.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(password: &str, server_password: &str) -> Result<()> {
        let mut client = NtlmClient::new(
            "alice".into(),
            password.into(),
            "WORKGROUP".into(),
            "laptop".into(),
        );
        let mut server = NtlmServer::new("WORKGROUP", "fileserver");

        let negotiate = client.initial_token()?;
        let challenge = match server.accept(&negotiate)? {
            AcceptStep::Continue(token) => token,
            other => panic!("unexpected {:?}", other),
        };
        let authenticate = client.next_token(&challenge)?;
        match server.accept(&authenticate)? {
            AcceptStep::Complete(id) => {
                assert_eq!(id.user, "alice");
                assert_eq!(id.domain, "WORKGROUP");
                assert_eq!(id.workstation, "laptop");
            }
            other => panic!("unexpected {:?}", other),
        }
        server.verify(&UserAuthorization::Password(server_password.into()))?;
        assert_eq!(client.session_key(), server.session_key());
        Ok(())
    }

    #[test]
    fn test_full_exchange() {
        exchange("secret", "secret").unwrap();
    }

    #[test]
    fn test_wrong_password_rejected() {
        assert!(matches!(
            exchange("secret", "other"),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_anonymous_client() {
        let mut client = NtlmClient::new(String::new(), String::new(), String::new(), "ws".into());
        let mut server = NtlmServer::new("D", "S");
        let challenge = match server.accept(&client.initial_token().unwrap()).unwrap() {
            AcceptStep::Continue(token) => token,
            other => panic!("unexpected {:?}", other),
        };
        let auth = AuthenticateMessage::parse(&client.next_token(&challenge).unwrap()).unwrap();
        assert!(auth.flags.contains(NtlmFlags::NEGOTIATE_ANONYMOUS));
        assert!(auth.nt_response.is_empty());
        assert!(client.session_key().is_none());
    }

    #[test]
    fn test_challenge_parse_and_target_info() {
        let server = NtlmServer::new("DOM", "HOST");
        let msg = server.challenge(NtlmFlags::client_default());
        let parsed = ChallengeMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(
            find_av_pair(&parsed.target_info, av_id::NB_COMPUTER_NAME).unwrap(),
            &utf16_encode("HOST")[..]
        );
        assert!(find_av_pair(&parsed.target_info, av_id::TIMESTAMP).is_some());
    }

    #[test]
    fn test_challenge_before_negotiate_rejected() {
        let mut client = NtlmClient::new("a".into(), "b".into(), "c".into(), "d".into());
        assert!(client.next_token(b"NTLMSSP\0").is_err());
        assert!(NegotiateMessage::parse(b"NTLMSSQ\0\x01\0\0\0\0\0\0\0").is_err());
    }
}
