//! Authentication and message-protection seams for SMB sessions
//!
//! The engine never looks inside a security token. Session setup hands the
//! server's token to an [`Authenticator`] and sends back whatever it
//! produces; the server role does the same through [`ServerAuthenticator`].
//! Signing and sealing go through [`MessageCrypto`].

pub mod ntlm;
pub mod ntlm_crypto;

use crate::error::Result;

pub use ntlm::{NtlmClient, NtlmServer};

/// Client side of a session-setup security mechanism.
pub trait Authenticator {
    /// Token carried by the first SESSION_SETUP request.
    fn initial_token(&mut self) -> Result<Vec<u8>>;

    /// Token answering a server token received with
    /// MORE_PROCESSING_REQUIRED.
    fn next_token(&mut self, server_token: &[u8]) -> Result<Vec<u8>>;

    /// Session base key, once the exchange is complete.
    fn session_key(&self) -> Option<Vec<u8>>;
}

/// Identity a server mechanism extracted from the client's final token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientIdentity {
    pub user: String,
    pub domain: String,
    pub workstation: String,
}

impl ClientIdentity {
    pub fn is_anonymous(&self) -> bool {
        self.user.is_empty()
    }
}

/// Answer of the server application to a logon attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAuthorization {
    Deny,
    /// Accept without checking the proof
    Allow,
    /// Accept if the client proves knowledge of this password
    Password(String),
}

/// Outcome of feeding one client token to a server mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptStep {
    /// Send this token back with MORE_PROCESSING_REQUIRED
    Continue(Vec<u8>),
    /// The client sent its final token; the identity still needs
    /// authorizing before [`ServerAuthenticator::verify`] is called.
    Complete(ClientIdentity),
}

/// Server side of a session-setup security mechanism.
pub trait ServerAuthenticator {
    fn accept(&mut self, client_token: &[u8]) -> Result<AcceptStep>;

    /// Check the client's proof against the authorization decision.
    fn verify(&mut self, authorization: &UserAuthorization) -> Result<()>;

    fn session_key(&self) -> Option<Vec<u8>>;
}

/// Factory for client mechanisms, stored in the connection config.
pub type AuthenticatorFactory =
    std::rc::Rc<dyn Fn(&crate::connection::ContextConfig) -> Box<dyn Authenticator>>;

/// Builds the signing/sealing provider from a session key and dialect.
pub type CryptoFactory = std::rc::Rc<dyn Fn(&[u8], u16) -> Result<Box<dyn MessageCrypto>>>;

/// Signing and sealing primitives for an established session.
///
/// `sign` fills the signature field of one header+body link in place;
/// `encrypt` returns the ciphertext and the 16 byte transform signature.
pub trait MessageCrypto {
    fn sign(&self, message: &mut [u8]) -> Result<()>;

    fn verify(&self, message: &[u8]) -> Result<()>;

    fn encrypt(&self, nonce: &[u8; 16], aad: &[u8], plaintext: &[u8])
        -> Result<(Vec<u8>, [u8; 16])>;

    fn decrypt(
        &self,
        nonce: &[u8; 16],
        aad: &[u8],
        ciphertext: &[u8],
        signature: &[u8; 16],
    ) -> Result<Vec<u8>>;
}

/// Default client mechanism: NTLM with the credentials from the config.
pub fn ntlm_factory() -> AuthenticatorFactory {
    std::rc::Rc::new(|config| {
        Box::new(NtlmClient::new(
            config.user.clone(),
            config.password.clone(),
            config.domain.clone(),
            config.workstation.clone(),
        ))
    })
}
