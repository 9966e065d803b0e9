//! Caller-configurable connection settings

use crate::auth::{ntlm_factory, AuthenticatorFactory, CryptoFactory};
use crate::dcerpc::Ndr;
use crate::protocol::smb2_constants::{SecurityMode, Version};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Connection configuration
#[derive(Clone)]
pub struct ContextConfig {
    /// Dialects to offer
    pub version: Version,
    pub security_mode: SecurityMode,
    /// Ask for encrypted traffic
    pub seal: bool,
    pub user: String,
    pub password: String,
    pub domain: String,
    pub workstation: String,
    pub client_guid: Uuid,
    /// Per-command timeout; `None` waits forever
    pub timeout: Option<Duration>,
    /// Transfer syntaxes offered by DCE/RPC binds
    pub ndr: Ndr,
    /// Stop the connect flow after session setup
    pub passthrough: bool,
    pub authenticator: AuthenticatorFactory,
    /// Signing/sealing provider, built from the session key
    pub crypto: Option<CryptoFactory>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            version: Version::Any,
            security_mode: SecurityMode::SIGNING_ENABLED,
            seal: false,
            user: String::new(),
            password: String::new(),
            domain: String::new(),
            workstation: String::from("SMB2-ENGINE"),
            client_guid: Uuid::new_v4(),
            timeout: None,
            ndr: Ndr::Any,
            passthrough: false,
            authenticator: ntlm_factory(),
            crypto: None,
        }
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("version", &self.version)
            .field("security_mode", &self.security_mode)
            .field("seal", &self.seal)
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .field("client_guid", &self.client_guid)
            .field("timeout", &self.timeout)
            .field("ndr", &self.ndr)
            .field("passthrough", &self.passthrough)
            .field("crypto", &self.crypto.is_some())
            .finish_non_exhaustive()
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    pub fn seal(mut self, seal: bool) -> Self {
        self.seal = seal;
        self
    }

    /// Set authentication credentials
    pub fn credentials(mut self, user: &str, password: &str, domain: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self.domain = domain.to_string();
        self
    }

    pub fn workstation(mut self, workstation: &str) -> Self {
        self.workstation = workstation.to_string();
        self
    }

    pub fn client_guid(mut self, guid: Uuid) -> Self {
        self.client_guid = guid;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ndr(mut self, ndr: Ndr) -> Self {
        self.ndr = ndr;
        self
    }

    pub fn passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub fn authenticator(mut self, factory: AuthenticatorFactory) -> Self {
        self.authenticator = factory;
        self
    }

    pub fn crypto(mut self, factory: CryptoFactory) -> Self {
        self.crypto = Some(factory);
        self
    }

    /// Whether the caller insists on signed traffic.
    pub fn signing_requested(&self) -> bool {
        self.security_mode.contains(SecurityMode::SIGNING_REQUIRED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ContextConfig::new()
            .version(Version::V0302)
            .credentials("alice", "pw", "WG")
            .timeout(Some(Duration::from_secs(5)))
            .passthrough(true);
        assert_eq!(config.version, Version::V0302);
        assert_eq!(config.user, "alice");
        assert_eq!(config.domain, "WG");
        assert!(config.passthrough);
        assert!(!config.signing_requested());
        assert!(config
            .clone()
            .security_mode(SecurityMode::SIGNING_REQUIRED)
            .signing_requested());
        assert!(!format!("{:?}", config).contains("pw"));
    }

    #[test]
    fn test_distinct_client_guids() {
        assert_ne!(
            ContextConfig::default().client_guid,
            ContextConfig::default().client_guid
        );
    }
}
