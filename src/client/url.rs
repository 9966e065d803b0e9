//! `smb://` URL parsing

use crate::connection::ContextConfig;
use crate::dcerpc::Ndr;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{SecurityMode, Version};
use std::time::Duration;

const SCHEME: &str = "smb://";

/// A parsed `smb://[domain;][user[:password]@]host[:port]/share/path?args`
/// URL. Recognised arguments are `seal`, `sign`, `vers=`, `ndr=` and
/// `timeout=` (seconds).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmbUrl {
    pub domain: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// `host` or `host:port`, as accepted by `connect_share`
    pub server: String,
    pub share: String,
    /// Path below the share, without a leading separator
    pub path: String,
    pub seal: bool,
    pub sign: bool,
    pub version: Option<Version>,
    pub ndr: Option<Ndr>,
    pub timeout: Option<Duration>,
}

fn invalid(url: &str, why: &str) -> Error {
    Error::InvalidParameter(format!("{}: {}", url, why))
}

impl SmbUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = match url.get(..SCHEME.len()) {
            Some(scheme) if scheme.eq_ignore_ascii_case(SCHEME) => &url[SCHEME.len()..],
            _ => return Err(invalid(url, "not an smb:// URL")),
        };
        let mut out = SmbUrl::default();

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        if let Some(query) = query {
            out.apply_args(url, query)?;
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = match authority.rsplit_once('@') {
            Some((userinfo, host)) => {
                let userinfo = match userinfo.split_once(';') {
                    Some((domain, u)) => {
                        out.domain = Some(domain.to_string());
                        u
                    }
                    None => userinfo,
                };
                match userinfo.split_once(':') {
                    Some((user, password)) => {
                        out.user = Some(user.to_string());
                        out.password = Some(password.to_string());
                    }
                    None => out.user = Some(userinfo.to_string()),
                }
                host
            }
            None => authority,
        };
        if host.is_empty() {
            return Err(invalid(url, "missing server"));
        }
        out.server = host.to_string();

        let (share, path) = path.split_once('/').unwrap_or((path, ""));
        out.share = share.to_string();
        out.path = path.trim_end_matches('/').to_string();
        Ok(out)
    }

    fn apply_args(&mut self, url: &str, query: &str) -> Result<()> {
        for arg in query.split('&').filter(|a| !a.is_empty()) {
            let (key, value) = arg.split_once('=').unwrap_or((arg, ""));
            match key {
                "seal" => self.seal = true,
                "sign" => self.sign = true,
                "vers" => {
                    self.version = Some(
                        Version::parse(value).ok_or_else(|| invalid(url, "unknown vers"))?,
                    )
                }
                "ndr" => {
                    self.ndr = Some(Ndr::parse(value).ok_or_else(|| invalid(url, "unknown ndr"))?)
                }
                "timeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| invalid(url, "timeout must be a number of seconds"))?;
                    self.timeout = Some(Duration::from_secs(secs));
                }
                "sec" if value == "ntlmssp" => {}
                _ => return Err(invalid(url, &format!("unknown argument {}", key))),
            }
        }
        Ok(())
    }

    /// Fold the URL's credentials and arguments into `config`.
    pub fn apply(&self, mut config: ContextConfig) -> ContextConfig {
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if self.seal {
            config.seal = true;
        }
        if self.sign {
            config.security_mode |= SecurityMode::SIGNING_REQUIRED;
        }
        if let Some(version) = self.version {
            config.version = version;
        }
        if let Some(ndr) = self.ndr {
            config.ndr = ndr;
        }
        if self.timeout.is_some() {
            config.timeout = self.timeout;
        }
        config
    }
}

impl std::str::FromStr for SmbUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SmbUrl::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_url() {
        let u = SmbUrl::parse("smb://CORP;alice:pw@fs1:4455/data/dir/file.txt?seal&vers=3.02")
            .unwrap();
        assert_eq!(u.domain.as_deref(), Some("CORP"));
        assert_eq!(u.user.as_deref(), Some("alice"));
        assert_eq!(u.password.as_deref(), Some("pw"));
        assert_eq!(u.server, "fs1:4455");
        assert_eq!(u.share, "data");
        assert_eq!(u.path, "dir/file.txt");
        assert!(u.seal);
        assert_eq!(u.version, Some(Version::V0302));
    }

    #[test]
    fn test_share_only() {
        let u = SmbUrl::parse("smb://host/share").unwrap();
        assert_eq!(u.server, "host");
        assert_eq!(u.share, "share");
        assert_eq!(u.path, "");
        assert!(u.user.is_none());
    }

    #[test]
    fn test_ipv6_host() {
        let u = SmbUrl::parse("smb://[::1]:445/ipc$").unwrap();
        assert_eq!(u.server, "[::1]:445");
        assert_eq!(u.share, "ipc$");
    }

    #[test]
    fn test_rejects() {
        assert!(SmbUrl::parse("http://host/share").is_err());
        assert!(SmbUrl::parse("smb:///share").is_err());
        assert!(SmbUrl::parse("smb://host/share?vers=9").is_err());
        assert!(SmbUrl::parse("smb://host/share?bogus").is_err());
    }

    #[test]
    fn test_apply_to_config() {
        let u = SmbUrl::parse("smb://bob@h/s?sign&timeout=5&ndr=2").unwrap();
        let c = u.apply(ContextConfig::default());
        assert_eq!(c.user, "bob");
        assert!(c.signing_requested());
        assert_eq!(c.timeout, Some(Duration::from_secs(5)));
        assert_eq!(c.ndr, Ndr::Ndr64);
    }
}
