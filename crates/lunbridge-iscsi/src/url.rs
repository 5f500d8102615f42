//! iSCSI target URL parsing
//!
//! `iscsi://[user[%secret]@]host[:port]/target-iqn/lun`, with IPv6 hosts in
//! brackets.

use lunbridge_common::{Error, Result};
use std::fmt;

/// Default iSCSI TCP port
pub const DEFAULT_PORT: u16 = 3260;

const SCHEME: &str = "iscsi://";

/// A parsed target URL
#[derive(Clone, PartialEq, Eq)]
pub struct TargetUrl {
    pub host: String,
    pub port: u16,
    pub target_iqn: String,
    pub lun: u32,
    pub user: Option<String>,
    pub secret: Option<String>,
}

impl fmt::Debug for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetUrl")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("target_iqn", &self.target_iqn)
            .field("lun", &self.lun)
            .field("user", &self.user)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TargetUrl {
    /// Parse a target URL
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: redact(url),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("scheme must be iscsi://"))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing target name"))?;

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };
        let (user, secret) = match userinfo {
            None => (None, None),
            Some(info) => {
                let (user, secret) = match info.split_once('%') {
                    Some((user, secret)) => (user, Some(secret.to_string())),
                    None => (info, None),
                };
                if user.is_empty() {
                    return Err(invalid("empty user name"));
                }
                (Some(user.to_string()), secret)
            }
        };

        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match tail {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| invalid("garbage after IPv6 address"))?,
                ),
            };
            (host, port)
        } else {
            match hostport.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid("bad port"))?,
            None => DEFAULT_PORT,
        };

        let (target_iqn, lun) = path
            .rsplit_once('/')
            .ok_or_else(|| invalid("missing LUN"))?;
        if target_iqn.is_empty() || target_iqn.contains('/') {
            return Err(invalid("bad target name"));
        }
        let lun = lun.parse().map_err(|_| invalid("bad LUN"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            target_iqn: target_iqn.to_string(),
            lun,
            user,
            secret,
        })
    }

    /// `host:port`, brackets kept for IPv6
    #[must_use]
    pub fn portal(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn redact(url: &str) -> String {
    let Some(rest) = url.strip_prefix(SCHEME) else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => match rest[..at].find('%') {
            Some(pct) => format!("{SCHEME}{}%***{}", &rest[..pct], &rest[at..]),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}
