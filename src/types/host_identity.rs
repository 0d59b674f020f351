// ABOUTME: Canonical host identity used as the known_hosts lookup key.
// ABOUTME: Normalizes bracketed IPv6, explicit and default ports to one form.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostIdentityError {
    #[error("host cannot be empty")]
    Empty,

    #[error("unterminated '[' in host: {0}")]
    UnclosedBracket(String),

    #[error("unexpected text after ']' in host: {0}")]
    TrailingText(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid character in host: '{0}'")]
    InvalidChar(char),
}

/// A host and port in the canonical OpenSSH known_hosts form.
///
/// The canonical string is `host` when the port is 22 and `[host]:port`
/// otherwise. Hostnames are lower-cased. `host`, `host:22` and `[host]:22`
/// all produce the same identity, and parsing the canonical string again
/// yields the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    host: String,
    port: u16,
}

impl HostIdentity {
    /// Parse a textual address (`host`, `host:port`, `[host]:port`, `::1`).
    pub fn parse(value: &str) -> Result<Self, HostIdentityError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(HostIdentityError::Empty);
        }

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| HostIdentityError::UnclosedBracket(value.to_string()))?;
            let host = &rest[..close];
            let after = &rest[close + 1..];
            let port = if after.is_empty() {
                DEFAULT_SSH_PORT
            } else if let Some(port) = after.strip_prefix(':') {
                parse_port(port)?
            } else {
                return Err(HostIdentityError::TrailingText(value.to_string()));
            };
            (host, port)
        } else {
            match value.matches(':').count() {
                0 => (value, DEFAULT_SSH_PORT),
                // host:port
                1 => {
                    let (host, port) = value.split_once(':').unwrap_or((value, ""));
                    (host, parse_port(port)?)
                }
                // bare IPv6 literal
                _ => (value, DEFAULT_SSH_PORT),
            }
        };

        Self::new(host, port)
    }

    /// Build an identity from an already separated host and port.
    pub fn new(host: &str, port: u16) -> Result<Self, HostIdentityError> {
        let host = host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(HostIdentityError::Empty);
        }
        if let Some(c) = host.chars().find(|c| {
            c.is_whitespace() || matches!(c, ',' | '[' | ']' | '#' | '*' | '?' | '!' | '|' | '@')
        }) {
            return Err(HostIdentityError::InvalidChar(c));
        }
        // A single colon would read back as host:port.
        if host.matches(':').count() == 1 {
            return Err(HostIdentityError::InvalidChar(':'));
        }
        if port == 0 {
            return Err(HostIdentityError::InvalidPort(port.to_string()));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The canonical known_hosts form of this identity.
    pub fn canonical(&self) -> String {
        if self.port == DEFAULT_SSH_PORT {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

/// Normalize a textual host into its canonical known_hosts form.
pub fn normalize(value: &str) -> Result<String, HostIdentityError> {
    HostIdentity::parse(value).map(|identity| identity.canonical())
}

fn parse_port(port: &str) -> Result<u16, HostIdentityError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(HostIdentityError::InvalidPort(port.to_string())),
        Ok(port) => Ok(port),
    }
}

impl From<SocketAddr> for HostIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string().to_ascii_lowercase(),
            port: addr.port(),
        }
    }
}

impl FromStr for HostIdentity {
    type Err = HostIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
