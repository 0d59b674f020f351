// ABOUTME: SSH-specific error types.
// ABOUTME: Covers connection, host key trust, authentication, and command execution failures.

use crate::types::HostIdentityError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("SSH handshake failed: {0}")]
    Handshake(#[source] russh::Error),

    #[error(
        "host key mismatch for {host}: offered {offered}, trusted {}; possible man-in-the-middle attack",
        trusted.join(", ")
    )]
    HostKeyMismatch {
        host: String,
        /// SHA256 fingerprint of the key the server presented.
        offered: String,
        /// SHA256 fingerprints of the keys previously trusted for the host.
        trusted: Vec<String>,
    },

    #[error("host {host} is not in known_hosts (key fingerprint {fingerprint})")]
    HostUnknown { host: String, fingerprint: String },

    #[error("known_hosts file {path} could not be accessed: {source}")]
    KnownHostsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid host: {0}")]
    InvalidHost(#[from] HostIdentityError),

    #[error("failed to encode host key: {0}")]
    KeyEncoding(String),

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("security context error: {0}")]
    SecurityContext(String),

    #[error("command execution failed: {0}")]
    CommandExecution(String),

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error reports a host key trust failure rather than a
    /// transport or authentication problem.
    pub fn is_host_key_rejection(&self) -> bool {
        matches!(
            self,
            Error::HostKeyMismatch { .. } | Error::HostUnknown { .. } | Error::KnownHostsIo { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
