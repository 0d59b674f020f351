// ABOUTME: Host key trust decisions against a known_hosts store.
// ABOUTME: Distinguishes trusted, mismatched (possible MITM) and unknown hosts.

use super::error::{Error, Result};
use super::known_hosts::{FileKnownHosts, KnownHostsStore};
use crate::types::{HostIdentity, HostIdentityError};
use async_trait::async_trait;
use russh::keys::{HashAlg, PublicKey};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of checking an offered host key.
#[derive(Debug, Clone)]
pub enum TrustDecision {
    /// The offered key matches a record for the host.
    Trusted,
    /// The host has records, none with the offered key.
    Mismatched { trusted_keys: Vec<PublicKey> },
    /// The host has no records.
    Unknown,
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustDecision::Trusted)
    }
}

/// SHA256 fingerprint in the `SHA256:...` form OpenSSH prints.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Checks offered host keys against a [`KnownHostsStore`].
#[derive(Clone)]
pub struct TrustVerifier {
    store: Arc<dyn KnownHostsStore>,
}

impl std::fmt::Debug for TrustVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustVerifier")
            .field("store", &"<dyn KnownHostsStore>")
            .finish()
    }
}

impl TrustVerifier {
    pub fn new(store: Arc<dyn KnownHostsStore>) -> Self {
        Self { store }
    }

    /// Verifier backed by a known_hosts file.
    pub fn known_hosts_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileKnownHosts::new(path)))
    }

    pub fn store(&self) -> &Arc<dyn KnownHostsStore> {
        &self.store
    }

    /// Identity to look up: the host when given, the remote address otherwise.
    pub fn identity(host: &str, remote: Option<SocketAddr>) -> Result<HostIdentity> {
        if host.trim().is_empty() {
            return remote
                .map(HostIdentity::from)
                .ok_or(Error::InvalidHost(HostIdentityError::Empty));
        }
        Ok(HostIdentity::parse(host)?)
    }

    /// Decide whether `key` is trusted for `host`.
    ///
    /// Store read failures are returned as errors, never as `Unknown`.
    pub async fn verify(
        &self,
        host: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> Result<TrustDecision> {
        let identity = Self::identity(host, remote)?;
        let records = self.store.lookup(&identity).await?;

        if records.is_empty() {
            return Ok(TrustDecision::Unknown);
        }
        // A host may have several valid keys (one per algorithm).
        if records.iter().any(|record| record.has_key(key)) {
            return Ok(TrustDecision::Trusted);
        }
        Ok(TrustDecision::Mismatched {
            trusted_keys: records.into_iter().map(|r| r.key().clone()).collect(),
        })
    }

    /// Persist trust in `key` for `host`, and for the remote address when it
    /// differs from the host.
    pub async fn record_trust(
        &self,
        host: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> Result<()> {
        let mut identities = vec![Self::identity(host, remote)?];
        if let Some(addr) = remote.map(HostIdentity::from) {
            if !identities.contains(&addr) {
                identities.push(addr);
            }
        }
        self.store.append(&identities, key).await
    }
}

/// What to do with a host that has no known_hosts entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Refuse unknown hosts.
    #[default]
    Strict,
    /// Trust on first use: record the key of an unknown host and continue.
    AcceptNew,
}

/// Host key callback invoked by the transport during the handshake.
///
/// Returning an error aborts the handshake before authentication.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify_host_key(
        &self,
        host: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> Result<()>;
}

#[async_trait]
impl<F> HostKeyVerifier for F
where
    F: Fn(&str, Option<SocketAddr>, &PublicKey) -> Result<()> + Send + Sync,
{
    async fn verify_host_key(
        &self,
        host: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> Result<()> {
        self(host, remote, key)
    }
}

/// Default verifier: known_hosts lookup plus an unknown-host policy.
///
/// A mismatched key is always rejected.
#[derive(Debug, Clone)]
pub struct KnownHostsVerifier {
    trust: TrustVerifier,
    policy: HostKeyPolicy,
}

impl KnownHostsVerifier {
    pub fn new(trust: TrustVerifier, policy: HostKeyPolicy) -> Self {
        Self { trust, policy }
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }
}

#[async_trait]
impl HostKeyVerifier for KnownHostsVerifier {
    async fn verify_host_key(
        &self,
        host: &str,
        remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> Result<()> {
        match self.trust.verify(host, remote, key).await? {
            TrustDecision::Trusted => {
                tracing::debug!(host, "host key trusted");
                Ok(())
            }
            TrustDecision::Mismatched { trusted_keys } => {
                let offered = fingerprint(key);
                tracing::error!(
                    host,
                    offered = %offered,
                    "HOST KEY MISMATCH: refusing connection, possible man-in-the-middle attack"
                );
                Err(Error::HostKeyMismatch {
                    host: host.to_string(),
                    offered,
                    trusted: trusted_keys.iter().map(fingerprint).collect(),
                })
            }
            TrustDecision::Unknown => match self.policy {
                HostKeyPolicy::Strict => Err(Error::HostUnknown {
                    host: host.to_string(),
                    fingerprint: fingerprint(key),
                }),
                HostKeyPolicy::AcceptNew => {
                    tracing::warn!(
                        host,
                        fingerprint = %fingerprint(key),
                        "Trust-On-First-Use: accepting unknown host key"
                    );
                    // Fail closed: an unpersisted trust decision aborts the handshake.
                    self.trust.record_trust(host, remote, key).await
                }
            },
        }
    }
}

/// Accepts every host key without checking.
///
/// This disables man-in-the-middle protection entirely. Only use it against
/// hosts whose identity is established some other way.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureIgnoreHostKey;

#[async_trait]
impl HostKeyVerifier for InsecureIgnoreHostKey {
    async fn verify_host_key(
        &self,
        host: &str,
        _remote: Option<SocketAddr>,
        key: &PublicKey,
    ) -> Result<()> {
        tracing::warn!(
            host,
            fingerprint = %fingerprint(key),
            "host key verification disabled"
        );
        Ok(())
    }
}
