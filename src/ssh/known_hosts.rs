// ABOUTME: Append-only known_hosts trust store in OpenSSH format.
// ABOUTME: File-backed store for real use and an in-memory store with the same contract.

use super::error::{Error, Result};
use crate::types::{HostIdentity, HostIdentityError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use russh::keys::PublicKey;
use sha1::Sha1;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One trusted key for one or more host patterns.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    patterns: Vec<String>,
    key: PublicKey,
}

impl KeyRecord {
    /// Build a record naming the given identities. The key comment is dropped.
    pub fn new(identities: &[HostIdentity], key: &PublicKey) -> Result<Self> {
        if identities.is_empty() {
            return Err(Error::InvalidHost(HostIdentityError::Empty));
        }
        let mut patterns: Vec<String> = Vec::with_capacity(identities.len());
        for identity in identities {
            let canonical = identity.canonical();
            if !patterns.contains(&canonical) {
                patterns.push(canonical);
            }
        }
        Ok(Self {
            patterns,
            key: PublicKey::new(key.key_data().clone(), ""),
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Whether the key material equals `key`, ignoring comments.
    pub fn has_key(&self, key: &PublicKey) -> bool {
        self.key.key_data() == key.key_data()
    }

    /// Whether this record applies to `identity`.
    ///
    /// A negated pattern (`!pattern`) that matches excludes the record even if
    /// another pattern on the same line matches.
    pub fn matches(&self, identity: &HostIdentity) -> bool {
        let candidate = identity.canonical();
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if pattern_match(negated, &candidate) {
                    return false;
                }
            } else if pattern_match(pattern, &candidate) {
                matched = true;
            }
        }
        matched
    }

    /// Render as a known_hosts line (without trailing newline).
    pub fn to_line(&self) -> Result<String> {
        let key = self
            .key
            .to_openssh()
            .map_err(|e| Error::KeyEncoding(e.to_string()))?;
        Ok(format!("{} {}", self.patterns.join(","), key))
    }
}

/// Result of parsing a single known_hosts line.
#[derive(Debug)]
enum Line {
    Record(KeyRecord),
    Skip,
}

fn parse_line(line: &str, number: usize) -> Line {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Line::Skip;
    }
    if line.starts_with('@') {
        tracing::debug!(line = number, "skipping known_hosts marker line");
        return Line::Skip;
    }

    let mut fields = line.split_whitespace();
    let (Some(hosts), Some(key_type), Some(key_data)) =
        (fields.next(), fields.next(), fields.next())
    else {
        tracing::warn!(line = number, "skipping malformed known_hosts line");
        return Line::Skip;
    };

    match PublicKey::from_openssh(&format!("{key_type} {key_data}")) {
        Ok(key) => Line::Record(KeyRecord {
            patterns: hosts
                .split(',')
                .filter(|p| !p.is_empty())
                .map(|p| {
                    // Hashed entries carry base64, which is case sensitive.
                    if is_hashed(p.trim_start_matches('!')) {
                        p.to_string()
                    } else {
                        p.to_ascii_lowercase()
                    }
                })
                .collect(),
            key,
        }),
        Err(e) => {
            tracing::warn!(line = number, error = %e, "skipping known_hosts line with unparsable key");
            Line::Skip
        }
    }
}

fn is_hashed(pattern: &str) -> bool {
    pattern.starts_with(HASHED_PREFIX)
}

const HASHED_PREFIX: &str = "|1|";

fn pattern_match(pattern: &str, candidate: &str) -> bool {
    if is_hashed(pattern) {
        hashed_match(pattern, candidate)
    } else {
        wildcard_match(pattern, candidate)
    }
}

/// `|1|salt|hash` where hash is HMAC-SHA1 of the host name keyed by salt,
/// as written by `HashKnownHosts yes`.
fn hashed_match(pattern: &str, candidate: &str) -> bool {
    let Some((salt, hash)) = pattern
        .strip_prefix(HASHED_PREFIX)
        .and_then(|rest| rest.split_once('|'))
    else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (BASE64.decode(salt), BASE64.decode(hash)) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    mac.update(candidate.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

/// OpenSSH-style glob: `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, c));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            c = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&ch| ch == '*')
}

/// Storage for trusted host keys.
///
/// Records are only ever appended. Lookups return every record whose host
/// patterns match, in file order; callers must not rely on that order.
#[async_trait]
pub trait KnownHostsStore: Send + Sync {
    /// All records that apply to `identity`. Empty means the host is unknown.
    async fn lookup(&self, identity: &HostIdentity) -> Result<Vec<KeyRecord>>;

    /// Append one record naming `identities` with `key`.
    async fn append(&self, identities: &[HostIdentity], key: &PublicKey) -> Result<()>;
}

/// known_hosts file on disk.
#[derive(Debug, Clone)]
pub struct FileKnownHosts {
    path: PathBuf,
}

impl FileKnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.ssh/known_hosts`.
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var_os("HOME").ok_or_else(|| Error::KnownHostsIo {
            path: PathBuf::from("~/.ssh/known_hosts"),
            source: io::Error::new(io::ErrorKind::NotFound, "HOME is not set"),
        })?;
        Ok(PathBuf::from(home).join(".ssh").join("known_hosts"))
    }

    pub fn at_default_path() -> Result<Self> {
        Self::default_path().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::KnownHostsIo {
            path: self.path.clone(),
            source,
        }
    }

    /// Read every record in file order. Lines that are not UTF-8 are skipped.
    async fn read_records(&self) -> Result<Vec<KeyRecord>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            // A store that was never written holds no records.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut records = Vec::new();
        for (index, line) in content.split(|&b| b == b'\n').enumerate() {
            let Ok(line) = std::str::from_utf8(line) else {
                tracing::warn!(
                    line = index + 1,
                    path = %self.path.display(),
                    "skipping known_hosts line that is not valid UTF-8"
                );
                continue;
            };
            if let Line::Record(record) = parse_line(line, index + 1) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl KnownHostsStore for FileKnownHosts {
    async fn lookup(&self, identity: &HostIdentity) -> Result<Vec<KeyRecord>> {
        let mut matching: Vec<KeyRecord> = Vec::new();
        for record in self.read_records().await? {
            // The same key listed both hashed and in the clear counts once.
            if record.matches(identity) && !matching.iter().any(|m| m.has_key(&record.key)) {
                matching.push(record);
            }
        }

        tracing::debug!(
            host = %identity,
            path = %self.path.display(),
            records = matching.len(),
            "known_hosts lookup"
        );
        Ok(matching)
    }

    async fn append(&self, identities: &[HostIdentity], key: &PublicKey) -> Result<()> {
        let record = KeyRecord::new(identities, key)?;
        let line = format!("{}\n", record.to_line()?);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let exists = tokio::fs::try_exists(parent)
                .await
                .map_err(|e| self.io_error(e))?;
            if !exists {
                let mut builder = tokio::fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(0o700);
                builder.create(parent).await.map_err(|e| self.io_error(e))?;
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        // One write per record keeps concurrent appenders from interleaving.
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        file.sync_data().await.map_err(|e| self.io_error(e))?;

        tracing::info!(
            hosts = %record.patterns().join(","),
            path = %self.path.display(),
            "recorded trusted host key"
        );
        Ok(())
    }
}

/// In-memory store, mainly for tests and embedders without a file.
#[derive(Debug, Default)]
pub struct MemoryKnownHosts {
    records: Mutex<Vec<KeyRecord>>,
}

impl MemoryKnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<KeyRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl KnownHostsStore for MemoryKnownHosts {
    async fn lookup(&self, identity: &HostIdentity) -> Result<Vec<KeyRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| record.matches(identity))
            .cloned()
            .collect())
    }

    async fn append(&self, identities: &[HostIdentity], key: &PublicKey) -> Result<()> {
        let record = KeyRecord::new(identities, key)?;
        self.records.lock().push(record);
        Ok(())
    }
}
