// ABOUTME: Configuration types and parsing for tether.yml.
// ABOUTME: Handles YAML parsing, host aliases, and connection defaults.

mod env_value;
mod host;

pub use env_value::{EnvValue, resolve_env_map};
pub use host::HostConfig;

use crate::error::{Error, Result};
use crate::ssh::{HostKeyPolicy, SessionConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "tether.yml";
pub const CONFIG_FILENAME_ALT: &str = "tether.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".tether/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// known_hosts file; defaults to `$HOME/.ssh/known_hosts`.
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default, deserialize_with = "deserialize_hosts")]
    pub hosts: HashMap<String, HostConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            known_hosts: None,
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            hosts: HashMap::new(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                tracing::debug!(path = %path.display(), "loading config");
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    pub fn host(&self, alias: &str) -> Result<&HostConfig> {
        self.hosts
            .get(alias)
            .ok_or_else(|| Error::UnknownHost(alias.to_string()))
    }

    /// A configured alias, or else a `[user@]host[:port]` address.
    pub fn resolve_target(&self, target: &str) -> Result<HostConfig> {
        match self.hosts.get(target) {
            Some(host) => Ok(host.clone()),
            None => HostConfig::parse(target),
        }
    }

    /// Session settings for `host` with this file's defaults applied.
    pub fn session_config(&self, host: &HostConfig) -> Result<SessionConfig> {
        let mut session = SessionConfig::new(&host.host, host.user()?)
            .port(host.port)
            .host_key_policy(self.host_key_policy)
            .connect_timeout(self.connect_timeout)
            .command_timeout(self.command_timeout);
        if let Some(path) = &self.known_hosts {
            session = session.known_hosts_path(path);
        }
        Ok(session)
    }
}

// Custom deserializers

fn deserialize_hosts<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, HostConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries: HashMap<String, HostEntry> = HashMap::deserialize(deserializer)?;
    entries
        .into_iter()
        .map(|(alias, entry)| {
            entry
                .into_host_config()
                .map(|host| (alias.clone(), host))
                .map_err(|e| serde::de::Error::custom(format!("host '{}': {}", alias, e)))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostEntry {
    Simple(String),
    Detailed(HostConfig),
}

impl HostEntry {
    fn into_host_config(self) -> Result<HostConfig> {
        match self {
            HostEntry::Simple(s) => HostConfig::parse(&s),
            HostEntry::Detailed(c) => Ok(c),
        }
    }
}
