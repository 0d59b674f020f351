// ABOUTME: Per-host connection settings.
// ABOUTME: Parses "host", "user@host", "host:port", "[v6]:port" and resolves credentials.

use super::env_value::{EnvValue, resolve_env_map};
use crate::error::{Error, Result};
use crate::ssh::{Auth, AuthMethod};
use crate::types::{DEFAULT_SSH_PORT, HostIdentity};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    /// Private key file.
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<EnvValue>,
    #[serde(default)]
    pub password: Option<EnvValue>,
    /// Offer keys from the SSH agent.
    #[serde(default)]
    pub agent: bool,
    /// Environment sent ahead of every command.
    #[serde(default)]
    pub env: HashMap<String, EnvValue>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl HostConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: None,
            key: None,
            passphrase: None,
            password: None,
            agent: false,
            env: HashMap::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidConfig("host address cannot be empty".to_string()));
        }

        // Parse format: [user@]host[:port]
        let (user_part, rest) = match s.split_once('@') {
            Some((user, _)) if user.is_empty() => {
                return Err(Error::InvalidConfig(format!("empty user in {}", s)));
            }
            Some((user, rest)) => (Some(user), rest),
            None => (None, s),
        };

        let identity = HostIdentity::parse(rest)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", s, e)))?;

        Ok(HostConfig {
            user: user_part.map(|u| u.to_string()),
            port: identity.port(),
            ..Self::new(identity.host())
        })
    }

    /// The configured user, falling back to `$USER`.
    pub fn user(&self) -> Result<String> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => std::env::var("USER").map_err(|_| Error::MissingEnvVar("USER".to_string())),
        }
    }

    /// Credentials in preference order: key file, password, agent. With none
    /// configured, the agent and default key files are discovered.
    pub fn auth(&self) -> Result<Auth> {
        let mut methods = Vec::new();

        if let Some(key) = &self.key {
            let passphrase = self.passphrase.as_ref().map(EnvValue::resolve).transpose()?;
            methods.extend(Auth::key_file(key, passphrase.as_deref())?.into_methods());
        }
        if let Some(password) = &self.password {
            methods.extend(Auth::keyboard_interactive(password.resolve()?).into_methods());
        }
        if self.agent {
            methods.push(AuthMethod::Agent);
        }

        let mut methods = methods.into_iter();
        match methods.next() {
            Some(first) => Ok(methods.fold(Auth::new(first), Auth::with)),
            None => Ok(Auth::discover()?),
        }
    }

    pub fn remote_env(&self) -> Result<Vec<(String, String)>> {
        resolve_env_map(&self.env)
    }
}
