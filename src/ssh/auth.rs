// ABOUTME: Authentication strategies tried in order after the handshake.
// ABOUTME: Password, keyboard-interactive, private keys, SSH agent, and GSSAPI contexts.

use super::error::{Error, Result};
use super::security_context::SecurityContext;
use nonempty::NonEmpty;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, load_secret_key};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on keyboard-interactive info request rounds.
const MAX_INTERACTIVE_ROUNDS: usize = 8;

/// One way of proving the user's identity.
pub enum AuthMethod {
    Password(String),
    /// Answers every prompt that asks for a password with the given one.
    KeyboardInteractive(String),
    PrivateKey(Arc<PrivateKey>),
    /// Keys offered by the agent at `$SSH_AUTH_SOCK`.
    Agent,
    /// GSSAPI negotiation through a security context. The russh transport has
    /// no `gssapi-with-mic` support, so this method is skipped at connect time.
    GssApi {
        target: String,
        context: Box<dyn SecurityContext>,
    },
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
            AuthMethod::PrivateKey(_) => "publickey",
            AuthMethod::Agent => "agent",
            AuthMethod::GssApi { .. } => "gssapi-with-mic",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::GssApi { target, .. } => f
                .debug_struct("GssApi")
                .field("target", target)
                .finish_non_exhaustive(),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Ordered, non-empty list of authentication methods. The first one the
/// server accepts wins.
#[derive(Debug)]
pub struct Auth {
    methods: NonEmpty<AuthMethod>,
}

impl Auth {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            methods: NonEmpty::new(method),
        }
    }

    pub fn password(password: impl Into<String>) -> Self {
        Self::new(AuthMethod::Password(password.into()))
    }

    /// Password auth with keyboard-interactive as fallback.
    pub fn keyboard_interactive(password: impl Into<String>) -> Self {
        let password = password.into();
        Self::new(AuthMethod::Password(password.clone()))
            .with(AuthMethod::KeyboardInteractive(password))
    }

    /// Load a private key file, optionally encrypted with `passphrase`.
    pub fn key_file(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let key = load_secret_key(path, passphrase).map_err(|e| Error::KeyLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(AuthMethod::PrivateKey(Arc::new(key))))
    }

    /// Decode an in-memory OpenSSH/PEM private key.
    pub fn raw_key(private_key: &str, passphrase: Option<&str>) -> Result<Self> {
        let key = decode_secret_key(private_key, passphrase).map_err(|e| Error::KeyLoadFailed {
            path: PathBuf::from("<in-memory key>"),
            reason: e.to_string(),
        })?;
        Ok(Self::new(AuthMethod::PrivateKey(Arc::new(key))))
    }

    pub fn agent() -> Self {
        Self::new(AuthMethod::Agent)
    }

    pub fn gssapi(target: impl Into<String>, context: Box<dyn SecurityContext>) -> Self {
        Self::new(AuthMethod::GssApi {
            target: target.into(),
            context,
        })
    }

    /// Whether an SSH agent socket is advertised in the environment.
    pub fn has_agent() -> bool {
        std::env::var_os("SSH_AUTH_SOCK").is_some_and(|sock| !sock.is_empty())
    }

    /// The agent when available, then unencrypted keys from the default
    /// locations under `$HOME/.ssh`.
    pub fn discover() -> Result<Self> {
        let mut methods = Vec::new();
        if Self::has_agent() {
            methods.push(AuthMethod::Agent);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let ssh_dir = PathBuf::from(home).join(".ssh");
            for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
                if let Ok(key) = load_secret_key(ssh_dir.join(name), None) {
                    methods.push(AuthMethod::PrivateKey(Arc::new(key)));
                }
            }
        }

        NonEmpty::from_vec(methods)
            .map(|methods| Self { methods })
            .ok_or_else(|| {
                Error::AgentUnavailable(
                    "SSH agent not available and no default keys found".to_string(),
                )
            })
    }

    /// Append a fallback method.
    pub fn with(mut self, method: AuthMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &AuthMethod> {
        self.methods.iter()
    }

    pub fn into_methods(self) -> Vec<AuthMethod> {
        self.methods.into()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Always false: an `Auth` holds at least one method.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Try each method in order until the server accepts one.
pub(crate) async fn authenticate<H: client::Handler>(
    session: &mut Handle<H>,
    user: &str,
    auth: &Auth,
) -> Result<()> {
    for method in auth.methods() {
        let accepted = match method {
            AuthMethod::Password(password) => session
                .authenticate_password(user, password)
                .await
                .map_err(Error::Protocol)?
                .success(),
            AuthMethod::KeyboardInteractive(password) => {
                keyboard_interactive(session, user, password).await?
            }
            AuthMethod::PrivateKey(key) => {
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(Error::Protocol)?
                    .flatten();

                session
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
                    .await
                    .map_err(Error::Protocol)?
                    .success()
            }
            // An absent or empty agent is one rejected method, not the end.
            AuthMethod::Agent => match agent(session, user).await {
                Ok(accepted) => accepted,
                Err(Error::AgentUnavailable(reason)) => {
                    tracing::debug!(user, reason = %reason, "SSH agent unavailable");
                    false
                }
                Err(e) => return Err(e),
            },
            AuthMethod::GssApi { target, .. } => {
                tracing::warn!(
                    target = %target,
                    "gssapi-with-mic is not supported by the transport, skipping"
                );
                false
            }
        };

        if accepted {
            tracing::debug!(user, method = method.name(), "authenticated");
            return Ok(());
        }
        tracing::debug!(user, method = method.name(), "authentication method rejected");
    }

    Err(Error::AuthenticationFailed)
}

async fn keyboard_interactive<H: client::Handler>(
    session: &mut Handle<H>,
    user: &str,
    password: &str,
) -> Result<bool> {
    let mut response = session
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(Error::Protocol)?;

    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = prompts
                    .iter()
                    .map(|p| {
                        if p.prompt.to_lowercase().contains("password") {
                            password.to_string()
                        } else {
                            String::new()
                        }
                    })
                    .collect();
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(Error::Protocol)?;
            }
        }
    }
    Ok(false)
}

async fn agent<H: client::Handler>(session: &mut Handle<H>, user: &str) -> Result<bool> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| Error::AgentUnavailable(e.to_string()))?;

    let keys = agent
        .request_identities()
        .await
        .map_err(|e| Error::AgentUnavailable(format!("failed to list agent keys: {}", e)))?;

    if keys.is_empty() {
        return Err(Error::AgentUnavailable("no keys in SSH agent".to_string()));
    }

    for key in &keys {
        match session
            .authenticate_publickey_with(user, key.clone(), None, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            _ => continue,
        }
    }
    Ok(false)
}
