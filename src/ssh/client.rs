// ABOUTME: SSH session management using russh.
// ABOUTME: Connects with host key verification, authenticates, and opens command channels.

use super::auth::{Auth, authenticate};
use super::command::{CommandResult, OutputMode, RemoteCommand, RemoteCommandSpec};
use super::error::{Error, Result};
use super::known_hosts::FileKnownHosts;
use super::trust::{
    HostKeyPolicy, HostKeyVerifier, InsecureIgnoreHostKey, KnownHostsVerifier, TrustVerifier,
    fingerprint,
};
use crate::types::{DEFAULT_SSH_PORT, HostIdentity};
use parking_lot::Mutex;
use russh::client::{self, Config, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, Disconnect};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Configuration for establishing an SSH session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Username for authentication.
    pub user: String,
    /// What to do when the host has no known_hosts entry.
    pub host_key_policy: HostKeyPolicy,
    /// Optional path to known_hosts file.
    /// If None, uses the default ~/.ssh/known_hosts.
    pub known_hosts_path: Option<PathBuf>,
    /// Bound on TCP connect plus key exchange (default: 20 seconds).
    pub connect_timeout: Duration,
    /// Timeout for [`Session::exec`] and [`Session::run`] (default: 5 minutes).
    pub command_timeout: Duration,
    /// Drop the connection after this long without traffic.
    pub inactivity_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            connect_timeout: Duration::from_secs(20),
            command_timeout: Duration::from_secs(300),
            inactivity_timeout: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    pub fn identity(&self) -> Result<HostIdentity> {
        Ok(HostIdentity::new(&self.host, self.port)?)
    }
}

/// SSH client handler for russh.
///
/// Runs the verifier once per connection attempt. Later key exchanges must
/// present the key accepted the first time.
pub(crate) struct SshHandler {
    host: String,
    remote: SocketAddr,
    verifier: Arc<dyn HostKeyVerifier>,
    accepted: Arc<Mutex<Option<PublicKey>>>,
    banner: Arc<Mutex<Option<String>>>,
}

impl client::Handler for SshHandler {
    type Error = Error;

    async fn auth_banner(&mut self, banner: &str, _session: &mut client::Session) -> Result<()> {
        tracing::info!(host = %self.host, banner = banner.trim_end(), "server banner");
        self.banner
            .lock()
            .get_or_insert_with(String::new)
            .push_str(banner);
        Ok(())
    }

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        let previous = self.accepted.lock().clone();
        if let Some(previous) = previous {
            if previous.key_data() == server_public_key.key_data() {
                return Ok(true);
            }
            return Err(Error::HostKeyMismatch {
                host: self.host.clone(),
                offered: fingerprint(server_public_key),
                trusted: vec![fingerprint(&previous)],
            });
        }

        self.verifier
            .verify_host_key(&self.host, Some(self.remote), server_public_key)
            .await?;
        *self.accepted.lock() = Some(server_public_key.clone());
        Ok(true)
    }
}

/// An established, authenticated SSH session.
pub struct Session {
    config: SessionConfig,
    handle: Arc<Handle<SshHandler>>,
    host_key: PublicKey,
    remote_addr: SocketAddr,
    banner: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("remote_addr", &self.remote_addr)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

impl Session {
    /// Connect, verify the host key with `verifier`, then authenticate.
    ///
    /// Authentication never starts unless the verifier accepted the key.
    pub async fn connect(
        config: SessionConfig,
        auth: Auth,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> Result<Self> {
        let identity = config.identity()?;

        let russh_config = Arc::new(Config {
            inactivity_timeout: config.inactivity_timeout,
            ..Default::default()
        });

        let timeout = config.connect_timeout;
        let banner = Arc::new(Mutex::new(None));
        let (mut handle, host_key, remote_addr) = tokio::time::timeout(
            timeout,
            Self::establish(&config, &identity, russh_config, verifier, banner.clone()),
        )
        .await
        .map_err(|_| Error::ConnectTimeout(timeout))??;

        authenticate(&mut handle, &config.user, &auth).await?;
        tracing::info!(host = %identity, user = %config.user, "SSH session established");

        Ok(Self {
            config,
            handle: Arc::new(handle),
            host_key,
            remote_addr,
            banner,
        })
    }

    /// Connect using the known_hosts file and policy from `config`.
    pub async fn connect_known_hosts(config: SessionConfig, auth: Auth) -> Result<Self> {
        let store = match &config.known_hosts_path {
            Some(path) => FileKnownHosts::new(path),
            None => FileKnownHosts::at_default_path()?,
        };
        let verifier = KnownHostsVerifier::new(
            TrustVerifier::new(Arc::new(store)),
            config.host_key_policy,
        );
        Self::connect(config, auth, Arc::new(verifier)).await
    }

    /// Connect without checking the host key.
    ///
    /// Anyone able to intercept the connection can impersonate the host.
    pub async fn connect_insecure(config: SessionConfig, auth: Auth) -> Result<Self> {
        Self::connect(config, auth, Arc::new(InsecureIgnoreHostKey)).await
    }

    /// Try each resolved address until one accepts TCP. Handshake failures
    /// are final.
    async fn establish(
        config: &SessionConfig,
        identity: &HostIdentity,
        russh_config: Arc<Config>,
        verifier: Arc<dyn HostKeyVerifier>,
        banner: Arc<Mutex<Option<String>>>,
    ) -> Result<(Handle<SshHandler>, PublicKey, SocketAddr)> {
        let addrs = tokio::net::lookup_host((identity.host(), config.port))
            .await
            .map_err(|e| Error::Connection(format!("failed to resolve {}: {}", identity, e)))?;

        let mut last_error = None;
        for addr in addrs {
            let stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect failed");
                    last_error = Some(Error::Connection(format!("{} ({}): {}", identity, addr, e)));
                    continue;
                }
            };

            let accepted = Arc::new(Mutex::new(None));
            let handler = SshHandler {
                host: identity.canonical(),
                remote: addr,
                verifier: verifier.clone(),
                accepted: accepted.clone(),
                banner: banner.clone(),
            };

            let handle = client::connect_stream(russh_config.clone(), stream, handler)
                .await
                .map_err(|e| match e {
                    Error::Protocol(e) => Error::Handshake(e),
                    other => other,
                })?;

            let host_key = accepted.lock().clone().ok_or_else(|| {
                Error::Connection("handshake completed without host key verification".to_string())
            })?;
            return Ok((handle, host_key, addr));
        }

        Err(last_error
            .unwrap_or_else(|| Error::Connection(format!("no addresses found for {}", identity))))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The host key accepted during the handshake.
    pub fn host_key(&self) -> &PublicKey {
        &self.host_key
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Banner text the server sent during authentication, if any.
    pub fn banner(&self) -> Option<String> {
        self.banner.lock().clone()
    }

    pub async fn open_channel(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| Error::CommandExecution(format!("failed to open channel: {}", e)))
    }

    /// Bind `spec` to a fresh channel.
    pub async fn remote_command(
        &self,
        spec: RemoteCommandSpec,
    ) -> Result<RemoteCommand<Channel<Msg>>> {
        Ok(RemoteCommand::new(spec, self.open_channel().await?))
    }

    /// `path` with `args`, joined by spaces and run by the remote shell.
    pub async fn command<I, S>(&self, path: &str, args: I) -> Result<RemoteCommand<Channel<Msg>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remote_command(RemoteCommandSpec::new(path).args(args))
            .await
    }

    /// Execute a command line with separate stdout and stderr, bounded by
    /// the configured command timeout.
    pub async fn exec(&self, command: &str) -> Result<CommandResult> {
        self.exec_with_timeout(command, self.config.command_timeout)
            .await
    }

    /// Execute a command with a custom timeout.
    pub async fn exec_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult> {
        self.remote_command(RemoteCommandSpec::new(command))
            .await?
            .run_with_timeout(timeout)
            .await
    }

    /// Execute a command line with stderr merged into stdout, bounded by the
    /// configured command timeout.
    pub async fn run(&self, command: &str) -> Result<CommandResult> {
        self.run_with_timeout(command, self.config.command_timeout)
            .await
    }

    /// Combined-output run with a custom timeout. Expiry interrupts the
    /// remote process.
    pub async fn run_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let spec = RemoteCommandSpec::new(command).output_mode(OutputMode::Combined);
        self.remote_command(spec)
            .await?
            .run_with_timeout(timeout)
            .await
    }

    /// Execute a command line until it finishes or `token` is cancelled.
    pub async fn run_with_cancellation(
        &self,
        command: &str,
        token: CancellationToken,
    ) -> Result<CommandResult> {
        let spec = RemoteCommandSpec::new(command).output_mode(OutputMode::Combined);
        self.remote_command(spec)
            .await?
            .run_with_cancellation(token)
            .await
    }

    /// Disconnect the session.
    pub async fn disconnect(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(Error::Protocol)?;
        Ok(())
    }
}
