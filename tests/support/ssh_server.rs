// ABOUTME: In-process russh server for integration tests.
// ABOUTME: Understands a handful of scripted commands and records what clients did.

use super::keys;
use parking_lot::Mutex;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether::ssh::SessionConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const USER: &str = "tester";
pub const PASSWORD: &str = "s3cret";
pub const BANNER: &str = "authorized use only\n";

/// What the server observed, shared across connections.
#[derive(Debug, Default)]
pub struct ServerState {
    auth_attempts: AtomicUsize,
    commands: Mutex<Vec<String>>,
    env: Mutex<Vec<(String, String)>>,
    signals: Mutex<Vec<String>>,
}

impl ServerState {
    pub fn auth_attempts(&self) -> usize {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn env(&self) -> Vec<(String, String)> {
        self.env.lock().clone()
    }

    pub fn signals(&self) -> Vec<String> {
        self.signals.lock().clone()
    }

    /// Poll until a signal arrives or the wait runs out.
    pub async fn wait_for_signal(&self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if let Some(signal) = self.signals.lock().first().cloned() {
                return Some(signal);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}

pub struct TestServer {
    addr: SocketAddr,
    host_key: PublicKey,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Listen on an ephemeral port presenting the given host key fixture.
    pub async fn start(host_key: &str) -> Self {
        let config = Arc::new(server::Config {
            keys: vec![keys::private_key(host_key)],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("test server should bind");
        let addr = listener.local_addr().expect("listener has an address");
        let state = Arc::new(ServerState::default());

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = ConnectionHandler::new(state.clone());
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Ok(session) = server::run_stream(config, stream, handler).await {
                            let _ = session.await;
                        }
                    });
                }
            })
        };

        Self {
            addr,
            host_key: keys::public_key(host_key),
            state,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn host_key(&self) -> &PublicKey {
        &self.host_key
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new("127.0.0.1", USER)
            .port(self.port())
            .connect_timeout(Duration::from_secs(5))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ConnectionHandler {
    state: Arc<ServerState>,
    client_key: PublicKey,
    env: HashMap<String, String>,
    /// Channels running `cat`, with the input received so far.
    stdin: HashMap<ChannelId, Vec<u8>>,
}

impl ConnectionHandler {
    fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            client_key: keys::public_key(keys::CLIENT),
            env: HashMap::new(),
            stdin: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

/// Send output and an exit status, then close the channel.
async fn finish(
    handle: server::Handle,
    channel: ChannelId,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: u32,
) {
    if !stdout.is_empty() {
        let _ = handle.data(channel, CryptoVec::from_slice(&stdout)).await;
    }
    if !stderr.is_empty() {
        let _ = handle
            .extended_data(channel, 1, CryptoVec::from_slice(&stderr))
            .await;
    }
    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(Some(BANNER.to_string()))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.state.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.state.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if user == USER && public_key.key_data() == self.client_key.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state
            .env
            .lock()
            .push((variable_name.to_string(), variable_value.to_string()));
        self.env
            .insert(variable_name.to_string(), variable_value.to_string());
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        self.state.commands.lock().push(command.clone());
        let _ = session.channel_success(channel);

        // A leading `cd <dir> && ` is accepted and ignored.
        let command = match command.split_once(" && ") {
            Some((cd, rest)) if cd.starts_with("cd ") => rest.to_string(),
            _ => command,
        };
        let (program, rest) = command.split_once(' ').unwrap_or((command.as_str(), ""));

        if program == "cat" {
            self.stdin.insert(channel, Vec::new());
            return Ok(());
        }

        let handle = session.handle();
        let (stdout, stderr, status, delay) = match program {
            "echo" => (format!("{}\n", rest).into_bytes(), Vec::new(), 0, None),
            "printenv" => match self.env.get(rest) {
                Some(value) => (format!("{}\n", value).into_bytes(), Vec::new(), 0, None),
                None => (Vec::new(), Vec::new(), 1, None),
            },
            "fail" => (
                b"partial\n".to_vec(),
                b"failed\n".to_vec(),
                rest.parse().unwrap_or(1),
                None,
            ),
            "sleep" => {
                let secs: u64 = rest.parse().unwrap_or(1);
                (Vec::new(), Vec::new(), 0, Some(Duration::from_secs(secs)))
            }
            _ => (
                Vec::new(),
                format!("{}: command not found\n", program).into_bytes(),
                127,
                None,
            ),
        };

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            finish(handle, channel, stdout, stderr, status).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(buffer) = self.stdin.get_mut(&channel) {
            buffer.extend_from_slice(data);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(input) = self.stdin.remove(&channel) {
            let handle = session.handle();
            tokio::spawn(finish(handle, channel, input, Vec::new(), 0));
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state.signals.lock().push(format!("{:?}", signal));
        Ok(())
    }
}
