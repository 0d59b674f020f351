// ABOUTME: Remote command descriptions and their execution over an SSH channel.
// ABOUTME: Runs to completion, or races a cancellation signal and interrupts the remote process.

use super::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit status reported when the remote process was killed by a signal and
/// never sent a numeric status. Matches what OpenSSH's client returns.
pub const SIGNAL_EXIT_STATUS: u32 = 255;

/// How stderr is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// stdout and stderr kept apart.
    #[default]
    Separate,
    /// stderr appended to stdout in arrival order.
    Combined,
}

/// What to run on the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteCommandSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
    pub stdin: Option<Bytes>,
    pub output: OutputMode,
}

impl RemoteCommandSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Add a `NAME=value` assignment. Text after the first `=` is the value;
    /// an assignment without `=` sets an empty value.
    pub fn env_assignment(self, assignment: &str) -> Self {
        let (name, value) = assignment.split_once('=').unwrap_or((assignment, ""));
        self.env(name, value)
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Bytes>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// The command line sent to the remote shell.
    ///
    /// Path and arguments are joined with single spaces and passed verbatim;
    /// no quoting is applied. A working directory becomes a `cd <dir> && `
    /// prefix.
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        if let Some(dir) = &self.dir {
            line.push_str("cd ");
            line.push_str(dir);
            line.push_str(" && ");
        }
        line.push_str(&self.path);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl std::fmt::Display for RemoteCommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Output of a finished remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    /// Empty in [`OutputMode::Combined`].
    pub stderr: Vec<u8>,
    pub exit_status: u32,
    /// Signal name when the remote process was killed by a signal.
    pub exit_signal: Option<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0 && self.exit_signal.is_none()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Something a session channel reports while a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    ExitSignal(String),
    /// The server refused the exec request.
    Rejected,
    Eof,
    Close,
}

/// The channel operations a [`RemoteCommand`] needs.
#[async_trait]
pub trait ExecChannel: Send {
    async fn send_env(&mut self, name: &str, value: &str) -> Result<()>;
    async fn start_command(&mut self, command_line: &str) -> Result<()>;
    async fn send_stdin(&mut self, data: &[u8]) -> Result<()>;
    async fn send_eof(&mut self) -> Result<()>;
    /// Next event, or `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<ChannelEvent>;
    /// Deliver SIGINT to the remote process.
    async fn send_interrupt(&mut self) -> Result<()>;
    async fn close_channel(&mut self) -> Result<()>;
}

#[async_trait]
impl ExecChannel for Channel<Msg> {
    async fn send_env(&mut self, name: &str, value: &str) -> Result<()> {
        // No reply requested: servers commonly refuse variables outside
        // AcceptEnv, and that should not fail the command.
        self.set_env(false, name, value)
            .await
            .map_err(|e| Error::CommandExecution(format!("failed to set {}: {}", name, e)))
    }

    async fn start_command(&mut self, command_line: &str) -> Result<()> {
        self.exec(true, command_line)
            .await
            .map_err(|e| Error::CommandExecution(format!("failed to exec command: {}", e)))
    }

    async fn send_stdin(&mut self, data: &[u8]) -> Result<()> {
        self.data(data)
            .await
            .map_err(|e| Error::CommandExecution(format!("failed to write stdin: {}", e)))
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.eof()
            .await
            .map_err(|e| Error::CommandExecution(format!("failed to send eof: {}", e)))
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    ChannelEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    ChannelEvent::ExitSignal(match signal_name {
                        Sig::Custom(name) => name,
                        standard => format!("{:?}", standard),
                    })
                }
                ChannelMsg::Failure => ChannelEvent::Rejected,
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Close,
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn send_interrupt(&mut self) -> Result<()> {
        self.signal(Sig::INT).await.map_err(Error::Protocol)
    }

    async fn close_channel(&mut self) -> Result<()> {
        self.close().await.map_err(Error::Protocol)
    }
}

/// A command bound to a channel. Consumed by running it.
pub struct RemoteCommand<C> {
    spec: RemoteCommandSpec,
    channel: C,
}

impl<C> std::fmt::Debug for RemoteCommand<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl<C: ExecChannel> RemoteCommand<C> {
    pub fn new(spec: RemoteCommandSpec, channel: C) -> Self {
        Self { spec, channel }
    }

    pub fn spec(&self) -> &RemoteCommandSpec {
        &self.spec
    }

    /// Run to completion.
    pub async fn run(mut self) -> Result<CommandResult> {
        let result = execute(&mut self.channel, &self.spec).await;
        self.release().await;
        result
    }

    /// Run until the command finishes or `token` is cancelled, whichever
    /// comes first.
    ///
    /// On cancellation the remote process is sent SIGINT and
    /// [`Error::Cancelled`] is returned without waiting for it to exit. A
    /// token cancelled before the call never starts the command.
    pub async fn run_with_cancellation(self, token: CancellationToken) -> Result<CommandResult> {
        if token.is_cancelled() {
            tracing::debug!(command = %self.spec, "cancelled before start");
            return Err(Error::Cancelled);
        }
        self.run_until(token.cancelled()).await
    }

    /// Run with a deadline. Expiry interrupts the remote process like a
    /// cancellation and returns [`Error::CommandTimeout`].
    pub async fn run_with_timeout(self, timeout: Duration) -> Result<CommandResult> {
        self.run_until(tokio::time::sleep(timeout))
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::CommandTimeout(timeout),
                other => other,
            })
    }

    async fn run_until<F>(mut self, stop: F) -> Result<CommandResult>
    where
        F: Future<Output = ()>,
    {
        let finished = tokio::select! {
            // Completion wins when both are ready.
            biased;
            result = execute(&mut self.channel, &self.spec) => Some(result),
            () = stop => None,
        };

        match finished {
            Some(result) => {
                self.release().await;
                result
            }
            None => {
                tracing::debug!(command = %self.spec, "cancelled, interrupting remote process");
                if let Err(e) = self.channel.send_interrupt().await {
                    tracing::debug!(error = %e, "failed to deliver interrupt");
                }
                self.release().await;
                Err(Error::Cancelled)
            }
        }
    }

    async fn release(&mut self) {
        if let Err(e) = self.channel.close_channel().await {
            tracing::debug!(error = %e, "failed to close channel");
        }
    }
}

async fn execute<C: ExecChannel>(channel: &mut C, spec: &RemoteCommandSpec) -> Result<CommandResult> {
    for (name, value) in &spec.env {
        channel.send_env(name, value).await?;
    }

    let command_line = spec.command_line();
    tracing::debug!(command = %command_line, "starting remote command");
    channel.start_command(&command_line).await?;

    if let Some(input) = &spec.stdin {
        channel.send_stdin(input).await?;
    }
    channel.send_eof().await?;

    let result = collect(channel, spec.output).await?;
    tracing::debug!(
        command = %command_line,
        exit_status = result.exit_status,
        exit_signal = ?result.exit_signal,
        "remote command finished"
    );
    Ok(result)
}

async fn collect<C: ExecChannel>(channel: &mut C, mode: OutputMode) -> Result<CommandResult> {
    let mut result = CommandResult::default();
    let mut got_exit_status = false;
    let mut got_eof = false;

    loop {
        match channel.next_event().await {
            Some(ChannelEvent::Stdout(data)) => result.stdout.extend_from_slice(&data),
            Some(ChannelEvent::Stderr(data)) => match mode {
                OutputMode::Separate => result.stderr.extend_from_slice(&data),
                OutputMode::Combined => result.stdout.extend_from_slice(&data),
            },
            Some(ChannelEvent::ExitStatus(status)) => {
                result.exit_status = status;
                got_exit_status = true;
                if got_eof {
                    break;
                }
            }
            Some(ChannelEvent::ExitSignal(signal)) => {
                if !got_exit_status {
                    result.exit_status = SIGNAL_EXIT_STATUS;
                }
                result.exit_signal = Some(signal);
                got_exit_status = true;
                if got_eof {
                    break;
                }
            }
            Some(ChannelEvent::Rejected) => {
                return Err(Error::CommandExecution(
                    "remote host rejected the command".to_string(),
                ));
            }
            Some(ChannelEvent::Eof) => {
                got_eof = true;
                if got_exit_status {
                    break;
                }
            }
            Some(ChannelEvent::Close) | None => break,
        }
    }

    // No exit status means the process ended abnormally (dropped connection,
    // channel torn down).
    if !got_exit_status {
        return Err(Error::ChannelClosed);
    }
    Ok(result)
}
