// ABOUTME: SSH client module for remote command execution.
// ABOUTME: Known-hosts trust, authentication strategies, sessions, and cancellable commands.

mod auth;
mod client;
mod command;
mod error;
mod known_hosts;
mod security_context;
mod trust;

pub use auth::{Auth, AuthMethod};
pub use client::{Session, SessionConfig};
pub use command::{
    ChannelEvent, CommandResult, ExecChannel, OutputMode, RemoteCommand, RemoteCommandSpec,
    SIGNAL_EXIT_STATUS,
};
pub use error::{Error, Result};
pub use known_hosts::{FileKnownHosts, KeyRecord, KnownHostsStore, MemoryKnownHosts};
pub use security_context::{ContextPhase, SecurityContext, SecurityContextState};
pub use trust::{
    HostKeyPolicy, HostKeyVerifier, InsecureIgnoreHostKey, KnownHostsVerifier, TrustDecision,
    TrustVerifier, fingerprint,
};
