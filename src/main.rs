// ABOUTME: Entry point for the tether CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether::config::{Config, EnvValue};
use tether::error::{Error, Result};
use tether::ssh::{
    self, FileKnownHosts, HostKeyPolicy, KnownHostsStore, RemoteCommandSpec, Session, fingerprint,
};
use tether::types::HostIdentity;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit code for a command interrupted with Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Exec {
            target,
            timeout,
            key,
            password_env,
            agent,
            known_hosts,
            accept_new,
            env,
            dir,
            command,
        } => {
            let mut host = config.resolve_target(&target)?;
            if key.is_some() {
                host.key = key;
            }
            if let Some(var) = password_env {
                host.password = Some(EnvValue::FromEnv { var, default: None });
            }
            host.agent |= agent;

            let mut session_config = config.session_config(&host)?;
            if let Some(path) = known_hosts {
                session_config = session_config.known_hosts_path(path);
            }
            if accept_new {
                session_config = session_config.host_key_policy(HostKeyPolicy::AcceptNew);
            }

            let mut spec = match command.split_first() {
                Some((path, args)) => RemoteCommandSpec::new(path).args(args.iter().cloned()),
                None => return Err(Error::InvalidConfig("no command given".to_string())),
            };
            for (name, value) in host.remote_env()? {
                spec = spec.env(name, value);
            }
            for assignment in &env {
                spec = spec.env_assignment(assignment);
            }
            if let Some(dir) = dir {
                spec = spec.dir(dir);
            }

            let auth = host.auth()?;
            let session = Session::connect_known_hosts(session_config, auth).await?;
            let timeout = timeout.unwrap_or(config.command_timeout);
            let code = exec(&session, spec, timeout).await;

            if let Err(e) = session.disconnect().await {
                tracing::debug!(error = %e, "disconnect failed");
            }
            code
        }
        Commands::Hosts { host, known_hosts } => {
            let path = known_hosts.or(config.known_hosts);
            hosts(&host, path).await
        }
    }
}

/// An explicit path must exist; otherwise a missing config means defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let cwd = std::env::current_dir()?;
            match Config::discover(&cwd) {
                Err(Error::ConfigNotFound(_)) => Ok(Config::default()),
                other => other,
            }
        }
    }
}

/// Run `spec`, cancelling on Ctrl-C or after `timeout`. Returns the remote
/// exit status.
async fn exec(session: &Session, spec: RemoteCommandSpec, timeout: Duration) -> Result<i32> {
    let command = session.remote_command(spec).await?;
    let token = CancellationToken::new();

    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling remote command");
                token.cancel();
            }
        })
    };
    // Always cancelled before `token` when the deadline fires.
    let expired = CancellationToken::new();
    let deadline = {
        let token = token.clone();
        let expired = expired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expired.cancel();
            token.cancel();
        })
    };

    let result = command.run_with_cancellation(token).await;
    let timed_out = expired.is_cancelled();
    interrupt.abort();
    deadline.abort();

    match result {
        Ok(output) => {
            std::io::stdout().write_all(&output.stdout)?;
            std::io::stderr().write_all(&output.stderr)?;
            if let Some(signal) = &output.exit_signal {
                eprintln!("remote command killed by signal {}", signal);
            }
            Ok(i32::try_from(output.exit_status).unwrap_or(i32::MAX))
        }
        Err(ssh::Error::Cancelled) if timed_out => Err(ssh::Error::CommandTimeout(timeout).into()),
        Err(ssh::Error::Cancelled) => {
            eprintln!("cancelled");
            Ok(EXIT_INTERRUPTED)
        }
        Err(e) => Err(e.into()),
    }
}

/// Print the fingerprints trusted for `host`. Exits 1 for an unknown host.
async fn hosts(host: &str, known_hosts: Option<PathBuf>) -> Result<i32> {
    let store = match known_hosts {
        Some(path) => FileKnownHosts::new(path),
        None => FileKnownHosts::at_default_path()?,
    };
    let identity = HostIdentity::parse(host).map_err(ssh::Error::from)?;
    let records = store.lookup(&identity).await?;

    if records.is_empty() {
        println!("{} is not a known host", identity);
        return Ok(1);
    }
    for record in &records {
        println!(
            "{} {} {}",
            identity,
            record.key().algorithm(),
            fingerprint(record.key())
        );
    }
    Ok(0)
}
