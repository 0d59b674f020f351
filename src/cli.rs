// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines the exec and hosts subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run commands on remote hosts over SSH with known_hosts verification")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: tether.yml in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command on a remote host
    Exec {
        /// Host alias from the config, or [user@]host[:port]
        target: String,

        /// Interrupt the command after this long (e.g. 30s, 5m)
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Private key file
        #[arg(short = 'i', long)]
        key: Option<PathBuf>,

        /// Read the password from this environment variable
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,

        /// Authenticate with the SSH agent
        #[arg(long)]
        agent: bool,

        /// known_hosts file to verify against
        #[arg(long)]
        known_hosts: Option<PathBuf>,

        /// Record the key of a host not yet in known_hosts
        #[arg(long)]
        accept_new: bool,

        /// Remote environment assignment
        #[arg(short, long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,

        /// Remote working directory
        #[arg(long)]
        dir: Option<String>,

        /// Command and arguments, joined with spaces for the remote shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List the trusted keys recorded for a host
    Hosts {
        /// host, host:port or [host]:port
        host: String,

        /// known_hosts file to read
        #[arg(long)]
        known_hosts: Option<PathBuf>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}
