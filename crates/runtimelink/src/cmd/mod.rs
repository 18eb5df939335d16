use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use runtimelink_peer::PortDiscovery;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod discover;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve `echo` and ping requests until interrupted.
    Serve(ServeArgs),
    /// Send one message, optionally waiting for the reply.
    Send(SendArgs),
    /// Read the port a loopback server published for an identifier.
    Discover(DiscoverArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Discover(args) => discover::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ServeTransport {
    Tcp,
    Loopback,
    Stdio,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ClientTransport {
    Tcp,
    Loopback,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: ServeTransport,
    /// Port to bind. `0` picks an ephemeral port.
    #[arg(long, env = "RUNTIMELINK_PORT", default_value_t = 0)]
    pub port: u16,
    /// Publish the loopback port in a port file under this identifier.
    #[arg(long, env = "RUNTIMELINK_IDENTIFIER")]
    pub identifier: Option<String>,
    /// Directory holding port files.
    #[arg(long, env = "RUNTIMELINK_DISCOVERY_DIR", value_name = "DIR")]
    pub discovery_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Message identifier the peer dispatches on.
    #[arg(long)]
    pub name: String,
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: ClientTransport,
    #[arg(long, env = "RUNTIMELINK_HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "RUNTIMELINK_PORT")]
    pub port: Option<u16>,
    /// Find the loopback port through the port file for this identifier.
    #[arg(long, env = "RUNTIMELINK_IDENTIFIER")]
    pub identifier: Option<String>,
    #[arg(long, env = "RUNTIMELINK_DISCOVERY_DIR", value_name = "DIR")]
    pub discovery_dir: Option<PathBuf>,
    /// JSON payload.
    #[arg(long, conflicts_with = "data")]
    pub json: Option<String>,
    /// String payload, sent as a JSON string.
    #[arg(long, conflicts_with = "json")]
    pub data: Option<String>,
    /// Wait for the reply and print it.
    #[arg(long)]
    pub wait: bool,
    /// Bound on connecting, discovery and the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// Identifier the loopback server published under.
    #[arg(env = "RUNTIMELINK_IDENTIFIER")]
    pub identifier: String,
    /// How long to poll for the port file (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s")]
    pub timeout: String,
    #[arg(long, env = "RUNTIMELINK_DISCOVERY_DIR", value_name = "DIR")]
    pub discovery_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn discovery(dir: Option<&PathBuf>) -> PortDiscovery {
    dir.map(PortDiscovery::new).unwrap_or_default()
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
