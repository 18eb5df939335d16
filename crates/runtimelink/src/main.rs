mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

/// Serve, call and locate runtimelink endpoints.
///
/// Every message is a JSON envelope terminated by `\nOK`. Endpoints speak it
/// over direct or advertised TCP, a loopback socket announced through a port
/// file, or the stdin/stdout of a child process.
#[derive(Parser, Debug)]
#[command(name = "runtimelink", version)]
struct Cli {
    /// Result format for command output on stdout.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Diagnostic format on stderr.
    #[arg(
        long,
        value_name = "FORMAT",
        env = "RUNTIMELINK_LOG_FORMAT",
        default_value = "text",
        global = true
    )]
    log_format: LogFormat,

    #[arg(
        long,
        value_name = "LEVEL",
        env = "RUNTIMELINK_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    // Piped stdout gets JSON unless asked otherwise.
    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let code = match cmd::run(cli.command, format) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("runtimelink: {err}");
            err.code
        }
    };
    std::process::exit(code);
}
