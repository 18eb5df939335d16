use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runtimelink_peer::{
    connect_stdio, ConnectOptions, HandlerRegistry, PingRequest, Server, ServerConfig,
    VoidResponse,
};

use crate::cmd::{discovery, ServeArgs, ServeTransport};
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_record, Endpoint, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let handlers = Arc::new(HandlerRegistry::new());
    register_handlers(&handlers);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    match args.transport {
        ServeTransport::Stdio => serve_stdio(handlers, &running),
        ServeTransport::Tcp => {
            if args.identifier.is_some() {
                return Err(CliError::new(
                    USAGE,
                    "--identifier only applies to --transport loopback",
                ));
            }
            let config = ServerConfig {
                handlers,
                ..ServerConfig::default()
            };
            let server = Server::direct_tcp(args.port, config)
                .map_err(|err| peer_error("bind failed", err))?;
            let host = server.host().map(|addr| addr.to_string());
            print_record(
                &Endpoint {
                    transport: "tcp",
                    host,
                    port: server.port(),
                    identifier: None,
                },
                format,
            );
            serve_until_interrupted(&server, &running)
        }
        ServeTransport::Loopback => serve_loopback(&args, handlers, &running, format),
    }
}

fn register_handlers(handlers: &HandlerRegistry) {
    handlers.register("echo", |text: String| {
        tracing::info!(bytes = text.len(), "echo");
        Ok(text)
    });
    handlers.register_request(|_: PingRequest| Ok(VoidResponse {}));
}

#[cfg(unix)]
fn serve_loopback(
    args: &ServeArgs,
    handlers: Arc<HandlerRegistry>,
    running: &AtomicBool,
    format: OutputFormat,
) -> CliResult<i32> {
    let config = ServerConfig {
        handlers,
        ..ServerConfig::default()
    };
    let server = match &args.identifier {
        Some(identifier) => {
            let discovery = discovery(args.discovery_dir.as_ref());
            Server::loopback_discoverable(identifier, &discovery, config)
        }
        None => Server::loopback(args.port, config),
    }
    .map_err(|err| peer_error("bind failed", err))?;

    print_record(
        &Endpoint {
            transport: "loopback",
            host: server.host().map(|addr| addr.to_string()),
            port: server.port(),
            identifier: args.identifier.as_deref(),
        },
        format,
    );
    serve_until_interrupted(&server, running)
}

#[cfg(not(unix))]
fn serve_loopback(
    _args: &ServeArgs,
    _handlers: Arc<HandlerRegistry>,
    _running: &AtomicBool,
    _format: OutputFormat,
) -> CliResult<i32> {
    Err(CliError::new(USAGE, "loopback sockets require unix"))
}

fn serve_until_interrupted(server: &Server, running: &AtomicBool) -> CliResult<i32> {
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(POLL);
    }
    tracing::info!(port = server.port(), "interrupted, shutting down");
    server.stop();
    Ok(SUCCESS)
}

/// Serve this process's stdin/stdout until EOF or Ctrl-C.
fn serve_stdio(handlers: Arc<HandlerRegistry>, running: &AtomicBool) -> CliResult<i32> {
    let options = ConnectOptions {
        handlers,
        ..ConnectOptions::default()
    };
    let connection = connect_stdio(&options).map_err(|err| peer_error("stdio failed", err))?;
    while running.load(Ordering::SeqCst) {
        if connection.wait_stopped(POLL) {
            tracing::info!(
                reason = connection.stop_reason().as_deref().unwrap_or("unknown"),
                "stdio peer finished"
            );
            return Ok(SUCCESS);
        }
    }
    connection.stop();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
