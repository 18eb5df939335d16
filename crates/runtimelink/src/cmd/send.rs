use std::time::Duration;

use runtimelink_peer::{connect_tcp, ConnectOptions, Connection, ConnectionConfig};
use runtimelink_transport::TcpOptions;
use serde_json::Value;

use crate::cmd::{parse_duration, ClientTransport, SendArgs};
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_record, OutputFormat, Reply};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;
    let connection = open(&args, timeout)?;

    let result = if args.wait {
        connection
            .call_with_timeout::<Value, Value>(&args.name, &payload, Some(timeout))
            .map(|reply| {
                print_record(
                    &Reply::new(&args.name, reply, connection.transport_name()),
                    format,
                );
            })
            .map_err(|err| peer_error("request failed", err))
    } else {
        connection
            .send(&args.name, &payload)
            .map_err(|err| peer_error("send failed", err))
    };
    connection.stop();
    result.map(|()| SUCCESS)
}

fn open(args: &SendArgs, timeout: Duration) -> CliResult<Connection> {
    let options = ConnectOptions {
        connection: ConnectionConfig {
            ready_timeout: timeout,
            ..ConnectionConfig::default()
        },
        tcp: TcpOptions {
            connect_timeout: timeout,
            ..TcpOptions::default()
        },
        discovery_timeout: timeout,
        ..ConnectOptions::default()
    };

    match args.transport {
        ClientTransport::Tcp => {
            let port = args
                .port
                .ok_or_else(|| CliError::new(USAGE, "--port is required for --transport tcp"))?;
            connect_tcp(&args.host, port, &options).map_err(|err| peer_error("connect failed", err))
        }
        ClientTransport::Loopback => open_loopback(args, &options),
    }
}

#[cfg(unix)]
fn open_loopback(args: &SendArgs, options: &ConnectOptions) -> CliResult<Connection> {
    let connection = match (&args.identifier, args.port) {
        (Some(identifier), _) => {
            let discovery = crate::cmd::discovery(args.discovery_dir.as_ref());
            runtimelink_peer::connect_loopback_discovered(identifier, &discovery, options)
        }
        (None, Some(port)) => runtimelink_peer::connect_loopback(port, options),
        (None, None) => {
            return Err(CliError::new(
                USAGE,
                "--transport loopback needs --identifier or --port",
            ))
        }
    };
    connection.map_err(|err| peer_error("connect failed", err))
}

#[cfg(not(unix))]
fn open_loopback(_args: &SendArgs, _options: &ConnectOptions) -> CliResult<Connection> {
    Err(CliError::new(USAGE, "loopback sockets require unix"))
}

/// The payload as JSON. With neither flag the message carries `{}`.
fn resolve_payload(args: &SendArgs) -> CliResult<Value> {
    if let Some(json) = &args.json {
        return serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")));
    }
    if let Some(data) = &args.data {
        return Ok(Value::String(data.clone()));
    }
    Ok(Value::Object(serde_json::Map::new()))
}
