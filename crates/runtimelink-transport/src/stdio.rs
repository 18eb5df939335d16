use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use tracing::info;

use crate::error::Result;
use crate::transport::StreamTransport;

/// Build a transport over an arbitrary pair of pipe handles.
///
/// There is no connect phase: the transport is ready as soon as it starts.
/// A pending read cannot be interrupted, so after `stop()` the reader thread
/// lingers until the peer closes its end.
pub fn pipe(
    name: impl Into<String>,
    reader: impl Read + Send + 'static,
    writer: impl Write + Send + 'static,
) -> StreamTransport {
    StreamTransport::new(name, Box::new(reader), Box::new(writer), None)
}

/// This process's stdin/stdout.
pub fn process() -> StreamTransport {
    pipe("stdio", std::io::stdin(), std::io::stdout())
}

/// Spawn `command` with piped stdin/stdout and talk to it over those pipes.
///
/// The caller keeps ownership of the [`Child`] and is responsible for
/// waiting on it. Stopping the transport closes the child's stdin.
pub fn spawn(command: &mut Command) -> Result<(StreamTransport, Child)> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let missing = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child pipe missing");
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = child.stdout.take().ok_or_else(missing)?;
    info!(pid = child.id(), "spawned stdio peer");
    let transport = pipe(format!("stdio:{}", child.id()), stdout, stdin);
    Ok((transport, child))
}
