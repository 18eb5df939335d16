use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// The socket call that failed during transport setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOp {
    Create,
    Bind,
    Listen,
    Accept,
    Connect,
    Configure,
}

impl fmt::Display for SocketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketOp::Create => "socket",
            SocketOp::Bind => "bind",
            SocketOp::Listen => "listen",
            SocketOp::Accept => "accept",
            SocketOp::Connect => "connect",
            SocketOp::Configure => "setsockopt",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A raw socket call failed. `source` carries the OS error code.
    #[error("{op} failed on 127.0.0.1:{port}: {source}")]
    Socket {
        op: SocketOp,
        port: u16,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The host name did not resolve to any address.
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// A setup operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport never started or has already stopped.
    #[error("transport is not connected")]
    NotConnected,

    /// `start()` was called twice.
    #[error("transport already started")]
    AlreadyStarted,

    /// The listener has been shut down.
    #[error("transport shut down")]
    Shutdown,

    /// No advertised service matched the requested name.
    #[error("service not found: {name}")]
    ServiceNotFound { name: String },
}

impl TransportError {
    /// The underlying OS error code, when the failure came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            TransportError::Socket { source, .. }
            | TransportError::Connect { source, .. }
            | TransportError::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn socket(op: SocketOp, port: u16) -> Self {
        TransportError::Socket {
            op,
            port,
            source: std::io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
