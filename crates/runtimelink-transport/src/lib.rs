//! Byte-stream transports for runtimelink.
//!
//! Every transport implements the [`Transport`] trait: it writes raw bytes,
//! pushes received bytes to a callback from its own reader thread, and
//! reports lifecycle changes. Message framing happens a layer up.
//!
//! - [`tcp`]: direct TCP client and listener
//! - [`service`]: discovered TCP (advertise/resolve seams)
//! - [`loopback`]: raw loopback socket on `127.0.0.1` (Unix)
//! - [`stdio`]: stdin/stdout or child-process pipes

pub mod error;
pub mod netif;
pub mod service;
pub mod stdio;
pub mod tcp;
pub mod transport;

#[cfg(unix)]
pub mod loopback;

pub use error::{Result, SocketOp, TransportError};
pub use service::{
    InMemoryServiceDirectory, ServiceAdvertiser, ServiceBrowser, ServiceRecord, SERVICE_TYPE,
};
pub use tcp::{Acceptor, TcpAcceptor, TcpOptions};
pub use transport::{BytesCallback, StateCallback, StreamTransport, Transport, TransportState};

#[cfg(unix)]
pub use loopback::LoopbackAcceptor;
