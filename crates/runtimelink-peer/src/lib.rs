//! Request/response connections over runtimelink transports.
//!
//! This is the "just works" layer. Open a [`Connection`] over any
//! transport, register handlers by identifier, and send typed requests.
//! One round trip is in flight per connection at a time.

pub mod connection;
pub mod connector;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod request;
pub mod server;
pub mod source;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
#[cfg(unix)]
pub use connector::{connect_loopback, connect_loopback_computed, connect_loopback_discovered};
pub use connector::{
    connect_child, connect_discovered, connect_stdio, connect_tcp, open, ConnectOptions,
};
pub use discovery::PortDiscovery;
pub use error::{DiscoveryError, PeerError, Result};
pub use registry::{Handler, HandlerError, HandlerRegistry, HandlerResult};
pub use request::{Null, PingRequest, Request, VoidResponse};
pub use server::{Server, ServerConfig, ServerState};
pub use source::{Communicator, Rendezvous, Role, RuntimeSource, Session};
