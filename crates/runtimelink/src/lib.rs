//! Message-oriented RPC connections over byte-stream transports.
//!
//! runtimelink lets two processes exchange typed requests and responses over
//! direct TCP, discovered TCP, a loopback socket found through a port file,
//! or a stdio pipe. Every transport carries the same `\nOK`-terminated JSON
//! envelopes, so handlers and callers never care which one is underneath.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream transports and their lifecycle
//! - [`frame`]: envelope encoding and the streaming codec
//! - [`peer`]: connections, handler registry, port discovery, servers
//!   (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use runtimelink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use runtimelink_frame::*;
}

/// Re-export connection types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use runtimelink_peer::*;
}
