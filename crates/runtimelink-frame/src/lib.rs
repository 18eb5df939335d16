//! Envelope encoding and stream framing for runtimelink.
//!
//! Every message is a JSON envelope followed by the 3-byte terminator
//! `\nOK`:
//! - `identifier` names the message kind
//! - `data` carries the JSON payload, base64 encoded
//!
//! A bare `{"message": ...}` object in place of an envelope is a relayed
//! error. No partial reads, no buffer management in user code.

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::{
    encode, encode_error, CodecConfig, Decoded, FrameCodec, DEFAULT_MAX_MESSAGE_SIZE, TERMINATOR,
};
pub use envelope::{Envelope, Inbound, RemoteError};
pub use error::{FrameError, Result};
