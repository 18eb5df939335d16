use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] runtimelink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] runtimelink_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Port discovery error.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The connection never became ready.
    #[error("connection is not connected")]
    NotConnected,

    /// The connection stopped while a call was outstanding.
    #[error("connection closed")]
    Closed,

    /// The peer answered with the in-band error shape.
    #[error("remote error: {0}")]
    Remote(String),

    /// Request or setup timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The requested session kind is not available here.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors from the file-based port rendezvous.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The port file did not appear before the deadline.
    #[error("port file not found at '{}' after {timeout:?}", path.display())]
    NotFound { path: PathBuf, timeout: Duration },

    /// The port file exists but does not hold a port number.
    #[error("port file '{}' has invalid content {content:?}", path.display())]
    Invalid { path: PathBuf, content: String },

    #[error("port file I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Identifiers must produce a non-empty file name.
    #[error("invalid discovery identifier {0:?}")]
    InvalidIdentifier(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;
