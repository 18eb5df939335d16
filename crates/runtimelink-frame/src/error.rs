/// Errors that can occur during envelope encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Envelopes must name their message kind.
    #[error("envelope identifier is empty")]
    EmptyIdentifier,

    /// A terminated chunk was neither an envelope nor an error shape.
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    /// Unterminated input grew past the configured limit and was discarded.
    #[error("message too large ({size} bytes buffered, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A payload did not match the expected type.
    #[error("payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
