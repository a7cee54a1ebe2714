//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Attempted to frame an empty payload
    #[error("empty payload")]
    EmptyPayload,

    /// Payload exceeds the maximum frame payload size
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Length prefix read from the stream is zero or above the limit
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    /// Underlying stream failure (including EOF mid-frame)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether this error is a framing protocol violation rather than an I/O failure
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, WireError::InvalidLength(_))
    }
}
