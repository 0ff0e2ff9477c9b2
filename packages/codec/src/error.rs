//! Error types for frame conversion and codec adapter operations.

use thiserror::Error;

/// Errors that can occur while converting frames or driving a codec adapter.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid parameter passed to a codec.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Frame dimensions the codec or converter cannot handle.
    #[error("invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Submitted input does not match the configured raw frame size.
    #[error("input size mismatch: expected {expected} bytes, got {actual}")]
    InputSizeMismatch { expected: usize, actual: usize },

    /// Codec call made in the wrong state (e.g. submit after end of input).
    #[error("invalid codec state: {0}")]
    InvalidState(String),

    /// The codec has already emitted its end-of-stream marker.
    #[error("codec reached end of stream")]
    EndOfStream,

    /// The codec could not be created or configured.
    #[error("failed to configure codec: {0}")]
    ConfigurationFailed(String),

    /// Frame conversion error.
    #[error("frame conversion error: {0}")]
    ConversionError(String),
}

impl CodecError {
    /// Create an InvalidParam error with a message.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create an InvalidState error with a message.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}
