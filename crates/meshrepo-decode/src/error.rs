//! Error types for decoding operations.

/// Errors that can occur while decoding or encoding mesh asset data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Input buffer is too small for the expected data.
    #[error("buffer too small: expected {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    /// Invalid data format or structure.
    #[error("invalid format in {context}: {detail}")]
    InvalidFormat {
        context: &'static str,
        detail: String,
    },
    /// Reading reached the end of the buffer.
    #[error("unexpected end of buffer in {context}")]
    UnexpectedEof { context: &'static str },
    /// Index out of bounds.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    /// A zlib stream could not be inflated or deflated.
    #[error("compression error in {context}: {detail}")]
    Compression {
        context: &'static str,
        detail: String,
    },
}

impl DecodeError {
    pub(crate) fn invalid(context: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidFormat {
            context,
            detail: detail.into(),
        }
    }
}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
