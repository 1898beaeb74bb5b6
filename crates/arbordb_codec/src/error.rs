//! Error types for document encoding and decoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while encoding or decoding documents.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended before a complete value was decoded.
    #[error("unexpected end of input while decoding {context}")]
    UnexpectedEof {
        /// What was being decoded when the input ran out.
        context: &'static str,
    },

    /// An unknown value tag was encountered.
    #[error("invalid value tag: {tag:#04x}")]
    InvalidTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// A field name or text value was not valid UTF-8.
    #[error("invalid UTF-8 in {context}")]
    InvalidUtf8 {
        /// What was being decoded.
        context: &'static str,
    },

    /// Nesting exceeded the decoder's depth limit.
    #[error("value nesting exceeds maximum depth of {max}")]
    DepthExceeded {
        /// The depth limit.
        max: usize,
    },

    /// A declared length did not fit the remaining input.
    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOverflow {
        /// The declared length.
        declared: usize,
        /// Bytes actually remaining.
        remaining: usize,
    },
}

impl CodecError {
    /// Creates an unexpected-EOF error.
    pub(crate) fn eof(context: &'static str) -> Self {
        Self::UnexpectedEof { context }
    }
}
