//! Wire error types.

use thiserror::Error;

/// Buffer and encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Write or read outside the declared bounds of a buffer
    #[error("out of bounds: offset={offset}, len={len}, max={max}")]
    OutOfBounds {
        /// Offset of the attempted access
        offset: usize,
        /// Length of the attempted access
        len: usize,
        /// Bound that was exceeded
        max: usize,
    },

    /// Read past the end of the available data
    #[error("end of buffer")]
    Eof,

    /// Invalid UTF-8 / UTF-16 data
    #[error("utf format error: {0}")]
    Utf(String),

    /// Decoded value does not fit the requested width
    #[error("value overflow: {0}")]
    Overflow(&'static str),

    /// Unknown value type identifier
    #[error("unknown type {0}")]
    Type(i32),

    /// Structurally invalid stream
    #[error("malformed stream: {0}")]
    Malformed(String),

    /// Serializer failure
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl WireError {
    /// Bounds error helper
    pub fn out_of_bounds(offset: usize, len: usize, max: usize) -> Self {
        WireError::OutOfBounds { offset, len, max }
    }
}
