//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame ended before a complete field could be read
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the next field
        needed: usize,
        /// Bytes remaining in the buffer
        available: usize,
    },

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Invalid TTL for the requested operation
    #[error("invalid ttl")]
    Ttl,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown packet type
    #[error("unknown type {0}")]
    Type(u8),

    /// Malformed packet structure
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Bytes left over after the declared payload
    #[error("{0} trailing bytes after payload")]
    Trailing(usize),

    /// Invalid identifier text
    #[error("invalid identifier: {0}")]
    Identifier(String),
}
