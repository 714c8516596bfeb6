//! Identity error types.

use thiserror::Error;

/// Identity errors
#[derive(Error, Debug)]
pub enum IdentityError {
    /// I/O error while reading or writing key material
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file contents are not a valid key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Fingerprint text is not 64 hex characters
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}
