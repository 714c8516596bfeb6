//! Session error types.

use mesh_wire::PeerId;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No established session with the peer
    #[error("no established session with {0}")]
    NotReady(PeerId),

    /// Noise handshake processing failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Ciphertext failed authentication or was malformed
    #[error("decryption failed")]
    Decrypt,

    /// Nonce already seen or older than the replay window
    #[error("replayed nonce {0}")]
    Replay(u64),

    /// Plaintext too large for one Noise message
    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    /// Send nonce space used up; the session must be renegotiated
    #[error("nonce space exhausted")]
    Exhausted,
}

impl From<snow::Error> for SessionError {
    fn from(err: snow::Error) -> Self {
        SessionError::Handshake(err.to_string())
    }
}
