//! Noise sessions for the radio mesh.
//!
//! Every pair of peers that exchanges private messages negotiates a
//! `Noise_XX_25519_ChaChaPoly_SHA256` session. PeerIDs are ephemeral, so the
//! session is authenticated by the remote static key and surfaced as its
//! fingerprint.
//!
//! ## Features
//!
//! - **Deterministic Tie-break**: the lexicographically smaller PeerID
//!   initiates; the other side sends a directed announcement
//! - **Loss Tolerant Transport**: explicit nonces with a 64-entry replay window
//! - **Lifecycle Tracking**: every state change is recorded as a
//!   [`SessionTransition`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod manager;
pub mod noise;
pub mod replay;
pub mod session;

pub use error::SessionError;
pub use manager::NoiseSessionManager;
pub use noise::{NOISE_PARAMS, NONCE_SIZE, TAG_SIZE};
pub use replay::{ReplayWindow, REPLAY_WINDOW};
pub use session::{
    HandshakeStep, Role, SessionConfig, SessionState, SessionTransition, TransitionReason,
};
