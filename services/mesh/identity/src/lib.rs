//! Peer identity for the radio mesh.
//!
//! Routing uses ephemeral 8-byte PeerIDs that change on every restart; trust
//! uses the SHA-256 fingerprint of a peer's long-term Noise static key. This
//! crate connects the two and carries the local node's own key material.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fingerprint;
pub mod keys;
pub mod registry;
pub mod trust;

pub use error::IdentityError;
pub use fingerprint::{Fingerprint, FINGERPRINT_SIZE};
pub use keys::{NodeIdentity, STATIC_KEY_SIZE};
pub use registry::{IdentityRegistry, Observation};
pub use trust::{MemoryTrustStore, TrustPolicy};
