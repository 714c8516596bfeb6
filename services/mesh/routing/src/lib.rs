//! Flood relay routing for the radio mesh.
//!
//! There are no routing tables: every packet not addressed to us is
//! rebroadcast with its TTL decremented, and a bounded seen-packet cache keeps
//! floods loop-free. Oversized packets are fragmented to the radio frame size
//! and reassembled at the receiver.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod fragment;
pub mod router;
pub mod seen;

pub use fragment::{FragmentError, Fragmenter, Reassembler};
pub use router::*;
pub use seen::SeenCache;
