//! Wire protocol framing, identifiers and payload encoding for the radio mesh.
//!
//! This crate provides the low-level packet format shared by every node:
//! fixed big-endian header, optional recipient and fragment sections, a
//! length-prefixed payload, and the CBOR helpers used for structured bodies.
//!
//! ## Features
//!
//! - **Strict Decoding**: truncated, oversized or inconsistent frames are
//!   rejected with a [`WireError`], never a panic
//! - **Zero-Copy Payloads**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **CBOR Payloads**: announcements and encrypted plaintext are CBOR maps
//!
//! ## Wire Format
//!
//! ```text
//! +--------+--------+--------+--------+
//! | ver u8 | type u8| ttl u8 |flags u8|
//! +--------+--------+--------+--------+
//! | message_id u64                    |
//! | timestamp_ms u64                  |
//! | sender [8]                        |
//! | recipient [8]  (iff HAS_RECIPIENT)|
//! | frag index u16 | frag count u16   |  (iff FRAGMENT)
//! | payload_len u16                   |
//! | payload [payload_len]             |
//! +-----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod packet;

// Re-export main types
pub use codec::{
    get_meta_bytes, get_meta_str, get_meta_u64, parse_meta, AnnouncePayload, CodecError,
    MetaBuilder, PrivateKind, PrivatePayload,
};
pub use error::WireError;
pub use header::{
    MessageId, PacketFlags, PacketType, PeerId, BASE_HEADER_SIZE, DEFAULT_TTL,
    FRAGMENT_HEADER_SIZE, LENGTH_PREFIX_SIZE, MAX_FRAGMENT_COUNT, MAX_PAYLOAD_SIZE, PEER_ID_SIZE,
    WIRE_VERSION,
};
pub use packet::{now_millis, FragmentHeader, Packet, PacketKey};
