//! Packet types, flags and identifiers for the wire protocol.
//!
//! This module defines the fixed part of every packet: the type tag, the flag
//! bits and the 8-byte routing identifiers carried in each frame.

use bitflags::bitflags;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Size of the fixed header: ver, type, ttl, flags, message_id, timestamp, sender
pub const BASE_HEADER_SIZE: usize = 4 + 8 + 8 + PEER_ID_SIZE;

/// Size of a peer identifier in bytes
pub const PEER_ID_SIZE: usize = 8;

/// Size of the optional fragment header (index + count)
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Size of the payload length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Hard maximum payload length accepted by the decoder (32 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Maximum number of fragments a single packet may be split into
pub const MAX_FRAGMENT_COUNT: u16 = 256;

/// Default hop budget for originated packets
pub const DEFAULT_TTL: u8 = 7;

/// Packet types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Identity announcement (nickname + static key)
    Announce = 0x01,
    /// Noise handshake message 1 (initiator to responder)
    HandshakeInit = 0x02,
    /// Noise handshake message 2 (responder to initiator)
    HandshakeResp = 0x03,
    /// Noise handshake message 3 (initiator to responder)
    HandshakeFinish = 0x04,
    /// Private message encrypted under a Noise session
    DataEncrypted = 0x05,
    /// Public plaintext message for everyone in range
    DataBroadcast = 0x06,
    /// Piece of a larger encoded packet
    Fragment = 0x07,
    /// Encrypted delivery acknowledgment
    Ack = 0x08,
}

impl PacketType {
    /// Whether packets of this type carry a Noise handshake message
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::HandshakeInit | PacketType::HandshakeResp | PacketType::HandshakeFinish
        )
    }

    /// Whether the payload is session ciphertext
    pub fn is_encrypted(self) -> bool {
        matches!(self, PacketType::DataEncrypted | PacketType::Ack)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Announce),
            0x02 => Ok(PacketType::HandshakeInit),
            0x03 => Ok(PacketType::HandshakeResp),
            0x04 => Ok(PacketType::HandshakeFinish),
            0x05 => Ok(PacketType::DataEncrypted),
            0x06 => Ok(PacketType::DataBroadcast),
            0x07 => Ok(PacketType::Fragment),
            0x08 => Ok(PacketType::Ack),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PacketFlags: u8 {
        /// Recipient ID follows the sender ID
        const HAS_RECIPIENT = 1 << 0;
        /// Fragment header follows the addressing block
        const FRAGMENT = 1 << 1;
    }
}

/// Ephemeral 8-byte routing identifier.
///
/// Ordering is lexicographic over the raw bytes, which is what the handshake
/// tie-break relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    /// Wrap raw identifier bytes
    pub const fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Parse from 16 hex characters
    pub fn from_hex(text: &str) -> Result<Self, crate::WireError> {
        let raw = hex::decode(text).map_err(|_| crate::WireError::Identifier(text.to_string()))?;
        let bytes: [u8; PEER_ID_SIZE] = raw
            .try_into()
            .map_err(|_| crate::WireError::Identifier(text.to_string()))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = crate::WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Identifier of an originated packet; preserved across relays and shared by
/// all fragments of one packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Generate a fresh random message ID
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:016x})", self.0)
    }
}
