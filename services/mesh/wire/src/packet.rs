//! Packet framing for the wire protocol.
//!
//! This module provides the complete packet structure: fixed header, optional
//! recipient, optional fragment header and the length-prefixed payload.

use crate::header::{
    MessageId, PacketFlags, PacketType, PeerId, BASE_HEADER_SIZE, DEFAULT_TTL,
    FRAGMENT_HEADER_SIZE, LENGTH_PREFIX_SIZE, MAX_FRAGMENT_COUNT, MAX_PAYLOAD_SIZE, PEER_ID_SIZE,
    WIRE_VERSION,
};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fragment position within a split packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentHeader {
    /// 0-based fragment index
    pub index: u16,
    /// Total number of fragments
    pub count: u16,
}

/// Identity of a packet for duplicate suppression.
///
/// Fragments of the same packet share the message ID and differ by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey {
    /// Original sender
    pub sender: PeerId,
    /// Message ID assigned by the sender
    pub message_id: MessageId,
    /// Fragment index, if this is a fragment
    pub fragment_index: Option<u16>,
}

/// Complete wire packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version
    pub version: u8,
    /// Packet type
    pub typ: PacketType,
    /// Remaining hop budget
    pub ttl: u8,
    /// Sender-assigned message ID
    pub message_id: MessageId,
    /// Origination time in milliseconds since the unix epoch
    pub timestamp_ms: u64,
    /// Original sender
    pub sender: PeerId,
    /// Recipient (None = broadcast)
    pub recipient: Option<PeerId>,
    /// Fragment position (Fragment packets only)
    pub fragment: Option<FragmentHeader>,
    /// Opaque payload or ciphertext
    pub payload: Bytes,
}

/// Current time in milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Packet {
    /// Create a new packet with a fresh message ID and the default TTL
    pub fn new(typ: PacketType, sender: PeerId, recipient: Option<PeerId>, payload: Bytes) -> Self {
        Self {
            version: WIRE_VERSION,
            typ,
            ttl: DEFAULT_TTL,
            message_id: MessageId::random(),
            timestamp_ms: now_millis(),
            sender,
            recipient,
            fragment: None,
            payload,
        }
    }

    /// Set the hop budget
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the message ID
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Whether the packet is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Whether the packet is addressed to `peer` specifically
    pub fn is_addressed_to(&self, peer: PeerId) -> bool {
        self.recipient == Some(peer)
    }

    /// Key used by the seen-packet cache
    pub fn key(&self) -> PacketKey {
        PacketKey {
            sender: self.sender,
            message_id: self.message_id,
            fragment_index: self.fragment.map(|f| f.index),
        }
    }

    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        if self.recipient.is_some() {
            flags |= PacketFlags::HAS_RECIPIENT;
        }
        if self.fragment.is_some() {
            flags |= PacketFlags::FRAGMENT;
        }
        flags
    }

    /// Size of everything before the payload bytes
    pub fn header_size(&self) -> usize {
        Self::header_size_for(self.recipient.is_some(), self.fragment.is_some())
    }

    /// Header size for a packet with the given optional sections
    pub fn header_size_for(has_recipient: bool, is_fragment: bool) -> usize {
        let mut size = BASE_HEADER_SIZE;
        if has_recipient {
            size += PEER_ID_SIZE;
        }
        if is_fragment {
            size += FRAGMENT_HEADER_SIZE;
        }
        size + LENGTH_PREFIX_SIZE
    }

    /// Total size when encoded
    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// Copy of this packet for the next hop, with the TTL decremented by one
    pub fn relayed(&self) -> Result<Self, WireError> {
        if self.ttl == 0 {
            return Err(WireError::Ttl);
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Ok(next)
    }

    /// Encode the packet to a contiguous buffer (big-endian)
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::Size(self.payload.len()));
        }
        if (self.typ == PacketType::Fragment) != self.fragment.is_some() {
            return Err(WireError::Malformed("fragment header must match packet type"));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.version);
        buf.put_u8(self.typ as u8);
        buf.put_u8(self.ttl);
        buf.put_u8(self.flags().bits());
        buf.put_u64(self.message_id.0);
        buf.put_u64(self.timestamp_ms);
        buf.put_slice(self.sender.as_bytes());

        if let Some(recipient) = self.recipient {
            buf.put_slice(recipient.as_bytes());
        }

        if let Some(fragment) = self.fragment {
            buf.put_u16(fragment.index);
            buf.put_u16(fragment.count);
        }

        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode one packet from a complete frame
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let mut buf = frame;

        ensure(&buf, BASE_HEADER_SIZE)?;
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }

        let typ = PacketType::try_from(buf.get_u8())?;
        let ttl = buf.get_u8();
        let flags = PacketFlags::from_bits(buf.get_u8()).ok_or(WireError::Reserved)?;
        let message_id = MessageId(buf.get_u64());
        let timestamp_ms = buf.get_u64();
        let sender = read_peer_id(&mut buf)?;

        let recipient = if flags.contains(PacketFlags::HAS_RECIPIENT) {
            Some(read_peer_id(&mut buf)?)
        } else {
            None
        };

        let is_fragment = flags.contains(PacketFlags::FRAGMENT);
        if is_fragment != (typ == PacketType::Fragment) {
            return Err(WireError::Malformed("fragment flag does not match packet type"));
        }

        let fragment = if is_fragment {
            ensure(&buf, FRAGMENT_HEADER_SIZE)?;
            let index = buf.get_u16();
            let count = buf.get_u16();
            if count == 0 || count > MAX_FRAGMENT_COUNT || index >= count {
                return Err(WireError::Malformed("fragment index out of range"));
            }
            Some(FragmentHeader { index, count })
        } else {
            None
        };

        ensure(&buf, LENGTH_PREFIX_SIZE)?;
        let payload_len = buf.get_u16() as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WireError::Size(payload_len));
        }
        ensure(&buf, payload_len)?;
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        if buf.has_remaining() {
            return Err(WireError::Trailing(buf.remaining()));
        }

        Ok(Self {
            version,
            typ,
            ttl,
            message_id,
            timestamp_ms,
            sender,
            recipient,
            fragment,
            payload,
        })
    }
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn read_peer_id(buf: &mut &[u8]) -> Result<PeerId, WireError> {
    ensure(buf, PEER_ID_SIZE)?;
    let mut bytes = [0u8; PEER_ID_SIZE];
    buf.copy_to_slice(&mut bytes);
    Ok(PeerId::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> PeerId {
        PeerId::from_bytes(*b"AAAAAAAA")
    }

    fn bob() -> PeerId {
        PeerId::from_bytes(*b"BBBBBBBB")
    }

    #[test]
    fn test_packet_encode_decode() {
        let packet = Packet::new(
            PacketType::DataEncrypted,
            alice(),
            Some(bob()),
            Bytes::from_static(b"ciphertext"),
        )
        .with_ttl(3);

        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), packet.encoded_size());

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(packet, decoded);
        assert!(decoded.is_addressed_to(bob()));
    }

    #[test]
    fn test_broadcast_has_no_recipient_bytes() {
        let packet = Packet::new(
            PacketType::DataBroadcast,
            alice(),
            None,
            Bytes::from_static(b"hi"),
        );
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), BASE_HEADER_SIZE + LENGTH_PREFIX_SIZE + 2);
        assert!(Packet::decode(&bytes).unwrap().is_broadcast());
    }

    #[test]
    fn test_fragment_header_encode_decode() {
        let mut packet = Packet::new(PacketType::Fragment, alice(), None, Bytes::from_static(b"part"));
        packet.fragment = Some(FragmentHeader { index: 2, count: 5 });

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.fragment, Some(FragmentHeader { index: 2, count: 5 }));
        assert_eq!(decoded.key().fragment_index, Some(2));
    }

    #[test]
    fn test_decode_rejects_truncated_frames() {
        let packet = Packet::new(
            PacketType::DataBroadcast,
            alice(),
            Some(bob()),
            Bytes::from_static(b"hello world"),
        );
        let bytes = packet.encode().unwrap();

        for len in 0..bytes.len() {
            assert!(
                Packet::decode(&bytes[..len]).is_err(),
                "prefix of length {} must not decode",
                len
            );
        }
    }

    #[test]
    fn test_decode_rejects_bad_type_and_version() {
        let packet = Packet::new(PacketType::Announce, alice(), None, Bytes::new());
        let mut bytes = packet.encode().unwrap().to_vec();

        bytes[1] = 0x7F;
        assert_eq!(Packet::decode(&bytes), Err(WireError::Type(0x7F)));

        bytes[1] = PacketType::Announce as u8;
        bytes[0] = 9;
        assert_eq!(Packet::decode(&bytes), Err(WireError::Version(9)));
    }

    #[test]
    fn test_decode_rejects_reserved_flags_and_trailing_bytes() {
        let packet = Packet::new(PacketType::Announce, alice(), None, Bytes::new());
        let mut bytes = packet.encode().unwrap().to_vec();

        bytes[3] = 0x40;
        assert_eq!(Packet::decode(&bytes), Err(WireError::Reserved));

        bytes[3] = 0;
        bytes.push(0);
        assert_eq!(Packet::decode(&bytes), Err(WireError::Trailing(1)));
    }

    #[test]
    fn test_decode_rejects_oversized_length_field() {
        let packet = Packet::new(PacketType::DataBroadcast, alice(), None, Bytes::new());
        let mut bytes = packet.encode().unwrap().to_vec();
        let len_offset = bytes.len() - LENGTH_PREFIX_SIZE;
        bytes[len_offset..].copy_from_slice(&u16::MAX.to_be_bytes());

        assert_eq!(
            Packet::decode(&bytes),
            Err(WireError::Size(u16::MAX as usize))
        );
    }

    #[test]
    fn test_decode_rejects_fragment_flag_mismatch() {
        let packet = Packet::new(PacketType::DataBroadcast, alice(), None, Bytes::new());
        let mut bytes = packet.encode().unwrap().to_vec();
        bytes[3] = PacketFlags::FRAGMENT.bits();
        assert!(matches!(Packet::decode(&bytes), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let packet = Packet::new(
            PacketType::DataBroadcast,
            alice(),
            None,
            Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        );
        assert_eq!(packet.encode(), Err(WireError::Size(MAX_PAYLOAD_SIZE + 1)));
    }

    #[test]
    fn test_relayed_decrements_ttl() {
        let packet = Packet::new(PacketType::DataBroadcast, alice(), None, Bytes::new()).with_ttl(1);
        let next = packet.relayed().unwrap();
        assert_eq!(next.ttl, 0);
        assert_eq!(next.message_id, packet.message_id);
        assert_eq!(next.relayed(), Err(WireError::Ttl));
    }
}
