//! CBOR payload encoding for structured packet bodies.
//!
//! Announcements and the plaintext inside encrypted packets are small CBOR
//! maps. This module provides the map builder and lookup helpers plus the two
//! payload types built on them.

use crate::header::MessageId;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
    /// Required key absent or of the wrong type
    #[error("missing field {0}")]
    Missing(&'static str),
    /// Unknown enum discriminant
    #[error("unknown {field} value {value}")]
    Unknown {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },
}

/// CBOR metadata builder helper
#[derive(Debug, Clone, Default)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a u64 value
    pub fn insert_u64(mut self, key: &str, value: u64) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert binary data
    pub fn insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bytes(value.to_vec()));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Get u64 value from metadata
pub fn get_meta_u64(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u64> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get binary value from metadata
pub fn get_meta_bytes(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<Vec<u8>> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Bytes(b) = v {
            Some(b.clone())
        } else {
            None
        }
    })
}

/// Body of an `Announce` packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    /// Human-readable nickname
    pub nickname: String,
    /// Long-term Noise static public key
    pub static_key: Vec<u8>,
}

impl AnnouncePayload {
    /// Encode as CBOR
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        MetaBuilder::new()
            .insert_str("nick", &self.nickname)
            .insert_bytes("skey", &self.static_key)
            .build()
    }

    /// Decode from CBOR
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let meta = parse_meta(raw)?;
        Ok(Self {
            nickname: get_meta_str(&meta, "nick").unwrap_or_default(),
            static_key: get_meta_bytes(&meta, "skey").ok_or(CodecError::Missing("skey"))?,
        })
    }
}

/// Kind of plaintext carried inside session ciphertext
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateKind {
    /// Application message
    Message = 1,
    /// Acknowledges receipt of `message_id`
    DeliveryAck = 2,
}

impl TryFrom<u64> for PrivateKind {
    type Error = CodecError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PrivateKind::Message),
            2 => Ok(PrivateKind::DeliveryAck),
            _ => Err(CodecError::Unknown {
                field: "kind",
                value,
            }),
        }
    }
}

/// Plaintext carried inside `DataEncrypted` and `Ack` packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivatePayload {
    /// Payload kind
    pub kind: PrivateKind,
    /// Application-level message ID (the acknowledged ID for acks)
    pub message_id: MessageId,
    /// Message body (empty for acks)
    pub body: Bytes,
}

impl PrivatePayload {
    /// A private application message
    pub fn message(message_id: MessageId, body: Bytes) -> Self {
        Self {
            kind: PrivateKind::Message,
            message_id,
            body,
        }
    }

    /// An acknowledgment for `message_id`
    pub fn delivery_ack(message_id: MessageId) -> Self {
        Self {
            kind: PrivateKind::DeliveryAck,
            message_id,
            body: Bytes::new(),
        }
    }

    /// Encode as CBOR
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        MetaBuilder::new()
            .insert_u64("kind", self.kind as u64)
            .insert_u64("mid", self.message_id.0)
            .insert_bytes("body", &self.body)
            .build()
    }

    /// Decode from CBOR
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let meta = parse_meta(raw)?;
        let kind = get_meta_u64(&meta, "kind").ok_or(CodecError::Missing("kind"))?;
        Ok(Self {
            kind: PrivateKind::try_from(kind)?,
            message_id: MessageId(get_meta_u64(&meta, "mid").ok_or(CodecError::Missing("mid"))?),
            body: get_meta_bytes(&meta, "body").map(Bytes::from).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str("nick", "alice")
            .insert_u64("version", 1)
            .insert_bytes("data", b"test")
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(get_meta_str(&parsed, "nick"), Some("alice".to_string()));
        assert_eq!(get_meta_u64(&parsed, "version"), Some(1));
        assert_eq!(get_meta_bytes(&parsed, "data"), Some(b"test".to_vec()));
        assert_eq!(get_meta_u64(&parsed, "nick"), None);
    }

    #[test]
    fn test_announce_payload() {
        let announce = AnnouncePayload {
            nickname: "alice".to_string(),
            static_key: vec![7u8; 32],
        };
        let decoded = AnnouncePayload::decode(&announce.encode().unwrap()).unwrap();
        assert_eq!(announce, decoded);
    }

    #[test]
    fn test_announce_requires_static_key() {
        let raw = MetaBuilder::new().insert_str("nick", "x").build().unwrap();
        assert_eq!(
            AnnouncePayload::decode(&raw),
            Err(CodecError::Missing("skey"))
        );
    }

    #[test]
    fn test_private_payload_kinds() {
        let msg = PrivatePayload::message(MessageId(42), Bytes::from_static(b"hello"));
        assert_eq!(PrivatePayload::decode(&msg.encode().unwrap()).unwrap(), msg);

        let ack = PrivatePayload::delivery_ack(MessageId(42));
        let decoded = PrivatePayload::decode(&ack.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, PrivateKind::DeliveryAck);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(parse_meta(&[0xFF, 0x00]), Err(CodecError::MetaDecode));
        let not_a_map = {
            let mut buf = Vec::new();
            ciborium::into_writer(&ciborium::Value::Integer(3.into()), &mut buf).unwrap();
            buf
        };
        assert_eq!(parse_meta(&not_a_map), Err(CodecError::MetaDecode));
    }
}
