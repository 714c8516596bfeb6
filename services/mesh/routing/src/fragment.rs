//! Fragmentation and reassembly of oversized packets.
//!
//! An encoded packet larger than the radio frame is split into `Fragment`
//! packets whose payloads are consecutive slices of the encoded bytes. All
//! fragments share the original sender, recipient and message ID.

use bytes::{Bytes, BytesMut};
use mesh_wire::{FragmentHeader, MessageId, Packet, PacketType, PeerId, WireError, MAX_FRAGMENT_COUNT};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Fragmentation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Packet encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Frame too small to carry any fragment payload
    #[error("frame size {0} leaves no room for fragment payload")]
    FrameTooSmall(usize),

    /// Packet would need more than the maximum number of fragments
    #[error("packet needs {0} fragments")]
    TooManyFragments(usize),

    /// Packet is not a fragment
    #[error("not a fragment")]
    NotAFragment,

    /// Fragment count differs from the buffered set
    #[error("fragment count {got} does not match buffered count {expected}")]
    CountMismatch {
        /// Count of the buffered set
        expected: u16,
        /// Count carried by this fragment
        got: u16,
    },

    /// Same index received twice
    #[error("duplicate fragment index {0}")]
    DuplicateIndex(u16),

    /// Reassembled bytes do not form a valid packet from the same sender
    #[error("reassembled packet is invalid")]
    InvalidReassembly,
}

/// Splits encoded packets to fit a frame size
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    max_frame_size: usize,
}

impl Fragmenter {
    /// Create a fragmenter for frames of at most `max_frame_size` bytes
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Configured frame limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Split `packet` (already encoded as `encoded`) into fragment packets
    pub fn split(&self, packet: &Packet, encoded: &Bytes) -> Result<Vec<Packet>, FragmentError> {
        let overhead = Packet::header_size_for(packet.recipient.is_some(), true);
        let chunk_size = self
            .max_frame_size
            .checked_sub(overhead)
            .filter(|size| *size > 0)
            .ok_or(FragmentError::FrameTooSmall(self.max_frame_size))?;

        let count = encoded.len().div_ceil(chunk_size);
        if count > MAX_FRAGMENT_COUNT as usize {
            return Err(FragmentError::TooManyFragments(count));
        }

        let fragments = encoded
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| Packet {
                version: packet.version,
                typ: PacketType::Fragment,
                ttl: packet.ttl,
                message_id: packet.message_id,
                timestamp_ms: packet.timestamp_ms,
                sender: packet.sender,
                recipient: packet.recipient,
                fragment: Some(FragmentHeader {
                    index: index as u16,
                    count: count as u16,
                }),
                payload: encoded.slice_ref(chunk),
            })
            .collect();

        debug!(
            message_id = %packet.message_id,
            size = encoded.len(),
            count,
            "Fragmented packet"
        );
        Ok(fragments)
    }
}

struct FragmentSet {
    count: u16,
    pieces: Vec<Option<Bytes>>,
    received: u16,
    first_seen: Instant,
}

/// Buffers fragments per (sender, message ID) until a set is complete
pub struct Reassembler {
    sets: HashMap<(PeerId, MessageId), FragmentSet>,
    timeout: Duration,
    max_sets: usize,
}

impl Reassembler {
    /// Create a reassembler with the given timeout and set bound
    pub fn new(timeout: Duration, max_sets: usize) -> Self {
        Self {
            sets: HashMap::new(),
            timeout,
            max_sets: max_sets.max(1),
        }
    }

    /// Add one fragment; returns the decoded inner packet once complete
    pub fn add(&mut self, fragment: &Packet, now: Instant) -> Result<Option<Packet>, FragmentError> {
        let header = fragment.fragment.ok_or(FragmentError::NotAFragment)?;
        let set_key = (fragment.sender, fragment.message_id);

        if !self.sets.contains_key(&set_key) && self.sets.len() >= self.max_sets {
            self.evict_oldest();
        }

        let set = self.sets.entry(set_key).or_insert_with(|| FragmentSet {
            count: header.count,
            pieces: vec![None; header.count as usize],
            received: 0,
            first_seen: now,
        });

        // a set that disagrees with itself can never reassemble correctly
        if set.count != header.count {
            let expected = set.count;
            self.discard(&set_key);
            return Err(FragmentError::CountMismatch {
                expected,
                got: header.count,
            });
        }
        let Some(slot) = set.pieces.get_mut(header.index as usize) else {
            self.discard(&set_key);
            return Err(WireError::Malformed("fragment index out of range").into());
        };
        if slot.is_some() {
            return Err(FragmentError::DuplicateIndex(header.index));
        }
        *slot = Some(fragment.payload.clone());
        set.received += 1;

        if set.received < set.count {
            return Ok(None);
        }

        let Some(set) = self.sets.remove(&set_key) else {
            return Ok(None);
        };
        let mut buf = BytesMut::new();
        for piece in set.pieces.into_iter().flatten() {
            buf.extend_from_slice(&piece);
        }

        let inner = Packet::decode(&buf)?;
        if inner.sender != fragment.sender
            || inner.message_id != fragment.message_id
            || inner.typ == PacketType::Fragment
        {
            return Err(FragmentError::InvalidReassembly);
        }
        Ok(Some(inner))
    }

    /// Drop incomplete sets older than the timeout; returns how many
    pub fn evict(&mut self, now: Instant) -> usize {
        let before = self.sets.len();
        let timeout = self.timeout;
        self.sets
            .retain(|_, set| now.saturating_duration_since(set.first_seen) < timeout);
        before - self.sets.len()
    }

    fn discard(&mut self, key: &(PeerId, MessageId)) {
        debug!(sender = %key.0, message_id = %key.1, "Discarding malformed fragment set");
        self.sets.remove(key);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.first_seen)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            debug!(sender = %key.0, message_id = %key.1, "Evicting oldest fragment set");
            self.sets.remove(&key);
        }
    }

    /// Number of incomplete sets
    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_packet(size: usize) -> Packet {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        Packet::new(
            PacketType::DataBroadcast,
            PeerId::from_bytes(*b"AAAAAAAA"),
            None,
            Bytes::from(payload),
        )
    }

    #[test]
    fn test_split_respects_frame_size() {
        let packet = big_packet(2000);
        let encoded = packet.encode().unwrap();
        let fragments = Fragmenter::new(512).split(&packet, &encoded).unwrap();

        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.encode().unwrap().len() <= 512);
            assert_eq!(fragment.message_id, packet.message_id);
        }
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let now = Instant::now();
        let packet = big_packet(3000);
        let encoded = packet.encode().unwrap();
        let mut fragments = Fragmenter::new(256).split(&packet, &encoded).unwrap();
        fragments.reverse();
        fragments.swap(0, 2);

        let mut reassembler = Reassembler::new(Duration::from_secs(30), 8);
        let last = fragments.pop().unwrap();
        for fragment in &fragments {
            assert_eq!(reassembler.add(fragment, now).unwrap(), None);
        }
        let inner = reassembler.add(&last, now).unwrap().unwrap();
        assert_eq!(inner, packet);
        assert_eq!(reassembler.pending_sets(), 0);
    }

    #[test]
    fn test_incomplete_set_times_out() {
        let now = Instant::now();
        let packet = big_packet(1000);
        let encoded = packet.encode().unwrap();
        let fragments = Fragmenter::new(256).split(&packet, &encoded).unwrap();

        let mut reassembler = Reassembler::new(Duration::from_secs(30), 8);
        for fragment in &fragments[1..] {
            reassembler.add(fragment, now).unwrap();
        }
        assert_eq!(reassembler.evict(now + Duration::from_secs(31)), 1);

        // the late piece starts a fresh set and never completes the old one
        assert_eq!(reassembler.add(&fragments[0], now + Duration::from_secs(32)).unwrap(), None);
    }

    #[test]
    fn test_malformed_fragments() {
        let now = Instant::now();
        let packet = big_packet(1000);
        let encoded = packet.encode().unwrap();
        let fragments = Fragmenter::new(256).split(&packet, &encoded).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(30), 8);

        reassembler.add(&fragments[0], now).unwrap();
        assert_eq!(
            reassembler.add(&fragments[0], now),
            Err(FragmentError::DuplicateIndex(0))
        );

        let mut wrong_count = fragments[1].clone();
        wrong_count.fragment = Some(FragmentHeader { index: 1, count: 99 });
        assert!(matches!(
            reassembler.add(&wrong_count, now),
            Err(FragmentError::CountMismatch { .. })
        ));

        assert_eq!(reassembler.add(&packet, now), Err(FragmentError::NotAFragment));
    }

    #[test]
    fn test_duplicate_keeps_set_but_mismatch_discards_it() {
        let now = Instant::now();
        let packet = big_packet(1000);
        let encoded = packet.encode().unwrap();
        let fragments = Fragmenter::new(256).split(&packet, &encoded).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(30), 8);

        // a repeated piece is ignored and the set still completes
        reassembler.add(&fragments[0], now).unwrap();
        assert!(reassembler.add(&fragments[0], now).is_err());
        for fragment in &fragments[1..fragments.len() - 1] {
            assert_eq!(reassembler.add(fragment, now).unwrap(), None);
        }
        let last = &fragments[fragments.len() - 1];
        assert_eq!(reassembler.add(last, now).unwrap(), Some(packet.clone()));

        // a conflicting count throws away everything buffered so far
        reassembler.add(&fragments[0], now).unwrap();
        let mut wrong_count = fragments[1].clone();
        wrong_count.fragment = Some(FragmentHeader { index: 1, count: 99 });
        assert!(reassembler.add(&wrong_count, now).is_err());
        assert_eq!(reassembler.pending_sets(), 0);

        // so do out-of-range indexes
        reassembler.add(&fragments[0], now).unwrap();
        let mut out_of_range = fragments[1].clone();
        out_of_range.fragment = Some(FragmentHeader {
            index: fragments.len() as u16,
            count: fragments.len() as u16,
        });
        assert!(matches!(
            reassembler.add(&out_of_range, now),
            Err(FragmentError::Wire(_))
        ));
        assert_eq!(reassembler.pending_sets(), 0);

        // the remaining pieces alone never complete the discarded message
        for fragment in &fragments[1..] {
            assert_eq!(reassembler.add(fragment, now).unwrap(), None);
        }
    }

    #[test]
    fn test_set_bound_evicts_oldest() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(30), 2);
        for i in 0..3u64 {
            let packet = big_packet(600);
            let encoded = packet.encode().unwrap();
            let fragments = Fragmenter::new(256).split(&packet, &encoded).unwrap();
            reassembler
                .add(&fragments[0], now + Duration::from_millis(i))
                .unwrap();
        }
        assert_eq!(reassembler.pending_sets(), 2);
    }

    #[test]
    fn test_tiny_frame_is_rejected() {
        let packet = big_packet(100);
        let encoded = packet.encode().unwrap();
        assert_eq!(
            Fragmenter::new(10).split(&packet, &encoded),
            Err(FragmentError::FrameTooSmall(10))
        );
    }
}
