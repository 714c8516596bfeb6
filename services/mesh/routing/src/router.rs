//! Flood relay decision logic

use crate::fragment::{FragmentError, Fragmenter, Reassembler};
use crate::seen::SeenCache;
use bytes::Bytes;
use mesh_wire::{Packet, PacketType, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of keys in the seen-packet cache
    pub seen_capacity: usize,
    /// How long a seen key suppresses duplicates
    pub seen_retention: Duration,
    /// Largest frame the radio carries
    pub max_frame_size: usize,
    /// Incomplete fragment sets are dropped after this long
    pub fragment_timeout: Duration,
    /// Maximum concurrent fragment sets
    pub max_fragment_sets: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            seen_capacity: 4096,
            seen_retention: Duration::from_secs(300),
            max_frame_size: 512,
            fragment_timeout: Duration::from_secs(30),
            max_fragment_sets: 64,
        }
    }
}

/// Routing decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Packet accepted: hand `deliver` up and/or rebroadcast `relay`
    Accept {
        /// Logical packet for local processing
        deliver: Option<Packet>,
        /// Copy with decremented TTL for the next hop
        relay: Option<Packet>,
    },
    /// Drop packet
    Drop(DropReason),
}

/// Reason for dropping a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Key seen within the retention window
    Duplicate,
    /// Our own packet echoed back
    OwnEcho,
    /// Addressed elsewhere and out of hops
    TtlExpired,
    /// Fragment inconsistent with its set or reassembly failed
    MalformedFragment,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Duplicate => write!(f, "duplicate"),
            DropReason::OwnEcho => write!(f, "own echo"),
            DropReason::TtlExpired => write!(f, "TTL expired"),
            DropReason::MalformedFragment => write!(f, "malformed fragment"),
        }
    }
}

/// Router statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Packets offered to the router
    pub packets_received: u64,
    /// Packets handed up for local processing
    pub packets_delivered: u64,
    /// Packets rebroadcast
    pub packets_relayed: u64,
    /// Packets dropped
    pub packets_dropped: u64,
    /// Fragment sets completed
    pub packets_reassembled: u64,
    /// Packets originated locally
    pub packets_originated: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

/// TTL flood router with duplicate suppression and fragment handling
pub struct RelayRouter {
    local_peer: PeerId,
    seen: SeenCache,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    stats: RouterStats,
}

impl RelayRouter {
    /// Create a router for `local_peer`
    pub fn new(local_peer: PeerId, config: RouterConfig) -> Self {
        Self {
            local_peer,
            seen: SeenCache::new(config.seen_capacity, config.seen_retention),
            fragmenter: Fragmenter::new(config.max_frame_size),
            reassembler: Reassembler::new(config.fragment_timeout, config.max_fragment_sets),
            stats: RouterStats::default(),
        }
    }

    /// Local node ID
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Decide what to do with one decoded inbound packet
    pub fn route_inbound(&mut self, packet: Packet, now: Instant) -> RoutingDecision {
        self.stats.packets_received += 1;

        if packet.sender == self.local_peer {
            return self.reject(DropReason::OwnEcho);
        }
        if !self.seen.insert(packet.key(), now) {
            return self.reject(DropReason::Duplicate);
        }

        let for_us = packet.is_addressed_to(self.local_peer);
        let relay = if !for_us && packet.ttl > 0 {
            packet.relayed().ok()
        } else {
            None
        };

        if !for_us && !packet.is_broadcast() {
            return match relay {
                Some(relay) => {
                    self.stats.packets_relayed += 1;
                    RoutingDecision::Accept {
                        deliver: None,
                        relay: Some(relay),
                    }
                }
                None => self.reject(DropReason::TtlExpired),
            };
        }

        let deliver = if packet.typ == PacketType::Fragment {
            match self.reassemble(&packet, now) {
                Ok(inner) => inner,
                Err(e) => {
                    debug!(sender = %packet.sender, error = %e, "Dropping fragment");
                    return self.reject(DropReason::MalformedFragment);
                }
            }
        } else {
            Some(packet)
        };

        if deliver.is_some() {
            self.stats.packets_delivered += 1;
        }
        if relay.is_some() {
            self.stats.packets_relayed += 1;
        }
        RoutingDecision::Accept { deliver, relay }
    }

    fn reassemble(&mut self, fragment: &Packet, now: Instant) -> Result<Option<Packet>, FragmentError> {
        let Some(inner) = self.reassembler.add(fragment, now)? else {
            return Ok(None);
        };
        self.stats.packets_reassembled += 1;

        // the logical packet is deduplicated on its own key as well
        if !self.seen.insert(inner.key(), now) {
            debug!(message_id = %inner.message_id, "Reassembled duplicate");
            return Ok(None);
        }
        Ok(Some(inner))
    }

    /// Encode a locally originated packet into radio frames.
    ///
    /// The packet is marked as seen so that echoes are ignored, and split into
    /// fragments when it exceeds the frame size.
    pub fn originate(&mut self, packet: &Packet, now: Instant) -> Result<Vec<Bytes>, FragmentError> {
        self.seen.insert(packet.key(), now);
        self.stats.packets_originated += 1;
        self.encode_frames(packet)
    }

    /// Encode any packet into one or more radio frames
    pub fn encode_frames(&self, packet: &Packet) -> Result<Vec<Bytes>, FragmentError> {
        let encoded = packet.encode()?;
        if encoded.len() <= self.fragmenter.max_frame_size() || packet.typ == PacketType::Fragment {
            return Ok(vec![encoded]);
        }

        self.fragmenter
            .split(packet, &encoded)?
            .iter()
            .map(|fragment| fragment.encode().map_err(FragmentError::from))
            .collect()
    }

    /// Age out seen keys and incomplete fragment sets
    pub fn evict(&mut self, now: Instant) {
        self.seen.evict(now);
        let dropped = self.reassembler.evict(now);
        if dropped > 0 {
            debug!(dropped, "Evicted incomplete fragment sets");
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RouterStats {
        self.stats.clone()
    }

    fn reject(&mut self, reason: DropReason) -> RoutingDecision {
        self.stats.packets_dropped += 1;
        *self.stats.drop_reasons.entry(reason.to_string()).or_insert(0) += 1;
        RoutingDecision::Drop(reason)
    }
}
