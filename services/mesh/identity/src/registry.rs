//! PeerID to fingerprint registry.
//!
//! Every (PeerID, Fingerprint) pair ever observed is kept for the lifetime of
//! the process. Lookups by PeerID return the latest observation; lookups by
//! fingerprint return every PeerID the peer has used, newest first.

use crate::Fingerprint;
use mesh_wire::PeerId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One recorded association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Transport identifier
    pub peer: PeerId,
    /// Fingerprint it resolved to
    pub fingerprint: Fingerprint,
    /// Observation time (unix ms)
    pub observed_at: u64,
}

/// Append-only PeerID/fingerprint table
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    latest: HashMap<PeerId, Fingerprint>,
    // oldest first; re-observation moves a peer to the back
    by_fingerprint: HashMap<Fingerprint, Vec<PeerId>>,
    pairs: HashSet<(PeerId, Fingerprint)>,
    history: Vec<Observation>,
    nicknames: HashMap<Fingerprint, String>,
}

impl IdentityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` resolved to `fingerprint`.
    ///
    /// Returns true when the pair had not been seen before.
    pub fn observe(&mut self, peer: PeerId, fingerprint: Fingerprint, now_ms: u64) -> bool {
        self.latest.insert(peer, fingerprint);

        let peers = self.by_fingerprint.entry(fingerprint).or_default();
        if peers.last() != Some(&peer) {
            peers.retain(|p| *p != peer);
            peers.push(peer);
        }

        if !self.pairs.insert((peer, fingerprint)) {
            return false;
        }

        debug!(%peer, fingerprint = %fingerprint.short(), "New identity observation");
        self.history.push(Observation {
            peer,
            fingerprint,
            observed_at: now_ms,
        });
        true
    }

    /// Latest fingerprint observed for `peer`
    pub fn fingerprint_for(&self, peer: PeerId) -> Option<Fingerprint> {
        self.latest.get(&peer).copied()
    }

    /// Snapshot of the latest fingerprint for every known PeerID
    pub fn all_mappings(&self) -> HashMap<PeerId, Fingerprint> {
        self.latest.clone()
    }

    /// All PeerIDs observed for `fingerprint`, newest first
    pub fn peers_for(&self, fingerprint: &Fingerprint) -> Vec<PeerId> {
        self.by_fingerprint
            .get(fingerprint)
            .map(|peers| peers.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    /// Most recently observed PeerID for `fingerprint`
    pub fn latest_peer_for(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|peers| peers.last().copied())
    }

    /// Full observation history in arrival order
    pub fn history(&self) -> &[Observation] {
        &self.history
    }

    /// Remember the nickname a fingerprint announced
    pub fn set_nickname(&mut self, fingerprint: Fingerprint, nickname: &str) {
        if nickname.is_empty() {
            return;
        }
        self.nicknames.insert(fingerprint, nickname.to_string());
    }

    /// Last announced nickname
    pub fn nickname_for(&self, fingerprint: &Fingerprint) -> Option<&str> {
        self.nicknames.get(fingerprint).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 8])
    }

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::from_static_key(&[b; 32])
    }

    #[test]
    fn test_observe_is_idempotent() {
        let mut registry = IdentityRegistry::new();
        assert!(registry.observe(peer(1), fp(1), 10));
        assert!(!registry.observe(peer(1), fp(1), 20));

        assert_eq!(registry.history().len(), 1);
        assert_eq!(registry.fingerprint_for(peer(1)), Some(fp(1)));
        assert_eq!(registry.peers_for(&fp(1)), vec![peer(1)]);
    }

    #[test]
    fn test_fingerprint_survives_peer_id_churn() {
        let mut registry = IdentityRegistry::new();
        registry.observe(peer(1), fp(9), 1);
        registry.observe(peer(2), fp(9), 2);
        registry.observe(peer(3), fp(9), 3);

        assert_eq!(registry.peers_for(&fp(9)), vec![peer(3), peer(2), peer(1)]);
        assert_eq!(registry.latest_peer_for(&fp(9)), Some(peer(3)));
        // old identifiers still resolve
        assert_eq!(registry.fingerprint_for(peer(1)), Some(fp(9)));
        assert_eq!(registry.all_mappings().len(), 3);
    }

    #[test]
    fn test_reobservation_makes_peer_newest() {
        let mut registry = IdentityRegistry::new();
        registry.observe(peer(1), fp(9), 1);
        registry.observe(peer(2), fp(9), 2);
        registry.observe(peer(1), fp(9), 3);

        assert_eq!(registry.latest_peer_for(&fp(9)), Some(peer(1)));
        assert_eq!(registry.peers_for(&fp(9)), vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_history_is_append_only() {
        let mut registry = IdentityRegistry::new();
        registry.observe(peer(1), fp(1), 1);
        registry.observe(peer(1), fp(2), 2);

        // latest wins for lookups, both pairs remain in history
        assert_eq!(registry.fingerprint_for(peer(1)), Some(fp(2)));
        assert_eq!(registry.history().len(), 2);
        assert_eq!(registry.history()[0].fingerprint, fp(1));
        assert_eq!(registry.peers_for(&fp(1)), vec![peer(1)]);
    }

    #[test]
    fn test_unknown_lookups() {
        let registry = IdentityRegistry::new();
        assert_eq!(registry.fingerprint_for(peer(7)), None);
        assert!(registry.peers_for(&fp(7)).is_empty());
        assert_eq!(registry.latest_peer_for(&fp(7)), None);
    }

    #[test]
    fn test_nicknames() {
        let mut registry = IdentityRegistry::new();
        registry.set_nickname(fp(1), "alice");
        registry.set_nickname(fp(1), "");
        assert_eq!(registry.nickname_for(&fp(1)), Some("alice"));
        assert_eq!(registry.nickname_for(&fp(2)), None);
    }
}
