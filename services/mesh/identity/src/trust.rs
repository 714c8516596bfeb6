//! Trust decisions keyed by fingerprint.

use crate::Fingerprint;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::info;

/// Trust boundary consulted by the coordinator and the store-and-forward queue
pub trait TrustPolicy: Send + Sync {
    /// Whether messages for this peer may be held for later delivery
    fn is_trusted(&self, fingerprint: &Fingerprint) -> bool;

    /// Whether all traffic from and to this peer is refused
    fn is_blocked(&self, fingerprint: &Fingerprint) -> bool;
}

/// In-memory favorites and blocks, shareable between the app and the mesh.
///
/// Cloning shares the underlying sets.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustStore {
    favorites: Arc<DashSet<Fingerprint>>,
    blocked: Arc<DashSet<Fingerprint>>,
}

impl MemoryTrustStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a peer as favorite
    pub fn favorite(&self, fingerprint: Fingerprint) {
        info!(fingerprint = %fingerprint.short(), "Peer favorited");
        self.favorites.insert(fingerprint);
    }

    /// Remove a favorite
    pub fn unfavorite(&self, fingerprint: &Fingerprint) {
        if self.favorites.remove(fingerprint).is_some() {
            info!(fingerprint = %fingerprint.short(), "Peer unfavorited");
        }
    }

    /// Block a peer; a blocked peer is never a favorite
    pub fn block(&self, fingerprint: Fingerprint) {
        info!(fingerprint = %fingerprint.short(), "Peer blocked");
        self.favorites.remove(&fingerprint);
        self.blocked.insert(fingerprint);
    }

    /// Lift a block
    pub fn unblock(&self, fingerprint: &Fingerprint) {
        self.blocked.remove(fingerprint);
    }

    /// Current favorites
    pub fn favorites(&self) -> Vec<Fingerprint> {
        self.favorites.iter().map(|f| *f).collect()
    }
}

impl TrustPolicy for MemoryTrustStore {
    fn is_trusted(&self, fingerprint: &Fingerprint) -> bool {
        self.favorites.contains(fingerprint) && !self.blocked.contains(fingerprint)
    }

    fn is_blocked(&self, fingerprint: &Fingerprint) -> bool {
        self.blocked.contains(fingerprint)
    }
}
