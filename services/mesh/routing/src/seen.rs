//! Bounded cache of recently seen packet keys.

use mesh_wire::PacketKey;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Duplicate-suppression cache bounded by count and age.
///
/// Eviction is oldest first. A key whose entry aged out is treated as new.
#[derive(Debug)]
pub struct SeenCache {
    entries: HashMap<PacketKey, Instant>,
    order: VecDeque<(PacketKey, Instant)>,
    capacity: usize,
    retention: Duration,
}

impl SeenCache {
    /// Create a cache holding at most `capacity` keys for `retention`
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            retention,
        }
    }

    /// Whether `key` was seen within the retention window
    pub fn contains(&self, key: &PacketKey, now: Instant) -> bool {
        self.entries
            .get(key)
            .map(|seen| now.saturating_duration_since(*seen) < self.retention)
            .unwrap_or(false)
    }

    /// Record `key`; returns false if it was already present
    pub fn insert(&mut self, key: PacketKey, now: Instant) -> bool {
        if self.contains(&key, now) {
            return false;
        }

        self.entries.insert(key, now);
        self.order.push_back((key, now));
        while self.entries.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    /// Drop entries older than the retention window
    pub fn evict(&mut self, now: Instant) {
        while let Some((_, seen)) = self.order.front() {
            if now.saturating_duration_since(*seen) < self.retention {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((key, seen)) = self.order.pop_front() {
            // a re-inserted key has a newer timestamp and a later queue slot
            if self.entries.get(&key) == Some(&seen) {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
