//! Bounded store-and-forward queue.

use crate::{PendingDelivery, PendingStore, PolicyError, StorageError};
use bytes::Bytes;
use mesh_identity::{Fingerprint, TrustPolicy};
use mesh_wire::MessageId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Queue limits
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Entries older than this are dropped
    pub max_age: Duration,
    /// Entries with more attempts than this are dropped
    pub max_attempts: u32,
    /// Per-recipient bound (oldest dropped first)
    pub max_per_peer: usize,
    /// Global bound (oldest dropped first)
    pub max_total: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(12 * 60 * 60),
            max_attempts: 5,
            max_per_peer: 100,
            max_total: 1000,
        }
    }
}

/// Messages held for trusted peers that are out of range.
///
/// A flushed entry stays in the queue, and on disk, until the recipient
/// acknowledges it ([`StoreForwardQueue::complete`]). While a delivery attempt
/// is running the entry is marked in flight so it is not flushed twice. The
/// mark is not persisted: after a restart every entry is waiting again.
pub struct StoreForwardQueue {
    config: QueueConfig,
    store: Arc<dyn PendingStore>,
    trust: Arc<dyn TrustPolicy>,
    // keyed by id, so iteration is enqueue order
    entries: BTreeMap<u64, PendingDelivery>,
    in_flight: HashSet<u64>,
    next_id: u64,
}

impl StoreForwardQueue {
    /// Open the queue, reloading whatever the store persisted
    pub async fn open(
        config: QueueConfig,
        store: Arc<dyn PendingStore>,
        trust: Arc<dyn TrustPolicy>,
    ) -> Result<Self, StorageError> {
        let entries: BTreeMap<u64, PendingDelivery> = store
            .load()
            .await?
            .into_iter()
            .map(|entry| (entry.id, entry))
            .collect();
        let next_id = entries.keys().next_back().map_or(1, |id| id + 1);

        if !entries.is_empty() {
            info!(pending = entries.len(), "Restored store-and-forward queue");
        }

        Ok(Self {
            config,
            store,
            trust,
            entries,
            in_flight: HashSet::new(),
            next_id,
        })
    }

    fn check_policy(&self, recipient: &Fingerprint) -> Result<(), PolicyError> {
        if self.trust.is_blocked(recipient) {
            return Err(PolicyError::Blocked(*recipient));
        }
        if !self.trust.is_trusted(recipient) {
            return Err(PolicyError::Untrusted(*recipient));
        }
        Ok(())
    }

    /// Hold a message for a trusted recipient; returns the entry id
    pub async fn enqueue(
        &mut self,
        recipient: Fingerprint,
        message_id: MessageId,
        plaintext: Bytes,
        now_ms: u64,
    ) -> Result<u64, PolicyError> {
        self.check_policy(&recipient)?;

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            PendingDelivery {
                id,
                recipient,
                plaintext,
                message_id,
                queued_at: now_ms,
                attempts: 0,
            },
        );
        debug!(id, recipient = %recipient.short(), %message_id, "Queued for later delivery");

        self.enforce_bounds();
        self.persist().await;
        Ok(id)
    }

    /// Put back an entry taken earlier that could not be delivered.
    ///
    /// Keeps the original id and attempt count, so ordering is preserved. If
    /// the recipient lost trust meanwhile the entry is dropped for good.
    pub async fn requeue(&mut self, delivery: PendingDelivery) -> Result<(), PolicyError> {
        self.in_flight.remove(&delivery.id);
        if let Err(e) = self.check_policy(&delivery.recipient) {
            if self.entries.remove(&delivery.id).is_some() {
                self.persist().await;
            }
            return Err(e);
        }
        self.next_id = self.next_id.max(delivery.id + 1);
        self.entries.insert(delivery.id, delivery);
        self.enforce_bounds();
        self.persist().await;
        Ok(())
    }

    /// Start delivering everything waiting for `recipient`, oldest first.
    ///
    /// The returned entries are marked in flight and stay persisted until
    /// [`complete`](Self::complete) or [`release`](Self::release). Trust is
    /// checked again: if the recipient lost it, its messages are discarded and
    /// nothing is returned.
    pub async fn take_for(&mut self, recipient: &Fingerprint) -> Vec<PendingDelivery> {
        let ids: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.recipient == *recipient && !self.in_flight.contains(&e.id))
            .map(|e| e.id)
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }

        if let Err(e) = self.check_policy(recipient) {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.recipient != *recipient);
            self.prune_in_flight();
            warn!(
                recipient = %recipient.short(),
                discarded = before - self.entries.len(),
                reason = %e,
                "Discarding queued messages"
            );
            self.persist().await;
            return Vec::new();
        }

        let mut taken = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.attempts += 1;
                taken.push(entry.clone());
                self.in_flight.insert(id);
            }
        }
        // attempt counts survive a restart
        self.persist().await;

        info!(recipient = %recipient.short(), count = taken.len(), "Flushing queued messages");
        taken
    }

    /// The recipient acknowledged `message_id`: forget the entry.
    ///
    /// Returns whether an entry was removed.
    pub async fn complete(&mut self, recipient: &Fingerprint, message_id: MessageId) -> bool {
        let id = self
            .entries
            .values()
            .find(|e| e.recipient == *recipient && e.message_id == message_id)
            .map(|e| e.id);
        let Some(id) = id else {
            return false;
        };

        self.entries.remove(&id);
        self.in_flight.remove(&id);
        debug!(id, recipient = %recipient.short(), %message_id, "Held message delivered");
        self.persist().await;
        true
    }

    /// A delivery attempt was abandoned; the entry waits for the next flush
    pub fn release(&mut self, id: u64) {
        self.in_flight.remove(&id);
    }

    /// Apply age, attempt, trust and count limits; returns how many were dropped
    pub async fn evict(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        let max_age_ms = self.config.max_age.as_millis() as u64;
        let max_attempts = self.config.max_attempts;
        let trust = Arc::clone(&self.trust);

        self.entries.retain(|_, e| {
            now_ms.saturating_sub(e.queued_at) <= max_age_ms
                && e.attempts <= max_attempts
                && trust.is_trusted(&e.recipient)
                && !trust.is_blocked(&e.recipient)
        });
        self.enforce_bounds();
        self.prune_in_flight();

        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "Evicted pending deliveries");
            self.persist().await;
        }
        dropped
    }

    fn enforce_bounds(&mut self) {
        let mut per_peer: HashMap<Fingerprint, usize> = HashMap::new();
        for entry in self.entries.values() {
            *per_peer.entry(entry.recipient).or_insert(0) += 1;
        }

        // oldest first, so the newest entries are the ones kept
        let mut doomed = Vec::new();
        for entry in self.entries.values() {
            let Some(count) = per_peer.get_mut(&entry.recipient) else {
                continue;
            };
            if *count > self.config.max_per_peer {
                *count -= 1;
                doomed.push(entry.id);
            }
        }
        for id in doomed {
            self.entries.remove(&id);
        }

        while self.entries.len() > self.config.max_total {
            self.entries.pop_first();
        }
        self.prune_in_flight();
    }

    fn prune_in_flight(&mut self) {
        let entries = &self.entries;
        self.in_flight.retain(|id| entries.contains_key(id));
    }

    async fn persist(&self) {
        let snapshot: Vec<PendingDelivery> = self.entries.values().cloned().collect();
        if let Err(e) = self.store.save(&snapshot).await {
            error!("Failed to persist pending queue: {}", e);
        }
    }

    /// Total queued entries, in flight or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries for `recipient` waiting to be flushed
    pub fn pending_for(&self, recipient: &Fingerprint) -> usize {
        self.entries
            .values()
            .filter(|e| e.recipient == *recipient && !self.in_flight.contains(&e.id))
            .count()
    }

    /// Number of entries with a delivery attempt running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Distinct recipients with queued messages
    pub fn recipients(&self) -> Vec<Fingerprint> {
        let mut recipients: Vec<Fingerprint> =
            self.entries.values().map(|e| e.recipient).collect();
        recipients.sort();
        recipients.dedup();
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilePendingStore, FileStoreConfig, MemoryPendingStore};
    use mesh_identity::MemoryTrustStore;
    use tempfile::TempDir;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::from_static_key(name.as_bytes())
    }

    async fn queue(config: QueueConfig) -> (StoreForwardQueue, MemoryTrustStore, MemoryPendingStore) {
        let trust = MemoryTrustStore::new();
        let store = MemoryPendingStore::new();
        let q = StoreForwardQueue::open(config, Arc::new(store.clone()), Arc::new(trust.clone()))
            .await
            .unwrap();
        (q, trust, store)
    }

    #[tokio::test]
    async fn test_enqueue_requires_trust() {
        let (mut q, trust, _) = queue(QueueConfig::default()).await;
        let bob = fp("bob");

        assert_eq!(
            q.enqueue(bob, MessageId(1), Bytes::from_static(b"x"), 0).await,
            Err(PolicyError::Untrusted(bob))
        );

        trust.favorite(bob);
        assert!(q.enqueue(bob, MessageId(1), Bytes::from_static(b"x"), 0).await.is_ok());

        trust.block(bob);
        assert_eq!(
            q.enqueue(bob, MessageId(2), Bytes::from_static(b"y"), 0).await,
            Err(PolicyError::Blocked(bob))
        );
    }

    #[tokio::test]
    async fn test_take_for_is_oldest_first_and_exactly_once() {
        let (mut q, trust, _) = queue(QueueConfig::default()).await;
        let bob = fp("bob");
        let carol = fp("carol");
        trust.favorite(bob);
        trust.favorite(carol);

        for i in 0..3u64 {
            q.enqueue(bob, MessageId(i), Bytes::from(vec![i as u8]), i).await.unwrap();
        }
        q.enqueue(carol, MessageId(9), Bytes::new(), 5).await.unwrap();

        let taken = q.take_for(&bob).await;
        let ids: Vec<u64> = taken.iter().map(|e| e.message_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(taken.iter().all(|e| e.attempts == 1));

        assert!(q.take_for(&bob).await.is_empty());
        assert_eq!(q.pending_for(&bob), 0);
        assert_eq!(q.in_flight(), 3);
        assert_eq!(q.pending_for(&carol), 1);

        for entry in &taken {
            assert!(q.complete(&bob, entry.message_id).await);
        }
        assert!(!q.complete(&bob, MessageId(0)).await);
        assert_eq!(q.len(), 1);
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_released_entry_is_flushed_again() {
        let (mut q, trust, _) = queue(QueueConfig::default()).await;
        let bob = fp("bob");
        trust.favorite(bob);
        q.enqueue(bob, MessageId(1), Bytes::from_static(b"x"), 0).await.unwrap();

        let taken = q.take_for(&bob).await;
        q.release(taken[0].id);
        assert_eq!(q.pending_for(&bob), 1);

        let again = q.take_for(&bob).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_revoked_trust_discards_on_flush() {
        let (mut q, trust, _) = queue(QueueConfig::default()).await;
        let bob = fp("bob");
        trust.favorite(bob);
        q.enqueue(bob, MessageId(1), Bytes::from_static(b"secret"), 0).await.unwrap();

        trust.unfavorite(&bob);
        assert!(q.take_for(&bob).await.is_empty());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_after_revocation_drops_entry() {
        let (mut q, trust, store) = queue(QueueConfig::default()).await;
        let bob = fp("bob");
        trust.favorite(bob);
        q.enqueue(bob, MessageId(1), Bytes::from_static(b"x"), 0).await.unwrap();
        let taken = q.take_for(&bob).await;

        trust.unfavorite(&bob);
        assert_eq!(
            q.requeue(taken[0].clone()).await,
            Err(PolicyError::Untrusted(bob))
        );
        assert!(q.is_empty());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evict_limits() {
        let config = QueueConfig {
            max_age: Duration::from_secs(60),
            max_attempts: 2,
            max_per_peer: 2,
            max_total: 3,
        };
        let (mut q, trust, _) = queue(config).await;
        let (bob, carol) = (fp("bob"), fp("carol"));
        trust.favorite(bob);
        trust.favorite(carol);

        // per-peer bound keeps the newest two
        for i in 0..3u64 {
            q.enqueue(bob, MessageId(i), Bytes::new(), 1_000 + i).await.unwrap();
        }
        assert_eq!(q.pending_for(&bob), 2);

        // global bound drops the oldest overall
        q.enqueue(carol, MessageId(10), Bytes::new(), 1_010).await.unwrap();
        q.enqueue(carol, MessageId(11), Bytes::new(), 1_011).await.unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.pending_for(&bob), 1);

        // age
        assert_eq!(q.evict(1_002 + 60_001).await, 1);
        assert_eq!(q.pending_for(&bob), 0);

        // trust revocation
        trust.unfavorite(&carol);
        assert_eq!(q.evict(1_011).await, 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_attempts_limit() {
        let config = QueueConfig {
            max_attempts: 1,
            ..QueueConfig::default()
        };
        let (mut q, trust, _) = queue(config).await;
        let bob = fp("bob");
        trust.favorite(bob);
        q.enqueue(bob, MessageId(1), Bytes::new(), 0).await.unwrap();

        for _ in 0..2 {
            let taken = q.take_for(&bob).await;
            for entry in taken {
                q.requeue(entry).await.unwrap();
            }
        }
        assert_eq!(q.evict(0).await, 1);
    }

    #[tokio::test]
    async fn test_queue_is_persisted() {
        let (mut q, trust, store) = queue(QueueConfig::default()).await;
        let bob = fp("bob");
        trust.favorite(bob);
        q.enqueue(bob, MessageId(1), Bytes::from_static(b"a"), 0).await.unwrap();
        q.enqueue(bob, MessageId(2), Bytes::from_static(b"b"), 0).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 2);

        let reopened = StoreForwardQueue::open(
            QueueConfig::default(),
            Arc::new(store.clone()),
            Arc::new(trust.clone()),
        )
        .await
        .unwrap();
        assert_eq!(reopened.pending_for(&bob), 2);
    }

    #[tokio::test]
    async fn test_file_backed_restart() {
        let dir = TempDir::new().unwrap();
        let config = FileStoreConfig {
            data_dir: dir.path().to_path_buf(),
            fsync: false,
        };
        let trust = MemoryTrustStore::new();
        let bob = fp("bob");
        trust.favorite(bob);

        {
            let store = FilePendingStore::new(config.clone()).await.unwrap();
            let mut q = StoreForwardQueue::open(
                QueueConfig::default(),
                Arc::new(store),
                Arc::new(trust.clone()),
            )
            .await
            .unwrap();
            q.enqueue(bob, MessageId(7), Bytes::from_static(b"later"), 0).await.unwrap();
        }

        let store = FilePendingStore::new(config).await.unwrap();
        let mut q = StoreForwardQueue::open(QueueConfig::default(), Arc::new(store), Arc::new(trust))
            .await
            .unwrap();
        let taken = q.take_for(&bob).await;
        assert_eq!(taken.len(), 1);
        assert_eq!(&taken[0].plaintext[..], b"later");

        // ids keep increasing after a restart
        q.requeue(taken[0].clone()).await.unwrap();
        let id = q.enqueue(bob, MessageId(8), Bytes::new(), 0).await.unwrap();
        assert!(id > taken[0].id);
    }

    #[tokio::test]
    async fn test_restart_while_flushing_keeps_message() {
        let dir = TempDir::new().unwrap();
        let config = FileStoreConfig {
            data_dir: dir.path().to_path_buf(),
            fsync: false,
        };
        let trust = MemoryTrustStore::new();
        let bob = fp("bob");
        trust.favorite(bob);

        // flushed, but the process stops before bob acknowledges
        {
            let store = FilePendingStore::new(config.clone()).await.unwrap();
            let mut q = StoreForwardQueue::open(
                QueueConfig::default(),
                Arc::new(store),
                Arc::new(trust.clone()),
            )
            .await
            .unwrap();
            q.enqueue(bob, MessageId(7), Bytes::from_static(b"later"), 0).await.unwrap();
            assert_eq!(q.take_for(&bob).await.len(), 1);
        }

        let store = FilePendingStore::new(config.clone()).await.unwrap();
        let mut q = StoreForwardQueue::open(
            QueueConfig::default(),
            Arc::new(store),
            Arc::new(trust.clone()),
        )
        .await
        .unwrap();
        assert_eq!(q.pending_for(&bob), 1);
        let taken = q.take_for(&bob).await;
        assert_eq!(&taken[0].plaintext[..], b"later");
        assert_eq!(taken[0].attempts, 2);

        // acknowledged: gone across restarts too
        assert!(q.complete(&bob, MessageId(7)).await);
        drop(q);
        let store = FilePendingStore::new(config).await.unwrap();
        let q = StoreForwardQueue::open(QueueConfig::default(), Arc::new(store), Arc::new(trust))
            .await
            .unwrap();
        assert!(q.is_empty());
    }
}
