//! In-memory storage backend for development and testing

use crate::{PendingDelivery, PendingStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory pending store; clones share contents
#[derive(Clone, Default)]
pub struct MemoryPendingStore {
    entries: Arc<DashMap<u64, PendingDelivery>>,
}

impl MemoryPendingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingStore for MemoryPendingStore {
    async fn load(&self) -> Result<Vec<PendingDelivery>, StorageError> {
        let mut entries: Vec<PendingDelivery> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn save(&self, entries: &[PendingDelivery]) -> Result<(), StorageError> {
        debug!("Pending snapshot entries={}", entries.len());
        self.entries.clear();
        for entry in entries {
            self.entries.insert(entry.id, entry.clone());
        }
        Ok(())
    }
}
