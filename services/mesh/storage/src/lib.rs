//! Store-and-forward delivery for the radio mesh.
//!
//! Private messages for trusted peers that are currently out of range are held
//! here until a PeerID resolving to the recipient's fingerprint shows up
//! again. The queue is bounded by age, attempts and count, and persisted
//! through a pluggable backend (in-memory or file).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod queue;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_identity::Fingerprint;
use mesh_wire::MessageId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// A message waiting for its recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    /// Queue-local identifier, increasing in enqueue order
    pub id: u64,
    /// Who the message is for
    pub recipient: Fingerprint,
    /// Application plaintext
    pub plaintext: Bytes,
    /// Message ID assigned when the application sent it
    pub message_id: MessageId,
    /// Enqueue time (unix ms)
    pub queued_at: u64,
    /// Delivery attempts so far
    pub attempts: u32,
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trust-policy rejection
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    /// Recipient is not a favorite
    #[error("peer {0} is not trusted")]
    Untrusted(Fingerprint),
    /// Recipient is blocked
    #[error("peer {0} is blocked")]
    Blocked(Fingerprint),
}

/// Persistence for the pending queue
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Load every persisted entry
    async fn load(&self) -> Result<Vec<PendingDelivery>, StorageError>;

    /// Replace the persisted contents with `entries`
    async fn save(&self, entries: &[PendingDelivery]) -> Result<(), StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (lost on restart)
    #[default]
    InMemory,
    /// Snapshot file under `data_dir`
    File {
        /// Data directory path
        data_dir: String,
        /// Fsync after every snapshot write
        fsync: bool,
    },
}

// Re-export backend implementations
pub use backend::file::{FilePendingStore, FileStoreConfig};
pub use backend::mem::MemoryPendingStore;
pub use queue::{QueueConfig, StoreForwardQueue};

/// Create the pending store for `mode`
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn PendingStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryPendingStore::new())),
        StorageMode::File { data_dir, fsync } => {
            let config = FileStoreConfig {
                data_dir: data_dir.into(),
                fsync,
            };
            Ok(Arc::new(FilePendingStore::new(config).await?))
        }
    }
}
