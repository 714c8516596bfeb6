//! File-based storage backend with checksummed snapshots
//!
//! The queue is small, so it is persisted as one snapshot file rewritten on
//! every change:
//!
//! ```text
//! +-----------+-------------+-------------+-------------+----------------+
//! | magic 4B  | version u32 | len u32     | crc32 u32   | JSON entries   |
//! +-----------+-------------+-------------+-------------+----------------+
//! ```
//!
//! Writes go to a temporary file that is renamed over the old snapshot.

use crate::{PendingDelivery, PendingStore, StorageError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

const SNAPSHOT_MAGIC: &[u8; 4] = b"RMSF";
const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "pending.snap";

/// Configuration for the file-based store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Fsync after every write
    pub fsync: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./meshdata"),
            fsync: true,
        }
    }
}

/// Snapshot file header
#[derive(Debug)]
struct SnapshotHeader {
    version: u32,
    len: u32,   // JSON length (not including header)
    crc32: u32, // CRC32 over the JSON bytes
}

impl SnapshotHeader {
    const SIZE: usize = 4 + 4 + 4 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SNAPSHOT_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc32);
    }

    fn decode(mut buf: &[u8]) -> Result<Self, StorageError> {
        if buf.remaining() < Self::SIZE {
            return Err(StorageError::Corruption(
                "Incomplete snapshot header".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != SNAPSHOT_MAGIC {
            return Err(StorageError::Corruption("Bad snapshot magic".to_string()));
        }

        Ok(Self {
            version: buf.get_u32_le(),
            len: buf.get_u32_le(),
            crc32: buf.get_u32_le(),
        })
    }

    fn compute_crc(body: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(body);
        hasher.finalize()
    }
}

/// File-based pending store
pub struct FilePendingStore {
    config: FileStoreConfig,
}

impl FilePendingStore {
    /// Create the store, ensuring the data directory exists
    pub async fn new(config: FileStoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config.data_dir.join(SNAPSHOT_FILE)
    }
}

#[async_trait]
impl PendingStore for FilePendingStore {
    async fn load(&self) -> Result<Vec<PendingDelivery>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = fs::read(&path)?;
        let header = SnapshotHeader::decode(&raw)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported snapshot version {}",
                header.version
            )));
        }

        let body = &raw[SnapshotHeader::SIZE..];
        if body.len() != header.len as usize {
            return Err(StorageError::Corruption(format!(
                "Snapshot length mismatch: header {} actual {}",
                header.len,
                body.len()
            )));
        }
        if SnapshotHeader::compute_crc(body) != header.crc32 {
            return Err(StorageError::Corruption(
                "Snapshot checksum mismatch".to_string(),
            ));
        }

        let entries: Vec<PendingDelivery> = serde_json::from_slice(body)?;
        info!(
            "Loaded {} pending deliveries from {}",
            entries.len(),
            path.display()
        );
        Ok(entries)
    }

    async fn save(&self, entries: &[PendingDelivery]) -> Result<(), StorageError> {
        let body = serde_json::to_vec(entries)?;
        let len = u32::try_from(body.len())
            .map_err(|_| StorageError::Invalid(format!("snapshot too large: {}", body.len())))?;

        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            len,
            crc32: SnapshotHeader::compute_crc(&body),
        };
        let mut buf = BytesMut::with_capacity(SnapshotHeader::SIZE + body.len());
        header.encode(&mut buf);
        buf.put_slice(&body);

        let path = self.snapshot_path();
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            if self.config.fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;

        debug!(
            "Pending snapshot written entries={} bytes={}",
            entries.len(),
            buf.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_identity::Fingerprint;
    use mesh_wire::MessageId;
    use tempfile::TempDir;

    fn entry(id: u64) -> PendingDelivery {
        PendingDelivery {
            id,
            recipient: Fingerprint::from_static_key(b"carol"),
            plaintext: Bytes::from(format!("message {}", id)),
            message_id: MessageId(1000 + id),
            queued_at: 1_700_000_000_000 + id,
            attempts: 1,
        }
    }

    async fn store(dir: &TempDir) -> FilePendingStore {
        FilePendingStore::new(FileStoreConfig {
            data_dir: dir.path().to_path_buf(),
            fsync: false,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        store(&dir).await.save(&[entry(1), entry(2)]).await.unwrap();

        let loaded = store(&dir).await.load().await.unwrap();
        assert_eq!(loaded, vec![entry(1), entry(2)]);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).await.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir).await;
        s.save(&[entry(1)]).await.unwrap();

        let path = dir.path().join(SNAPSHOT_FILE);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 2;
        raw[last] ^= 0x20;
        fs::write(&path, &raw).unwrap();

        assert!(matches!(s.load().await, Err(StorageError::Corruption(_))));

        fs::write(&path, b"RM").unwrap();
        assert!(matches!(s.load().await, Err(StorageError::Corruption(_))));
    }
}
