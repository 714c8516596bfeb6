//! Configuration handling for the mesh node.
//!
//! Values come from a YAML file, then `MESH_*` environment variables, then
//! command-line flags (applied in `main`).

use anyhow::{Context, Result};
use mesh_coordinator::CoordinatorConfig;
use mesh_identity::Fingerprint;
use mesh_storage::StorageMode;
use mesh_wire::PeerId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Nickname carried in announcements
    pub nickname: String,
    /// Where the static identity key is kept
    pub key_file: PathBuf,
    /// Fixed routing identifier (hex); random per start when unset
    pub peer_id: Option<String>,
    /// Radio link settings
    pub radio: RadioConfig,
    /// Store-and-forward persistence
    pub storage: StorageConfig,
    /// Seconds between broadcast announcements
    pub announce_interval: u64,
    /// Seconds before a silent announced peer counts as unreachable
    pub peer_timeout: u64,
    /// Largest frame handed to the radio
    pub max_frame_size: usize,
    /// Fingerprints (hex) eligible for store-and-forward
    pub favorites: Vec<String>,
    /// Fingerprints (hex) whose traffic is refused
    pub blocked: Vec<String>,
}

/// UDP radio simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Local socket address
    pub bind: SocketAddr,
    /// Neighbor addresses greeted on start
    pub neighbors: Vec<SocketAddr>,
    /// Seconds between hello frames
    pub hello_interval: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `file`
    pub mode: String,
    /// Directory for the file backend
    pub data_dir: String,
    /// Whether snapshots are fsynced
    pub fsync: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 7400)),
            neighbors: Vec::new(),
            hello_interval: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            data_dir: "./meshdata".to_string(),
            fsync: true,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            key_file: PathBuf::from("./meshdata/identity.key"),
            peer_id: None,
            radio: RadioConfig::default(),
            storage: StorageConfig::default(),
            announce_interval: 30,
            peer_timeout: 120,
            max_frame_size: 512,
            favorites: Vec::new(),
            blocked: Vec::new(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_yaml::from_str::<Self>(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final mesh configuration: nickname={}, bind={}, neighbors={}, storage={}",
            config.nickname,
            config.radio.bind,
            config.radio.neighbors.len(),
            config.storage.mode
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides; `lookup` abstracts the environment
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(nickname) = lookup("MESH_NICKNAME") {
            self.nickname = nickname;
            info!("Nickname overridden by environment: {}", self.nickname);
        }

        if let Some(key_file) = lookup("MESH_KEY_FILE") {
            self.key_file = PathBuf::from(key_file);
            info!("Key file overridden by environment: {:?}", self.key_file);
        }

        if let Some(bind) = lookup("MESH_BIND") {
            match bind.parse() {
                Ok(addr) => {
                    self.radio.bind = addr;
                    info!("Bind address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid MESH_BIND value: {}", bind),
            }
        }

        if let Some(neighbors) = lookup("MESH_NEIGHBORS") {
            let parsed: Result<Vec<SocketAddr>, _> = neighbors
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SocketAddr::from_str)
                .collect();
            match parsed {
                Ok(addrs) => {
                    info!("Neighbors overridden by environment: {:?}", addrs);
                    self.radio.neighbors = addrs;
                }
                Err(_) => warn!("Ignoring invalid MESH_NEIGHBORS value: {}", neighbors),
            }
        }

        if let Some(mode) = lookup("MESH_STORAGE_MODE") {
            self.storage.mode = mode;
            info!("Storage mode overridden by environment: {}", self.storage.mode);
        }

        if let Some(data_dir) = lookup("MESH_DATA_DIR") {
            self.storage.data_dir = data_dir;
            info!("Data directory overridden by environment: {}", self.storage.data_dir);
        }

        if let Some(interval) = lookup("MESH_ANNOUNCE_INTERVAL") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.announce_interval = secs;
                info!("Announce interval overridden by environment: {}s", secs);
            }
        }
    }

    /// Storage backend selection
    pub fn storage_mode(&self) -> Result<StorageMode> {
        match self.storage.mode.as_str() {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                data_dir: self.storage.data_dir.clone(),
                fsync: self.storage.fsync,
            }),
            other => anyhow::bail!("Invalid storage mode: {}. Use 'memory' or 'file'", other),
        }
    }

    /// Configured routing identifier, if any
    pub fn peer_id(&self) -> Result<Option<PeerId>> {
        self.peer_id
            .as_deref()
            .map(|hex| PeerId::from_hex(hex).with_context(|| format!("Invalid peer_id {}", hex)))
            .transpose()
    }

    /// Parse the favorites and blocked lists
    pub fn trust_lists(&self) -> Result<(Vec<Fingerprint>, Vec<Fingerprint>)> {
        let parse = |list: &[String]| -> Result<Vec<Fingerprint>> {
            list.iter()
                .map(|hex| {
                    Fingerprint::from_str(hex)
                        .with_context(|| format!("Invalid fingerprint {}", hex))
                })
                .collect()
        };
        Ok((parse(&self.favorites)?, parse(&self.blocked)?))
    }

    /// Coordinator settings derived from this configuration
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let mut config = CoordinatorConfig {
            peer_id: self.peer_id()?,
            nickname: self.nickname.clone(),
            announce_interval: Duration::from_secs(self.announce_interval.max(1)),
            peer_timeout: Duration::from_secs(self.peer_timeout.max(1)),
            ..CoordinatorConfig::default()
        };
        config.router.max_frame_size = self.max_frame_size;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.nickname, "anon");
        assert_eq!(config.radio.bind.port(), 7400);
        assert_eq!(config.max_frame_size, 512);
        assert!(matches!(config.storage_mode().unwrap(), StorageMode::InMemory));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
nickname: alice
peer_id: "4141414141414141"
radio:
  bind: 127.0.0.1:7401
  neighbors:
    - 127.0.0.1:7402
storage:
  mode: file
  data_dir: /tmp/mesh-test
announce_interval: 10
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.nickname, "alice");
        assert_eq!(config.radio.bind, "127.0.0.1:7401".parse().unwrap());
        assert_eq!(config.radio.neighbors.len(), 1);
        assert_eq!(config.radio.hello_interval, 5);
        assert!(matches!(
            config.storage_mode().unwrap(),
            StorageMode::File { fsync: true, .. }
        ));

        let coordinator = config.coordinator_config().unwrap();
        assert_eq!(coordinator.peer_id, Some(PeerId::from_bytes(*b"AAAAAAAA")));
        assert_eq!(coordinator.announce_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"radio: [not, a, map]").unwrap();
        assert!(MeshConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_NICKNAME", "bob"),
            ("MESH_NEIGHBORS", "127.0.0.1:7001, 127.0.0.1:7002"),
            ("MESH_BIND", "not an address"),
            ("MESH_ANNOUNCE_INTERVAL", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.nickname, "bob");
        assert_eq!(config.radio.neighbors.len(), 2);
        assert_eq!(config.radio.bind.port(), 7400);
        assert_eq!(config.announce_interval, 5);
    }

    #[test]
    fn test_trust_lists_and_bad_values() {
        let mut config = MeshConfig {
            favorites: vec!["ab".repeat(32)],
            ..MeshConfig::default()
        };
        let (favorites, blocked) = config.trust_lists().unwrap();
        assert_eq!(favorites, vec![Fingerprint([0xab; 32])]);
        assert!(blocked.is_empty());

        config.blocked = vec!["zz".to_string()];
        assert!(config.trust_lists().is_err());

        config.storage.mode = "tape".to_string();
        assert!(config.storage_mode().is_err());
    }
}
