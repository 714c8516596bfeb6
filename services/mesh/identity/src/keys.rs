//! Local long-term static keypair.
//!
//! The key file holds the 32-byte X25519 secret as hex. It is created on
//! first start and reloaded afterwards so the node keeps its fingerprint.

use crate::{Fingerprint, IdentityError};
use rand::rngs::OsRng;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of an X25519 key in bytes
pub const STATIC_KEY_SIZE: usize = 32;

/// The node's long-term Noise static keypair
#[derive(Clone)]
pub struct NodeIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeIdentity {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild from raw secret bytes
    pub fn from_secret_bytes(bytes: [u8; STATIC_KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load the key file at `path`, or generate and persist a new key
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            let identity = Self::parse(&text)?;
            info!(
                path = %path.display(),
                fingerprint = %identity.fingerprint().short(),
                "Loaded node identity"
            );
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(
            path = %path.display(),
            fingerprint = %identity.fingerprint().short(),
            "Generated new node identity"
        );
        Ok(identity)
    }

    fn parse(text: &str) -> Result<Self, IdentityError> {
        let raw = hex::decode(text.trim())
            .map_err(|e| IdentityError::InvalidKey(format!("not hex: {}", e)))?;
        let bytes: [u8; STATIC_KEY_SIZE] = raw.try_into().map_err(|raw: Vec<u8>| {
            IdentityError::InvalidKey(format!("expected {} bytes, got {}", STATIC_KEY_SIZE, raw.len()))
        })?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Write the secret to `path` (owner read/write only on unix)
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, hex::encode(self.secret.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Static public key bytes
    pub fn public_key(&self) -> [u8; STATIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Static secret bytes, for the Noise handshake
    pub fn private_key(&self) -> [u8; STATIC_KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Our own fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_static_key(self.public.as_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = NodeIdentity::load_or_generate(&path).unwrap();
        let second = NodeIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        NodeIdentity::generate().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_invalid_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.key");
        fs::write(&path, "abcd").unwrap();
        assert!(matches!(
            NodeIdentity::load_or_generate(&path),
            Err(IdentityError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_distinct_identities() {
        assert_ne!(
            NodeIdentity::generate().fingerprint(),
            NodeIdentity::generate().fingerprint()
        );
    }
}
