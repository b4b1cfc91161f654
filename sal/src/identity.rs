use anyhow::{Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;

/// A node's signing key and the Sovereign ID derived from it.
pub struct Identity {
    key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex SHA-256 of the public key.
    pub fn sid(&self) -> String {
        hex::encode(Sha256::digest(self.verifying_key().as_bytes()))
    }

    /// Write the secret key as hex. Refuses to overwrite an existing file.
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts
            .open(path)
            .with_context(|| format!("Failed to create key file {}", path.display()))?;
        file.write_all(hex::encode(self.key.to_bytes()).as_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let bytes = hex::decode(data.trim()).context("Key file is not hex")?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("Key file holds {} bytes, expected 32", b.len()))?;
        Ok(Self::from_secret(secret))
    }
}

/// First characters of a SID for display.
pub fn short_sid(sid: &str) -> &str {
    sid.get(..25).unwrap_or(sid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_is_stable_for_a_key() {
        let id = Identity::from_secret([7u8; 32]);
        let sid = id.sid();
        assert_eq!(sid.len(), 64);
        assert_eq!(Identity::from_secret([7u8; 32]).sid(), sid);
        assert_ne!(Identity::from_secret([8u8; 32]).sid(), sid);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bridge.key");
        let id = Identity::generate();
        id.save(&path).unwrap();
        assert_eq!(Identity::load(&path).unwrap().sid(), id.sid());
        // never clobber an existing soul
        assert!(Identity::generate().save(&path).is_err());
    }

    #[test]
    fn test_load_rejects_short_key() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short.key");
        std::fs::write(&path, "abcd").unwrap();
        assert!(Identity::load(&path).is_err());
    }

    #[test]
    fn test_short_sid() {
        assert_eq!(short_sid(&"f".repeat(64)).len(), 25);
        assert_eq!(short_sid("abc"), "abc");
    }
}
