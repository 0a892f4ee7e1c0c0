use sha2::{Digest, Sha256};
use std::fmt;

/// Number of SHA-256 bytes kept in a digest.
const DIGEST_BYTES: usize = 16;

/// Stable identity of a classification key.
///
/// Used as the entry store's map key and as the entry id in dumps. The value
/// depends only on the key string, so it is comparable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyDigest(String);

impl KeyDigest {
    /// Hash a classification key: hex of the first 128 bits of its SHA-256.
    pub fn of(key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash[..DIGEST_BYTES]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
