//! Content fingerprinting.
//!
//! A [`ContentHash`] is the SHA-256 digest of a document's hashable text
//! (see [`crate::normalize`]), rendered as 64 lowercase hex characters.
//! Dedup is exact-match on this value; there is no fuzzy matching.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fixed-length hex fingerprint of normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wraps a hash read back from storage. Only the store should call this.
    pub(crate) fn from_stored(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint the UTF-8 bytes of `hashable_text`.
pub fn fingerprint(hashable_text: &str) -> ContentHash {
    let digest = Sha256::digest(hashable_text.as_bytes());
    ContentHash(hex::encode(digest))
}
