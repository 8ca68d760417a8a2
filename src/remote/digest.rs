//! Content digests: SHA-256 of a blob plus its length.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Identity of a blob in a content-addressed store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    hash: [u8; 32],
    size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestParseError {
    #[error("expected `<hex>/<size>`")]
    MissingSize,
    #[error("invalid hex hash")]
    InvalidHex,
    #[error("invalid size: {0}")]
    InvalidSize(String),
}

impl Digest {
    /// Digest of `data`.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            hash: Sha256::digest(data).into(),
            size_bytes: data.len() as u64,
        }
    }

    #[must_use]
    pub const fn from_parts(hash: [u8; 32], size_bytes: u64) -> Self {
        Self { hash, size_bytes }
    }

    pub fn from_hex(hash: &str, size_bytes: u64) -> Result<Self, DigestParseError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hash, &mut bytes).map_err(|_| DigestParseError::InvalidHex)?;
        Ok(Self::from_parts(bytes, size_bytes))
    }

    #[must_use]
    pub const fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Check that `data` is the blob this digest names.
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash_hex(), self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, size) = s.split_once('/').ok_or(DigestParseError::MissingSize)?;
        let size = size
            .parse()
            .map_err(|_| DigestParseError::InvalidSize(size.to_string()))?;
        Self::from_hex(hash, size)
    }
}
