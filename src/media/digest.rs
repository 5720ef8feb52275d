//! Content identity
//!
//! A [`ContentDigest`] is the SHA-256 of the normalized bytes of a payload.
//! It is the only identity the pipeline uses: two uploads that normalize to
//! the same bytes share a digest regardless of filename or origin.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a digest in bytes
pub const DIGEST_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("digest is not valid hex: {0}")]
    Hex(String),
}

/// SHA-256 digest of normalized media bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    /// Hash `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hash);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding (64 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.short())
    }
}

impl FromStr for ContentDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(DigestParseError::Length {
                expected: DIGEST_LEN * 2,
                actual: s.len(),
            });
        }
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|e| DigestParseError::Hex(e.to_string()))?;
        Ok(Self(out))
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = DigestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.to_hex()
    }
}
