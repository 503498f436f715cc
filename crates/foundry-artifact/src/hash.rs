//! Content hashing for generated file sets
//!
//! Provides [`ContentHash`], a 32-byte Blake3 digest used to tell whether a
//! refinement cycle actually changed anything.

use crate::file::GeneratedFile;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte content hash (Blake3)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute Blake3 hash of arbitrary data
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash a set of files by path and content.
    ///
    /// Order-insensitive: files are sorted by path first. Iteration stamps
    /// and timestamps are excluded so a pure carry-over hashes the same.
    #[must_use]
    pub fn of_files(files: &[GeneratedFile]) -> Self {
        let mut sorted: Vec<&GeneratedFile> = files.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = blake3::Hasher::new();
        for file in sorted {
            hasher.update(file.path.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(file.content.len() as u64).to_le_bytes());
            hasher.update(file.content.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HashError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when parsing content hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Required byte length
        expected: usize,
        /// Decoded byte length
        actual: usize,
    },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
