//! Chunk Identity
//!
//! A [`ChunkId`] names one fixed-size slice of one remote file. Its
//! [`ChunkKey`] is a SHA-256 digest of the identity and is the only thing the
//! persistent tier ever uses to address storage, so remote file names never
//! reach the local filesystem.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// Length of a chunk digest in bytes
pub const KEY_LEN: usize = 32;

/// Hex characters used for the first directory level
const PREFIX1_LEN: usize = 2;

/// Hex characters used for the second directory level
const PREFIX2_LEN: usize = 2;

/// Identity of one chunk: remote-relative file path plus zero-based index
///
/// The path is expected to be traversal-checked by the metadata layer already;
/// the cache never interprets it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    file_path: String,
    chunk_index: u64,
}

impl ChunkId {
    /// Create a new chunk identity
    pub fn new(file_path: impl Into<String>, chunk_index: u64) -> Self {
        Self {
            file_path: file_path.into(),
            chunk_index,
        }
    }

    /// Remote-relative path of the file
    #[inline]
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Zero-based chunk index within the file
    #[inline]
    pub fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    /// Derive the storage digest
    ///
    /// SHA-256 over the path bytes followed by the index as 8 little-endian
    /// bytes. The fixed-width suffix keeps the encoding unambiguous.
    pub fn key(&self) -> ChunkKey {
        let mut hasher = Sha256::new();
        hasher.update(self.file_path.as_bytes());
        hasher.update(self.chunk_index.to_le_bytes());
        ChunkKey(hasher.finalize().into())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_path, self.chunk_index)
    }
}

/// Digest of a [`ChunkId`], used as the persistent tier's index key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey([u8; KEY_LEN]);

impl ChunkKey {
    /// Raw digest bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex digest
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Recover a key from the three path segments of the on-disk layout
    pub fn from_segments(prefix1: &str, prefix2: &str, rest: &str) -> Option<Self> {
        if prefix1.len() != PREFIX1_LEN || prefix2.len() != PREFIX2_LEN {
            return None;
        }
        Self::from_hex(&format!("{}{}{}", prefix1, prefix2, rest))
    }

    /// Location relative to the cache root: `hash[0:2]/hash[2:4]/hash[4:]`
    pub fn relative_path(&self) -> PathBuf {
        let hex = self.to_hex();
        let (prefix1, tail) = hex.split_at(PREFIX1_LEN);
        let (prefix2, rest) = tail.split_at(PREFIX2_LEN);
        [prefix1, prefix2, rest].iter().collect()
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({})", self.to_hex())
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<&ChunkId> for ChunkKey {
    fn from(id: &ChunkId) -> Self {
        id.key()
    }
}

// =============================================================================
// Tests
// =============================================================================
