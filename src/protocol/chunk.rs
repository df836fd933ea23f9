//! Data carried between the protocol manager and the storage delegate.

use super::constants::{FULL_HASH_LEN, PREFIX_LEN};
use super::ranges::ChunkRange;

/// Chunks already applied for one list, in compact range notation.
///
/// Produced by the storage delegate at the start of each update cycle and
/// echoed back to the server so it only sends the delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListCoverage {
    /// List name, e.g. `goog-phish-shavar`.
    pub list_name: String,
    /// Add chunks held, e.g. `1,4,6,8-20,99`.
    pub adds: String,
    /// Sub chunks held.
    pub subs: String,
}

impl ListCoverage {
    /// Creates coverage for a list with no chunks.
    pub fn empty(list_name: impl Into<String>) -> Self {
        Self {
            list_name: list_name.into(),
            ..Self::default()
        }
    }

    /// Creates coverage with the given add and sub ranges.
    pub fn new(
        list_name: impl Into<String>,
        adds: impl Into<String>,
        subs: impl Into<String>,
    ) -> Self {
        Self {
            list_name: list_name.into(),
            adds: adds.into(),
            subs: subs.into(),
        }
    }
}

/// Whether a chunk (or a delete) concerns add or sub data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    /// Adds entries to the list.
    Add,
    /// Cancels entries previously added by an add chunk.
    Sub,
}

impl ChunkKind {
    /// Wire prefix for inline chunk headers (`a` / `s`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "a",
            Self::Sub => "s",
        }
    }
}

/// A 4-byte hash prefix or host key.
pub type HashPrefix = [u8; PREFIX_LEN];

/// A full-length hash returned by the get-hash endpoint.
pub type FullHashValue = [u8; FULL_HASH_LEN];

/// One decoded entry of a chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Host key the entry is filed under.
    pub host: HashPrefix,
    /// For sub chunks, the add chunk whose entry is cancelled.
    pub add_chunk: Option<u32>,
    /// Prefix or full hash; empty when the host key itself is the prefix.
    pub prefix: Vec<u8>,
}

/// A numbered batch of add or sub entries for one list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk number.
    pub number: u32,
    /// Add or sub.
    pub kind: ChunkKind,
    /// Length of each prefix in `entries` (4 or 32).
    pub hash_len: usize,
    /// Decoded entries, one per prefix.
    pub entries: Vec<ChunkEntry>,
}

/// A request from the server to drop chunks from a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDelete {
    /// List the deletion applies to.
    pub list_name: String,
    /// Whether add or sub chunks are dropped.
    pub kind: ChunkKind,
    /// Chunk numbers to drop.
    pub ranges: Vec<ChunkRange>,
}

/// A full hash match returned by the get-hash endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHash {
    /// List the hash belongs to.
    pub list_name: String,
    /// Add chunk the hash was delivered in.
    pub add_chunk: u32,
    /// The 32-byte hash.
    pub hash: FullHashValue,
}
