//! Immutable, content-addressed commit objects.
//!
//! A commit's id is the BLAKE3 digest of its canonical serialization:
//! compact JSON with a fixed field order (`parents`, `entries`, `info`,
//! `created_at`) and entries emitted in sorted key order. Re-serializing a
//! decoded commit reproduces the exact bytes, so ids are reproducible from
//! storage.

use crate::error::{Error, Result};
use crate::hash::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Optional user-supplied metadata attached to a commit.
pub type CommitInfo = BTreeMap<String, String>;

/// An immutable snapshot of the key-value map plus parents and metadata.
///
/// - 0 parents: root commit
/// - 1 parent: normal commit
/// - 2 parents: merge commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Parent commit ids, in order. The first parent is the linear-history
    /// predecessor.
    pub parents: Vec<Digest>,
    /// User key to blob pointer. Pointers are digests of the value bytes.
    pub entries: BTreeMap<String, Digest>,
    /// Optional user metadata, hashed along with the rest of the commit.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info: Option<CommitInfo>,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: f64,
}

impl Commit {
    /// Create a commit stamped with the current time.
    pub fn new(
        parents: Vec<Digest>,
        entries: BTreeMap<String, Digest>,
        info: Option<CommitInfo>,
    ) -> Self {
        Commit {
            parents,
            entries,
            info,
            created_at: unix_now(),
        }
    }

    /// The canonical serialization this commit is addressed by.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::storage(format!("commit serialization failed: {}", e)))
    }

    /// The content id: BLAKE3 of the canonical bytes.
    pub fn id(&self) -> Result<Digest> {
        Ok(Digest::compute(&self.canonical_bytes()?))
    }

    /// Decode a commit stored under `stored_id`, verifying that the bytes
    /// still hash to that id.
    pub fn decode(stored_id: &Digest, bytes: &[u8]) -> Result<Self> {
        let commit: Commit = serde_json::from_slice(bytes).map_err(|e| {
            Error::corrupt(format!(
                "commit {} does not deserialize: {}",
                stored_id.short(),
                e
            ))
        })?;
        let actual = commit.id()?;
        if actual != *stored_id {
            return Err(Error::corrupt(format!(
                "commit id mismatch: stored {}, content hashes to {}",
                stored_id.short(),
                actual.short()
            )));
        }
        Ok(commit)
    }

    /// Whether this is a root commit (no parents).
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Whether this is a merge commit (two parents).
    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }
}

/// Seconds since the Unix epoch as a float.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
