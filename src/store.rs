//! The commit engine: commit, blob, metadata, and ref I/O over a backend.

use crate::backend::Backend;
use crate::commit::{unix_now, Commit, CommitInfo};
use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::layout;
use crate::merge::DiffResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-key bookkeeping used by the garbage collector.
///
/// Not versioned: one record per live user key, updated on every read and
/// write. The touch counter is monotonic within a process and approximate
/// across processes; GC ordering is heuristic and tolerates lost races.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Monotonically increasing touch counter.
    pub last_touch: u64,
    /// Serialized size of the value in bytes.
    pub size: u64,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: f64,
}

/// Commit-level access to a byte backend.
///
/// Cheap to clone; clones share the backend and the touch counter, so every
/// handle in a process observes a single monotonic touch order.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    next_touch: Arc<AtomicU64>,
}

impl Store {
    /// Create a store over a backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Store {
            backend,
            next_touch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // -- Blobs --

    /// Store value bytes under their content address.
    ///
    /// Identical bytes share one blob; rewriting an existing blob is skipped.
    pub fn put_blob(&self, bytes: &[u8]) -> Result<Digest> {
        let pointer = Digest::compute(bytes);
        let key = layout::data_key(&pointer);
        if !self.backend.contains(&key)? {
            self.backend.set(&key, bytes)?;
        }
        Ok(pointer)
    }

    /// Fetch a blob, verifying its bytes still hash to the pointer.
    pub fn get_blob(&self, pointer: &Digest) -> Result<Option<Vec<u8>>> {
        let bytes = match self.backend.get(&layout::data_key(pointer))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let actual = Digest::compute(&bytes);
        if actual != *pointer {
            return Err(Error::corrupt(format!(
                "blob {} content hashes to {}",
                pointer.short(),
                actual.short()
            )));
        }
        Ok(Some(bytes))
    }

    // -- Commits --

    /// Persist a commit under its content id.
    ///
    /// An existing commit with the same id is reused as-is: identical
    /// content always maps to identical bytes.
    pub fn put_commit(&self, commit: &Commit) -> Result<Digest> {
        let bytes = commit.canonical_bytes()?;
        let id = Digest::compute(&bytes);
        let key = layout::commit_key(&id);
        if !self.backend.contains(&key)? {
            self.backend.set(&key, &bytes)?;
        }
        Ok(id)
    }

    /// Load a commit by id. `NotFound` when absent, `Corrupt` when the
    /// stored bytes no longer match the id.
    pub fn get_commit(&self, id: &Digest) -> Result<Commit> {
        let bytes = self
            .backend
            .get(&layout::commit_key(id))?
            .ok_or_else(|| Error::not_found(format!("commit {}", id.short())))?;
        Commit::decode(id, &bytes)
    }

    /// Whether a commit exists.
    pub fn contains_commit(&self, id: &Digest) -> Result<bool> {
        self.backend.contains(&layout::commit_key(id))
    }

    // -- Reads --

    /// Read one key at a commit. Touches the key's metadata.
    pub fn read(&self, commit_id: &Digest, key: &str) -> Result<Option<Vec<u8>>> {
        let commit = self.get_commit(commit_id)?;
        let pointer = match commit.entries.get(key) {
            Some(pointer) => *pointer,
            None => return Ok(None),
        };
        let bytes = self.get_blob(&pointer)?.ok_or_else(|| {
            Error::corrupt(format!(
                "commit {} entry {:?} points at missing blob {}",
                commit_id.short(),
                key,
                pointer.short()
            ))
        })?;
        self.touch(key, bytes.len() as u64)?;
        Ok(Some(bytes))
    }

    /// Read a set of keys at a commit, returning only present entries.
    pub fn read_many(
        &self,
        commit_id: &Digest,
        keys: &[&str],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let commit = self.get_commit(commit_id)?;

        let mut wanted: Vec<(&str, Digest)> = Vec::new();
        for key in keys {
            if let Some(pointer) = commit.entries.get(*key) {
                wanted.push((key, *pointer));
            }
        }

        let data_keys: Vec<String> = wanted
            .iter()
            .map(|(_, pointer)| layout::data_key(pointer))
            .collect();
        let data_key_refs: Vec<&str> = data_keys.iter().map(String::as_str).collect();
        let fetched = self.backend.get_many(&data_key_refs)?;

        let mut result = BTreeMap::new();
        for (key, pointer) in wanted {
            if let Some(bytes) = fetched.get(&layout::data_key(&pointer)) {
                self.touch(key, bytes.len() as u64)?;
                result.insert(key.to_string(), bytes.clone());
            }
        }
        Ok(result)
    }

    /// The keys present in a commit.
    pub fn keys(&self, commit_id: &Digest) -> Result<Vec<String>> {
        let commit = self.get_commit(commit_id)?;
        Ok(commit.entries.keys().cloned().collect())
    }

    // -- Writes --

    /// Create a commit on top of `parent`: blobs first, then the commit
    /// object. Never touches refs.
    pub fn write(
        &self,
        parent: &Digest,
        updates: &BTreeMap<String, Vec<u8>>,
        removals: &BTreeSet<String>,
        info: Option<CommitInfo>,
    ) -> Result<Digest> {
        for key in updates.keys() {
            layout::validate_user_key(key)?;
        }

        let parent_commit = self.get_commit(parent)?;
        let mut entries = parent_commit.entries;
        for key in removals {
            entries.remove(key);
        }
        for (key, value) in updates {
            let pointer = self.put_blob(value)?;
            entries.insert(key.clone(), pointer);
            self.record_write(key, value.len() as u64)?;
        }

        let commit = Commit::new(vec![*parent], entries, info);
        let id = self.put_commit(&commit)?;
        debug!(
            commit = %id.short(),
            parent = %parent.short(),
            updates = updates.len(),
            removals = removals.len(),
            "commit written"
        );
        Ok(id)
    }

    /// Create a parentless commit from existing pointers (store open,
    /// rebase).
    pub fn write_root(
        &self,
        entries: BTreeMap<String, Digest>,
        info: Option<CommitInfo>,
    ) -> Result<Digest> {
        let commit = Commit::new(Vec::new(), entries, info);
        let id = self.put_commit(&commit)?;
        debug!(commit = %id.short(), "root commit written");
        Ok(id)
    }

    // -- Diff --

    /// Key-level differences going from commit `a` to commit `b`.
    ///
    /// Compared by pointer equality only; the same pointer implies the same
    /// bytes, so no blobs are read.
    pub fn diff(&self, a: &Digest, b: &Digest) -> Result<DiffResult> {
        let entries_a = self.get_commit(a)?.entries;
        let entries_b = self.get_commit(b)?.entries;

        let mut result = DiffResult::default();
        for (key, pointer) in &entries_b {
            match entries_a.get(key) {
                None => {
                    result.added.insert(key.clone());
                }
                Some(old) if old != pointer => {
                    result.modified.insert(key.clone());
                }
                Some(_) => {}
            }
        }
        for key in entries_a.keys() {
            if !entries_b.contains_key(key) {
                result.removed.insert(key.clone());
            }
        }
        Ok(result)
    }

    // -- Per-key metadata --

    /// Load the metadata record for a user key. Undecodable records read as
    /// absent: metadata is best-effort bookkeeping.
    pub fn load_meta(&self, key: &str) -> Result<Option<MetaEntry>> {
        let bytes = match self.backend.get(&layout::meta_key(key))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    fn save_meta(&self, key: &str, entry: &MetaEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)
            .map_err(|e| Error::storage(format!("meta serialization failed: {}", e)))?;
        self.backend.set(&layout::meta_key(key), &bytes)
    }

    /// Bump the touch counter and refresh the size for a key that was read.
    fn touch(&self, key: &str, size: u64) -> Result<()> {
        let existing = self.load_meta(key)?;
        let entry = MetaEntry {
            last_touch: self.bump_touch(existing.map_or(0, |e| e.last_touch)),
            size,
            created_at: existing.map_or_else(unix_now, |e| e.created_at),
        };
        trace!(key, touch = entry.last_touch, "key touched");
        self.save_meta(key, &entry)
    }

    /// Bump the touch counter and record the new size for a written key.
    pub(crate) fn record_write(&self, key: &str, size: u64) -> Result<()> {
        self.touch(key, size)
    }

    fn bump_touch(&self, stored: u64) -> u64 {
        self.next_touch.fetch_max(stored, Ordering::Relaxed);
        self.next_touch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sum of metadata sizes over the keys present in a commit. Keys with
    /// no record count as zero.
    pub fn total_size(&self, commit_id: &Digest) -> Result<u64> {
        let commit = self.get_commit(commit_id)?;
        let mut total = 0u64;
        for key in commit.entries.keys() {
            total += self.load_meta(key)?.map_or(0, |e| e.size);
        }
        Ok(total)
    }

    // -- Refs --

    /// The commit id a branch ref points at, when the ref exists.
    pub fn read_ref(&self, branch: &str) -> Result<Option<Digest>> {
        let bytes = match self.backend.get(&layout::ref_key(branch))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| Error::corrupt(format!("ref {:?} is not utf-8", branch)))?;
        Digest::from_hex(text)
            .map_err(|_| Error::corrupt(format!("ref {:?} holds {:?}, not a commit id", branch, text)))
            .map(Some)
    }

    /// CAS a branch ref. `expected = None` creates the ref only if absent.
    pub fn cas_ref(&self, branch: &str, new: &Digest, expected: Option<&Digest>) -> Result<bool> {
        let new_bytes = new.to_hex().into_bytes();
        let expected_bytes = expected.map(|id| id.to_hex().into_bytes());
        self.backend.cas(
            &layout::ref_key(branch),
            &new_bytes,
            expected_bytes.as_deref(),
        )
    }

    /// Delete a branch ref.
    pub fn delete_ref(&self, branch: &str) -> Result<()> {
        self.backend.remove(&layout::ref_key(branch))
    }

    /// All branch names, sorted.
    pub fn branches(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .backend
            .keys()?
            .iter()
            .filter_map(|k| layout::branch_of_ref_key(k))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }
}
