//! Size-bounded garbage collection via rebase.
//!
//! A [`Gc`] wraps a branch handle with a high/low watermark policy:
//!
//! - Track the total persisted user-value size from per-key metadata.
//! - While total <= high water: no-op.
//! - Above high water: drop the coldest keys (oldest touch, then largest)
//!   until the total is back under low water (default 80% of high).
//! - Protected keys are always retained.
//! - Write a fresh root commit holding only the retained keys, CAS the
//!   branch ref onto it, then clean the now-unreachable history.
//!
//! Every successful `advance` re-runs the watermark check.

use crate::branch::{AdvanceOptions, Branch};
use crate::commit::{unix_now, Commit};
use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::layout;
use crate::merge::MergeResult;
use crate::store::MetaEntry;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info};

/// Default staleness window for [`Gc::clean_orphans`].
///
/// An in-flight advance may have written its commit but not yet CAS'd the
/// ref; the window keeps cleanup from racing it. Multi-process stores
/// should not go below this.
pub const DEFAULT_MIN_AGE_SECS: f64 = 3600.0;

/// The default protection policy: the final `/`-segment of the key starts
/// with `__`. Covers both plain keys (`__config`) and keys under a
/// namespace prefix (`ns/__config`).
pub fn is_system_key(key: &str) -> bool {
    let base = key.rsplit('/').next().unwrap_or(key);
    base.starts_with("__")
}

/// Outcome of a rebase run.
#[derive(Debug, Clone, Serialize)]
pub struct RebaseResult {
    /// Whether a fresh root was written.
    pub performed: bool,
    /// The fresh root commit, when performed.
    pub new_commit: Option<Digest>,
    /// Keys dropped, coldest first.
    pub dropped_keys: Vec<String>,
    /// Keys retained in the fresh root.
    pub kept_keys: Vec<String>,
    /// Total tracked size before the rebase.
    pub total_size_before: u64,
    /// Total tracked size after the rebase.
    pub total_size_after: u64,
    /// Commits removed by the orphan cleanup that follows a rebase.
    pub orphans_cleaned: usize,
}

impl RebaseResult {
    fn skipped(total: u64, kept_keys: Vec<String>) -> Self {
        RebaseResult {
            performed: false,
            new_commit: None,
            dropped_keys: Vec::new(),
            kept_keys,
            total_size_before: total,
            total_size_after: total,
            orphans_cleaned: 0,
        }
    }
}

/// A branch handle with automatic size-bounded garbage collection.
///
/// Dereferences to the wrapped [`Branch`] for everything except `advance`,
/// which additionally runs the watermark check after each successful
/// commit.
pub struct Gc {
    branch: Branch,
    high_water: u64,
    low_water: u64,
    is_protected: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    last_rebase: Option<RebaseResult>,
}

impl Gc {
    /// Wrap a branch with a high-water threshold in bytes. The low water
    /// mark defaults to 80% of it.
    pub fn new(branch: Branch, high_water_bytes: u64) -> Result<Self> {
        if high_water_bytes == 0 {
            return Err(Error::invalid_argument("high_water_bytes must be > 0"));
        }
        Ok(Gc {
            branch,
            high_water: high_water_bytes,
            low_water: high_water_bytes * 8 / 10,
            is_protected: Arc::new(is_system_key),
            last_rebase: None,
        })
    }

    /// Override the low water mark. Values of zero or above the high water
    /// mark fall back to the 80% default.
    pub fn with_low_water(mut self, low_water_bytes: u64) -> Self {
        self.low_water = if low_water_bytes == 0 || low_water_bytes > self.high_water {
            self.high_water * 8 / 10
        } else {
            low_water_bytes
        };
        self
    }

    /// Override the protection predicate (default: [`is_system_key`]).
    pub fn with_protected<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.is_protected = Arc::new(f);
        self
    }

    /// The high water mark in bytes.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// The low water mark in bytes.
    pub fn low_water(&self) -> u64 {
        self.low_water
    }

    /// The outcome of the watermark check after the last successful
    /// advance.
    pub fn last_rebase(&self) -> Option<&RebaseResult> {
        self.last_rebase.as_ref()
    }

    /// Commit changes with default options, then run the watermark check.
    pub fn advance(
        &mut self,
        updates: &BTreeMap<String, Vec<u8>>,
        removals: &BTreeSet<String>,
    ) -> Result<MergeResult> {
        self.advance_with(updates, removals, AdvanceOptions::default())
    }

    /// Commit changes, then run the watermark check.
    pub fn advance_with(
        &mut self,
        updates: &BTreeMap<String, Vec<u8>>,
        removals: &BTreeSet<String>,
        opts: AdvanceOptions,
    ) -> Result<MergeResult> {
        let result = self.branch.advance_with(updates, removals, opts)?;
        if result.merged {
            let outcome = self.maybe_rebase()?;
            self.last_rebase = Some(outcome);
        }
        Ok(result)
    }

    /// Rebase only when the tracked total exceeds the high water mark.
    pub fn maybe_rebase(&mut self) -> Result<RebaseResult> {
        let current = self.branch.current_commit();
        let total = self.branch.store().total_size(&current)?;
        if total <= self.high_water {
            return Ok(RebaseResult::skipped(total, self.branch.keys()?));
        }
        info!(
            total,
            high_water = self.high_water,
            "total size above high water, rebasing"
        );
        self.rebase(None)
    }

    /// Rewrite the branch as a fresh root commit.
    ///
    /// With `keep_keys`, exactly those keys (plus protected ones) survive.
    /// Without, keys are dropped coldest-then-largest until the total is
    /// under the low water mark. The ref is CAS'd from the HEAD observed at
    /// the start; another writer moving it in between is a `Concurrency`
    /// error and the caller retries.
    pub fn rebase(&mut self, keep_keys: Option<&BTreeSet<String>>) -> Result<RebaseResult> {
        let store = self.branch.store().clone();
        let head = store
            .read_ref(self.branch.name())?
            .ok_or_else(|| Error::not_found(format!("branch {:?}", self.branch.name())))?;
        let commit = store.get_commit(&head)?;

        let mut metas: BTreeMap<String, MetaEntry> = BTreeMap::new();
        for key in commit.entries.keys() {
            let meta = store.load_meta(key)?.unwrap_or(MetaEntry {
                last_touch: 0,
                size: 0,
                created_at: unix_now(),
            });
            metas.insert(key.clone(), meta);
        }
        let total_before: u64 = metas.values().map(|m| m.size).sum();

        let mut kept = commit.entries.clone();
        let mut dropped: Vec<String> = Vec::new();
        let mut total = total_before;

        match keep_keys {
            Some(keep) => {
                for key in commit.entries.keys() {
                    if (self.is_protected)(key) || keep.contains(key) {
                        continue;
                    }
                    kept.remove(key);
                    dropped.push(key.clone());
                }
            }
            None => {
                let mut candidates: Vec<(&String, &MetaEntry)> = metas
                    .iter()
                    .filter(|(key, _)| !(self.is_protected)(key))
                    .collect();
                // Coldest first; largest first among equally cold keys
                candidates.sort_by(|a, b| {
                    a.1.last_touch
                        .cmp(&b.1.last_touch)
                        .then(b.1.size.cmp(&a.1.size))
                        .then(a.0.cmp(b.0))
                });
                for (key, meta) in candidates {
                    if total <= self.low_water {
                        break;
                    }
                    kept.remove(key.as_str());
                    total -= meta.size;
                    dropped.push(key.clone());
                }
            }
        }

        let reason = if keep_keys.is_some() {
            "explicit"
        } else {
            "high_water"
        };
        let total_after: u64 = kept.keys().map(|key| metas[key].size).sum();
        let rebase_info = BTreeMap::from([
            ("reason".to_string(), reason.to_string()),
            ("total_size_before".to_string(), total_before.to_string()),
            ("total_size_after".to_string(), total_after.to_string()),
            ("dropped".to_string(), dropped.len().to_string()),
        ]);

        let kept_keys: Vec<String> = kept.keys().cloned().collect();
        let new_root = store.write_root(kept, Some(rebase_info))?;

        if !store.cas_ref(self.branch.name(), &new_root, Some(&head))? {
            return Err(Error::concurrency(format!(
                "HEAD of {:?} changed during rebase",
                self.branch.name()
            )));
        }
        self.branch.set_position(new_root);

        // The old history just became unreachable by our own CAS; anything
        // still pointing at it lost its race.
        let orphans_cleaned = self.clean_orphans(0.0)?;

        info!(
            branch = self.branch.name(),
            commit = %new_root.short(),
            dropped = dropped.len(),
            orphans_cleaned,
            "rebase complete"
        );
        Ok(RebaseResult {
            performed: true,
            new_commit: Some(new_root),
            dropped_keys: dropped,
            kept_keys,
            total_size_before: total_before,
            total_size_after: total_after,
            orphans_cleaned,
        })
    }

    /// Remove commits unreachable from every branch ref and older than
    /// `min_age_seconds`, along with blobs and metadata that no surviving
    /// commit references. Returns the number of commits removed.
    pub fn clean_orphans(&self, min_age_seconds: f64) -> Result<usize> {
        let store = self.branch.store();
        let reachable = store.reachable_commits()?;
        let cutoff = unix_now() - min_age_seconds;

        // Load every commit object in the store. Undecodable ones are left
        // alone; they pin nothing.
        let mut commits: HashMap<Digest, Commit> = HashMap::new();
        for backend_key in store.backend().keys()? {
            let hex = match layout::id_of_commit_key(&backend_key) {
                Some(hex) => hex,
                None => continue,
            };
            let id = match Digest::from_hex(hex) {
                Ok(id) => id,
                Err(_) => continue,
            };
            if let Ok(commit) = store.get_commit(&id) {
                commits.insert(id, commit);
            }
        }

        let mut doomed: Vec<Digest> = Vec::new();
        for (id, commit) in &commits {
            if !reachable.contains(id) && commit.created_at < cutoff {
                doomed.push(*id);
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let doomed_set: HashSet<Digest> = doomed.iter().copied().collect();

        // Pointers and keys that survive in any remaining commit
        let mut live_pointers: HashSet<Digest> = HashSet::new();
        let mut live_keys: HashSet<&str> = HashSet::new();
        for (id, commit) in &commits {
            if doomed_set.contains(id) {
                continue;
            }
            for (key, pointer) in &commit.entries {
                live_pointers.insert(*pointer);
                live_keys.insert(key.as_str());
            }
        }

        let mut removals: Vec<String> = Vec::new();
        for id in &doomed {
            removals.push(layout::commit_key(id));
            for (key, pointer) in &commits[id].entries {
                if !live_pointers.contains(pointer) {
                    removals.push(layout::data_key(pointer));
                }
                if !live_keys.contains(key.as_str()) {
                    removals.push(layout::meta_key(key));
                }
            }
        }
        removals.sort();
        removals.dedup();
        store.backend().remove_many(&removals)?;

        debug!(commits = doomed.len(), "orphan commits cleaned");
        Ok(doomed.len())
    }
}

impl Deref for Gc {
    type Target = Branch;

    fn deref(&self) -> &Branch {
        &self.branch
    }
}

impl DerefMut for Gc {
    fn deref_mut(&mut self) -> &mut Branch {
        &mut self.branch
    }
}
