//! Merge results, conflict policies, and three-way key classification.
//!
//! The classification is pure: given the entry maps of both sides and their
//! diffs against the common base, it decides which keys carry over untouched
//! and which are contested. Loading blob bytes and invoking resolvers is the
//! branch engine's job.

use crate::hash::Digest;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Key-level differences between two commits, compared by pointer equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Keys present in `b` but not `a`.
    pub added: BTreeSet<String>,
    /// Keys present in `a` but not `b`.
    pub removed: BTreeSet<String>,
    /// Keys present in both with different pointers.
    pub modified: BTreeSet<String>,
}

impl DiffResult {
    /// Every key touched going from `a` to `b`.
    pub fn changed(&self) -> BTreeSet<String> {
        let mut all = self.added.clone();
        all.extend(self.removed.iter().cloned());
        all.extend(self.modified.iter().cloned());
        all
    }

    /// Whether the two commits have identical key maps.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// How a commit reached the branch head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Nothing to do: no changes and the handle was already at HEAD.
    NoOp,
    /// HEAD had not moved; the new commit extended it directly.
    FastForward,
    /// HEAD had diverged; a merge commit joined both lines.
    ThreeWay,
}

/// What to do when a merge cannot complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Return the error to the caller.
    #[default]
    Raise,
    /// Return a falsy [`MergeResult`] and leave the ref untouched.
    Abandon,
}

/// Outcome of an `advance` call.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Whether the branch ref was advanced (or was already current).
    pub merged: bool,
    /// The commit now at HEAD, when `merged`.
    pub commit: Option<Digest>,
    /// The path taken.
    pub strategy: MergeStrategy,
    /// Keys whose value was produced by a resolver.
    pub auto_merged_keys: Vec<String>,
    /// Keys taken from one side or carried through without resolution.
    pub carried_keys: Vec<String>,
}

impl MergeResult {
    pub(crate) fn no_op(commit: Digest) -> Self {
        MergeResult {
            merged: true,
            commit: Some(commit),
            strategy: MergeStrategy::NoOp,
            auto_merged_keys: Vec::new(),
            carried_keys: Vec::new(),
        }
    }

    pub(crate) fn fast_forward(commit: Digest, carried_keys: Vec<String>) -> Self {
        MergeResult {
            merged: true,
            commit: Some(commit),
            strategy: MergeStrategy::FastForward,
            auto_merged_keys: Vec::new(),
            carried_keys,
        }
    }

    pub(crate) fn three_way(
        commit: Digest,
        auto_merged_keys: Vec<String>,
        carried_keys: Vec<String>,
    ) -> Self {
        MergeResult {
            merged: true,
            commit: Some(commit),
            strategy: MergeStrategy::ThreeWay,
            auto_merged_keys,
            carried_keys,
        }
    }

    pub(crate) fn abandoned(strategy: MergeStrategy) -> Self {
        MergeResult {
            merged: false,
            commit: None,
            strategy,
            auto_merged_keys: Vec::new(),
            carried_keys: Vec::new(),
        }
    }

    /// Whether the branch ref was advanced.
    pub fn is_merged(&self) -> bool {
        self.merged
    }
}

/// The value a resolver settled on for a contested key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write these bytes for the key.
    Update(Vec<u8>),
    /// Remove the key from the merged commit.
    Remove,
}

/// A per-key merge resolver.
///
/// Receives `(base, ours, theirs)` — each `None` when the key is absent or
/// removed on that side — and returns the merged value or an error, which
/// the engine captures per key.
pub type MergeFn = Arc<
    dyn Fn(Option<&[u8]>, Option<&[u8]>, Option<&[u8]>) -> std::result::Result<Resolution, String>
        + Send
        + Sync,
>;

/// The uncontested part of a three-way merge, plus the contested keys.
#[derive(Debug, Default)]
pub(crate) struct MergePlan {
    /// Keys settled without a resolver, with the pointer each one keeps.
    pub merged: BTreeMap<String, Digest>,
    /// Keys changed on both sides to different outcomes.
    pub contested: BTreeSet<String>,
}

/// Classify every key touched by either side.
///
/// - changed on one side only: that side's outcome wins
/// - changed on both sides to the same pointer: taken once (concordant)
/// - removed on both sides: gone
/// - anything else changed on both sides: contested
/// - untouched keys: carried from HEAD's map (ours as fallback)
pub(crate) fn plan_three_way(
    our_entries: &BTreeMap<String, Digest>,
    their_entries: &BTreeMap<String, Digest>,
    our_diff: &DiffResult,
    their_diff: &DiffResult,
) -> MergePlan {
    let our_changed = our_diff.changed();
    let their_changed = their_diff.changed();

    let mut plan = MergePlan::default();

    let mut all_keys: BTreeSet<&String> = our_entries.keys().collect();
    all_keys.extend(their_entries.keys());

    for key in all_keys {
        if !our_changed.contains(key) && !their_changed.contains(key) {
            let pointer = their_entries.get(key).or_else(|| our_entries.get(key));
            if let Some(pointer) = pointer {
                plan.merged.insert(key.clone(), *pointer);
            }
        }
    }

    // Changed by us alone
    for key in our_changed.difference(&their_changed) {
        if !our_diff.removed.contains(key) {
            plan.merged.insert(key.clone(), our_entries[key]);
        }
    }

    // Changed by them alone
    for key in their_changed.difference(&our_changed) {
        if !their_diff.removed.contains(key) {
            plan.merged.insert(key.clone(), their_entries[key]);
        }
    }

    // Changed by both
    for key in our_changed.intersection(&their_changed) {
        let our_removed = our_diff.removed.contains(key);
        let their_removed = their_diff.removed.contains(key);

        if our_removed && their_removed {
            continue;
        }
        if !our_removed && !their_removed && our_entries.get(key) == their_entries.get(key) {
            plan.merged.insert(key.clone(), their_entries[key]);
            continue;
        }
        plan.contested.insert(key.clone());
    }

    plan
}
