//! Branch handles: CAS-serialized HEAD advancement and three-way merge.

use crate::commit::{Commit, CommitInfo};
use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::layout;
use crate::merge::{
    plan_three_way, MergeFn, MergeResult, MergeStrategy, OnConflict, Resolution,
};
use crate::store::Store;
use crate::walk::History;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Per-call knobs for [`Branch::advance_with`].
#[derive(Clone, Default)]
pub struct AdvanceOptions {
    /// Optional metadata for the commit this advance produces.
    pub info: Option<CommitInfo>,
    /// What to do when a merge cannot complete.
    pub on_conflict: OnConflict,
    /// Per-key resolvers for this call only. Take priority over handle-level
    /// registrations.
    pub merge_fns: BTreeMap<String, MergeFn>,
    /// Fallback resolver for this call only.
    pub default_merge: Option<MergeFn>,
}

/// An in-memory cursor onto one branch of the store.
///
/// `base_commit` is the ref value observed at open/refresh time;
/// `current_commit` is the last commit this handle produced. The two are
/// equal except transiently inside an advance. Handles never share mutable
/// state: any number may operate on the same branch concurrently, and CAS
/// on the ref decides who advances first.
pub struct Branch {
    store: Store,
    name: String,
    base_commit: Digest,
    current_commit: Digest,
    merge_fns: BTreeMap<String, MergeFn>,
    default_merge: Option<MergeFn>,
}

impl Branch {
    /// Open a branch, creating it with an empty root commit when the ref
    /// does not exist yet. Losing the creation race falls back to the
    /// winner's ref.
    pub fn open(store: Store, name: &str) -> Result<Branch> {
        layout::validate_branch_name(name)?;
        let head = match store.read_ref(name)? {
            Some(head) => head,
            None => {
                let root = store.write_root(BTreeMap::new(), None)?;
                if store.cas_ref(name, &root, None)? {
                    root
                } else {
                    store.read_ref(name)?.ok_or_else(|| {
                        Error::concurrency(format!("branch {:?} vanished during creation", name))
                    })?
                }
            }
        };
        Ok(Branch {
            store,
            name: name.to_string(),
            base_commit: head,
            current_commit: head,
            merge_fns: BTreeMap::new(),
            default_merge: None,
        })
    }

    /// The branch name this handle is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last commit this handle produced.
    pub fn current_commit(&self) -> Digest {
        self.current_commit
    }

    /// The ref value observed when the handle was opened or last refreshed.
    pub fn base_commit(&self) -> Digest {
        self.base_commit
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Read HEAD directly from the backend (reflects other writers).
    pub fn latest_head(&self) -> Result<Option<Digest>> {
        self.store.read_ref(&self.name)
    }

    // -- Merge resolver registry --

    /// Register a resolver for a specific key.
    pub fn set_resolver<F>(&mut self, key: impl Into<String>, f: F)
    where
        F: Fn(
                Option<&[u8]>,
                Option<&[u8]>,
                Option<&[u8]>,
            ) -> std::result::Result<Resolution, String>
            + Send
            + Sync
            + 'static,
    {
        self.merge_fns.insert(key.into(), Arc::new(f));
    }

    /// Register a fallback resolver for keys with no specific one.
    pub fn set_default_resolver<F>(&mut self, f: F)
    where
        F: Fn(
                Option<&[u8]>,
                Option<&[u8]>,
                Option<&[u8]>,
            ) -> std::result::Result<Resolution, String>
            + Send
            + Sync
            + 'static,
    {
        self.default_merge = Some(Arc::new(f));
    }

    // -- Reads at the current commit --

    /// Read a key at the handle's current commit.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.read(&self.current_commit, key)
    }

    /// Read several keys at the handle's current commit.
    pub fn get_many(&self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        self.store.read_many(&self.current_commit, keys)
    }

    /// The keys present in the handle's current commit.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.store.keys(&self.current_commit)
    }

    /// Whether a key is present in the handle's current commit.
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.store.get_commit(&self.current_commit)?.entries.contains_key(key))
    }

    /// Walk history from the current commit, newest to oldest.
    pub fn history(&self, all_parents: bool) -> History {
        self.store.history(&self.current_commit, all_parents)
    }

    /// The info mapping stored with a commit (default: current).
    pub fn commit_info(&self, commit: Option<&Digest>) -> Result<Option<CommitInfo>> {
        let target = commit.copied().unwrap_or(self.current_commit);
        Ok(self.store.get_commit(&target)?.info)
    }

    /// The parents of a commit (default: current).
    pub fn parents(&self, commit: Option<&Digest>) -> Result<Vec<Digest>> {
        let target = commit.copied().unwrap_or(self.current_commit);
        Ok(self.store.get_commit(&target)?.parents)
    }

    // -- Advancing HEAD --

    /// Commit changes and advance HEAD with default options.
    pub fn advance(
        &mut self,
        updates: &BTreeMap<String, Vec<u8>>,
        removals: &BTreeSet<String>,
    ) -> Result<MergeResult> {
        self.advance_with(updates, removals, AdvanceOptions::default())
    }

    /// Commit changes and advance HEAD.
    ///
    /// Fast-forwards when HEAD has not moved past this handle; otherwise
    /// performs a three-way merge against the live HEAD using the lowest
    /// common ancestor. The successful ref CAS is the linearization point.
    /// After a `Concurrency` failure the handle's position is unchanged, so
    /// the caller may `refresh` and retry without losing anything.
    pub fn advance_with(
        &mut self,
        updates: &BTreeMap<String, Vec<u8>>,
        removals: &BTreeSet<String>,
        opts: AdvanceOptions,
    ) -> Result<MergeResult> {
        let head = self
            .store
            .read_ref(&self.name)?
            .ok_or_else(|| Error::not_found(format!("branch {:?}", self.name)))?;

        let no_changes = updates.is_empty() && removals.is_empty() && opts.info.is_none();
        if no_changes && self.current_commit == head {
            return Ok(MergeResult::no_op(head));
        }

        if self.current_commit == head {
            let new_id = self
                .store
                .write(&self.current_commit, updates, removals, opts.info.clone())?;
            if self.store.cas_ref(&self.name, &new_id, Some(&head))? {
                self.current_commit = new_id;
                self.base_commit = new_id;
                let carried = self.store.keys(&new_id)?;
                debug!(branch = %self.name, commit = %new_id.short(), "fast-forward");
                return Ok(MergeResult::fast_forward(new_id, carried));
            }

            // HEAD moved under us: the staged commit is abandoned and the
            // handle keeps its old position for the merge attempt.
            let head = self
                .store
                .read_ref(&self.name)?
                .ok_or_else(|| Error::not_found(format!("branch {:?}", self.name)))?;
            debug!(branch = %self.name, "fast-forward lost, merging");
            return self.three_way(head, updates, removals, opts);
        }

        self.three_way(head, updates, removals, opts)
    }

    fn three_way(
        &mut self,
        their_head: Digest,
        updates: &BTreeMap<String, Vec<u8>>,
        removals: &BTreeSet<String>,
        opts: AdvanceOptions,
    ) -> Result<MergeResult> {
        // Stage our side. Info belongs to the merge commit, not the staged
        // one. With no local changes the handle's tip already is our side.
        let ours = if updates.is_empty() && removals.is_empty() {
            self.current_commit
        } else {
            self.store.write(&self.current_commit, updates, removals, None)?
        };

        let base = match self.store.lca(&ours, &their_head)? {
            Some(base) => base,
            None => {
                return self.merge_failure(
                    opts.on_conflict,
                    Error::concurrency("no common ancestor between handle and HEAD"),
                )
            }
        };

        let our_diff = self.store.diff(&base, &ours)?;
        let their_diff = self.store.diff(&base, &their_head)?;

        let base_entries = self.store.get_commit(&base)?.entries;
        let our_entries = self.store.get_commit(&ours)?.entries;
        let their_entries = self.store.get_commit(&their_head)?.entries;

        let plan = plan_three_way(&our_entries, &their_entries, &our_diff, &their_diff);

        let mut merged = plan.merged;
        let mut auto_merged: Vec<String> = Vec::new();
        let mut conflicts: BTreeSet<String> = BTreeSet::new();
        let mut merge_errors: BTreeMap<String, String> = BTreeMap::new();

        for key in &plan.contested {
            let resolver = opts
                .merge_fns
                .get(key)
                .or_else(|| self.merge_fns.get(key))
                .or(opts.default_merge.as_ref())
                .or(self.default_merge.as_ref());
            let resolver = match resolver {
                Some(resolver) => Arc::clone(resolver),
                None => {
                    conflicts.insert(key.clone());
                    continue;
                }
            };

            let old = load_side(&self.store, &base_entries, key)?;
            let our_val = if our_diff.removed.contains(key) {
                None
            } else {
                load_side(&self.store, &our_entries, key)?
            };
            let their_val = if their_diff.removed.contains(key) {
                None
            } else {
                load_side(&self.store, &their_entries, key)?
            };

            match resolver(old.as_deref(), our_val.as_deref(), their_val.as_deref()) {
                Ok(Resolution::Update(bytes)) => {
                    let pointer = self.store.put_blob(&bytes)?;
                    self.store.record_write(key, bytes.len() as u64)?;
                    merged.insert(key.clone(), pointer);
                    auto_merged.push(key.clone());
                }
                Ok(Resolution::Remove) => {
                    merged.remove(key);
                    auto_merged.push(key.clone());
                }
                Err(message) => {
                    conflicts.insert(key.clone());
                    merge_errors.insert(key.clone(), message);
                }
            }
        }

        if !conflicts.is_empty() {
            debug!(branch = %self.name, conflicts = conflicts.len(), "unresolved merge");
            return self.merge_failure(
                opts.on_conflict,
                Error::merge_conflict(conflicts, merge_errors),
            );
        }

        let merge_commit = Commit::new(vec![ours, their_head], merged, opts.info.clone());
        let merge_id = self.store.put_commit(&merge_commit)?;

        if self.store.cas_ref(&self.name, &merge_id, Some(&their_head))? {
            self.current_commit = merge_id;
            self.base_commit = merge_id;
            let auto_set: BTreeSet<&String> = auto_merged.iter().collect();
            let carried = merge_commit
                .entries
                .keys()
                .filter(|key| !auto_set.contains(key))
                .cloned()
                .collect();
            debug!(
                branch = %self.name,
                commit = %merge_id.short(),
                auto_merged = auto_merged.len(),
                "three-way merge"
            );
            return Ok(MergeResult::three_way(merge_id, auto_merged, carried));
        }

        // HEAD moved again. The handle's position is untouched.
        debug!(branch = %self.name, "merge CAS lost");
        self.merge_failure(
            opts.on_conflict,
            Error::concurrency(format!("HEAD of {:?} changed during merge", self.name)),
        )
    }

    fn merge_failure(&self, on_conflict: OnConflict, err: Error) -> Result<MergeResult> {
        match on_conflict {
            OnConflict::Abandon => Ok(MergeResult::abandoned(MergeStrategy::ThreeWay)),
            OnConflict::Raise => Err(err),
        }
    }

    // -- Ref operations --

    /// Fork a new branch at a commit (default: this handle's current).
    pub fn create_branch(&self, name: &str, at: Option<&Digest>) -> Result<Branch> {
        layout::validate_branch_name(name)?;
        let target = *at.unwrap_or(&self.current_commit);
        if !self.store.contains_commit(&target)? {
            return Err(Error::not_found(format!("commit {}", target.short())));
        }
        if !self.store.cas_ref(name, &target, None)? {
            return Err(Error::already_exists(format!("branch {:?}", name)));
        }
        Ok(Branch {
            store: self.store.clone(),
            name: name.to_string(),
            base_commit: target,
            current_commit: target,
            merge_fns: BTreeMap::new(),
            default_merge: None,
        })
    }

    /// Rebind this handle to another branch and load its HEAD.
    pub fn switch_branch(&mut self, name: &str) -> Result<()> {
        layout::validate_branch_name(name)?;
        let head = self
            .store
            .read_ref(name)?
            .ok_or_else(|| Error::not_found(format!("branch {:?}", name)))?;
        self.name = name.to_string();
        self.current_commit = head;
        self.base_commit = head;
        Ok(())
    }

    /// Delete a branch ref. Its commits become eligible for orphan cleanup.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        if name == self.name {
            return Err(Error::invalid_argument("cannot delete the current branch"));
        }
        if self.store.read_ref(name)?.is_none() {
            return Err(Error::not_found(format!("branch {:?}", name)));
        }
        self.store.delete_ref(name)
    }

    /// A new handle positioned at `commit` (on `branch`, default: current
    /// branch). `None` when the commit does not exist.
    pub fn checkout(&self, commit: &Digest, branch: Option<&str>) -> Result<Option<Branch>> {
        let name = branch.unwrap_or(&self.name);
        layout::validate_branch_name(name)?;
        if !self.store.contains_commit(commit)? {
            return Ok(None);
        }
        Ok(Some(Branch {
            store: self.store.clone(),
            name: name.to_string(),
            base_commit: *commit,
            current_commit: *commit,
            merge_fns: BTreeMap::new(),
            default_merge: None,
        }))
    }

    /// Force the branch ref to a commit, retrying the CAS until it lands.
    /// Returns `false` when the commit does not exist.
    pub fn reset_to(&mut self, commit: &Digest) -> Result<bool> {
        if !self.store.contains_commit(commit)? {
            return Ok(false);
        }
        loop {
            let observed = self.store.read_ref(&self.name)?;
            if self.store.cas_ref(&self.name, commit, observed.as_ref())? {
                break;
            }
        }
        self.current_commit = *commit;
        self.base_commit = *commit;
        Ok(true)
    }

    /// Read a key at another branch's HEAD without moving this handle.
    /// Does not touch metadata.
    pub fn peek(&self, key: &str, branch: &str) -> Result<Option<Vec<u8>>> {
        let head = match self.store.read_ref(branch)? {
            Some(head) => head,
            None => return Ok(None),
        };
        let commit = match self.store.get_commit(&head) {
            Ok(commit) => commit,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        match commit.entries.get(key) {
            Some(pointer) => self.store.get_blob(pointer),
            None => Ok(None),
        }
    }

    /// All branch names in the store, sorted.
    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.store.branches()
    }

    /// Reload `base_commit` and `current_commit` from the live ref.
    pub fn refresh(&mut self) -> Result<()> {
        let head = self
            .store
            .read_ref(&self.name)?
            .ok_or_else(|| Error::not_found(format!("branch {:?}", self.name)))?;
        self.current_commit = head;
        self.base_commit = head;
        Ok(())
    }

    pub(crate) fn set_position(&mut self, commit: Digest) {
        self.current_commit = commit;
        self.base_commit = commit;
    }
}

fn load_side(
    store: &Store,
    entries: &BTreeMap<String, Digest>,
    key: &str,
) -> Result<Option<Vec<u8>>> {
    match entries.get(key) {
        Some(pointer) => store.get_blob(pointer),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Memory};
    use std::sync::Mutex;

    fn open_main() -> Branch {
        let store = Store::new(Arc::new(Memory::new()));
        Branch::open(store, "main").unwrap()
    }

    fn updates(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    fn removals(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn none() -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Additive counter: merged = ours + theirs - base.
    fn counter_resolver(
        old: Option<&[u8]>,
        ours: Option<&[u8]>,
        theirs: Option<&[u8]>,
    ) -> std::result::Result<Resolution, String> {
        fn parse(v: Option<&[u8]>) -> std::result::Result<i64, String> {
            match v {
                None => Ok(0),
                Some(bytes) => std::str::from_utf8(bytes)
                    .map_err(|e| e.to_string())?
                    .parse::<i64>()
                    .map_err(|e| e.to_string()),
            }
        }
        let merged = parse(ours)? + parse(theirs)? - parse(old)?;
        Ok(Resolution::Update(merged.to_string().into_bytes()))
    }

    #[test]
    fn test_open_creates_empty_root() {
        let branch = open_main();
        assert_eq!(branch.keys().unwrap(), Vec::<String>::new());
        assert_eq!(branch.current_commit(), branch.base_commit());

        let head = branch.latest_head().unwrap().unwrap();
        assert_eq!(head, branch.current_commit());
    }

    #[test]
    fn test_open_existing_branch_loads_head() {
        let branch = open_main();
        let store = branch.store().clone();
        let mut first = Branch::open(store.clone(), "main").unwrap();
        first.advance(&updates(&[("k", b"v")]), &none()).unwrap();

        let second = Branch::open(store, "main").unwrap();
        assert_eq!(second.current_commit(), first.current_commit());
        assert_eq!(second.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_open_rejects_bad_branch_name() {
        let store = Store::new(Arc::new(Memory::new()));
        assert!(matches!(
            Branch::open(store, "a/b"),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_fast_forward_scenario() {
        let mut branch = open_main();
        let root = branch.current_commit();

        let r1 = branch.advance(&updates(&[("a", b"1")]), &none()).unwrap();
        assert!(r1.merged);
        assert_eq!(r1.strategy, MergeStrategy::FastForward);
        let h1 = r1.commit.unwrap();

        let r2 = branch.advance(&updates(&[("b", b"2")]), &none()).unwrap();
        assert_eq!(r2.strategy, MergeStrategy::FastForward);
        let h2 = r2.commit.unwrap();

        let history: Vec<Digest> = branch.history(false).map(|r| r.unwrap()).collect();
        assert_eq!(history, vec![h2, h1, root]);

        assert_eq!(branch.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(branch.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_no_op_advance() {
        let mut branch = open_main();
        branch.advance(&updates(&[("k", b"v")]), &none()).unwrap();
        let before = branch.current_commit();

        let result = branch.advance(&updates(&[]), &none()).unwrap();
        assert!(result.merged);
        assert_eq!(result.strategy, MergeStrategy::NoOp);
        assert_eq!(result.commit, Some(before));
        assert_eq!(branch.latest_head().unwrap(), Some(before));
    }

    #[test]
    fn test_removals_drop_keys() {
        let mut branch = open_main();
        branch
            .advance(&updates(&[("a", b"1"), ("b", b"2")]), &none())
            .unwrap();
        branch.advance(&updates(&[]), &removals(&["a"])).unwrap();

        assert_eq!(branch.get("a").unwrap(), None);
        assert_eq!(branch.get("b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(branch.keys().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_info_only_commit() {
        let mut branch = open_main();
        let opts = AdvanceOptions {
            info: Some(BTreeMap::from([(
                "message".to_string(),
                "checkpoint".to_string(),
            )])),
            ..Default::default()
        };
        let result = branch.advance_with(&updates(&[]), &none(), opts).unwrap();
        assert_eq!(result.strategy, MergeStrategy::FastForward);

        let info = branch.commit_info(None).unwrap().unwrap();
        assert_eq!(info["message"], "checkpoint");
    }

    #[test]
    fn test_three_way_disjoint_keys() {
        let mut main = open_main();
        main.advance(&updates(&[("u", b"a"), ("s", b"0")]), &none())
            .unwrap();

        // Second handle positioned at the same commit
        let mut dev = main.checkout(&main.current_commit(), None).unwrap().unwrap();

        main.advance(&updates(&[("u", b"b")]), &none()).unwrap();
        let result = dev.advance(&updates(&[("s", b"5")]), &none()).unwrap();

        assert!(result.merged);
        assert_eq!(result.strategy, MergeStrategy::ThreeWay);
        // Nothing needed a resolver
        assert!(result.auto_merged_keys.is_empty());
        assert_eq!(result.carried_keys, vec!["s".to_string(), "u".to_string()]);

        assert_eq!(dev.get("u").unwrap(), Some(b"b".to_vec()));
        assert_eq!(dev.get("s").unwrap(), Some(b"5".to_vec()));

        let head = dev.latest_head().unwrap().unwrap();
        assert!(dev.store().get_commit(&head).unwrap().is_merge());
    }

    #[test]
    fn test_merge_conflict_without_resolver() {
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();

        a.advance(&updates(&[("k", b"from-a")]), &none()).unwrap();
        let winner = a.current_commit();

        let before = b.current_commit();
        let err = b.advance(&updates(&[("k", b"from-b")]), &none()).unwrap_err();
        match err {
            Error::MergeConflict {
                conflicting_keys, ..
            } => assert_eq!(conflicting_keys, removals(&["k"])),
            other => panic!("expected MergeConflict, got {other:?}"),
        }

        // No ref advance for the loser, handle position untouched
        assert_eq!(b.latest_head().unwrap(), Some(winner));
        assert_eq!(b.current_commit(), before);
    }

    #[test]
    fn test_merge_conflict_abandon_is_falsy() {
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();

        a.advance(&updates(&[("k", b"one")]), &none()).unwrap();

        let opts = AdvanceOptions {
            on_conflict: OnConflict::Abandon,
            ..Default::default()
        };
        let result = b
            .advance_with(&updates(&[("k", b"two")]), &none(), opts)
            .unwrap();
        assert!(!result.merged);
        assert_eq!(result.commit, None);
        assert_eq!(b.latest_head().unwrap(), Some(a.current_commit()));
    }

    #[test]
    fn test_counter_merge() {
        let mut a = open_main();
        a.advance(&updates(&[("hits", b"100")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_resolver("hits", counter_resolver);

        a.advance(&updates(&[("hits", b"115")]), &none()).unwrap();
        let result = b.advance(&updates(&[("hits", b"120")]), &none()).unwrap();

        assert!(result.merged);
        assert_eq!(result.strategy, MergeStrategy::ThreeWay);
        assert_eq!(result.auto_merged_keys, vec!["hits".to_string()]);
        // 115 + 120 - 100
        assert_eq!(b.get("hits").unwrap(), Some(b"135".to_vec()));
    }

    #[test]
    fn test_update_vs_remove_goes_to_resolver() {
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_resolver("k", |_, ours, theirs| {
            // Keep whichever side still has a value
            match ours.or(theirs) {
                Some(bytes) => Ok(Resolution::Update(bytes.to_vec())),
                None => Ok(Resolution::Remove),
            }
        });

        a.advance(&updates(&[]), &removals(&["k"])).unwrap();
        let result = b.advance(&updates(&[("k", b"kept")]), &none()).unwrap();

        assert!(result.merged);
        assert_eq!(result.auto_merged_keys, vec!["k".to_string()]);
        assert_eq!(b.get("k").unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn test_resolver_can_remove() {
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_resolver("k", |_, _, _| Ok(Resolution::Remove));

        a.advance(&updates(&[("k", b"one")]), &none()).unwrap();
        let result = b.advance(&updates(&[("k", b"two")]), &none()).unwrap();

        assert!(result.merged);
        assert_eq!(b.get("k").unwrap(), None);
    }

    #[test]
    fn test_resolver_error_is_captured_per_key() {
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_resolver("k", |_, _, _| Err("cannot decide".to_string()));

        a.advance(&updates(&[("k", b"one")]), &none()).unwrap();
        let err = b.advance(&updates(&[("k", b"two")]), &none()).unwrap_err();

        match err {
            Error::MergeConflict {
                conflicting_keys,
                merge_errors,
            } => {
                assert_eq!(conflicting_keys, removals(&["k"]));
                assert_eq!(merge_errors["k"], "cannot decide");
            }
            other => panic!("expected MergeConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_resolver_precedence() {
        // Handle-level key resolver beats handle-level default
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_default_resolver(|_, _, _| Ok(Resolution::Update(b"default".to_vec())));
        b.set_resolver("k", |_, _, _| Ok(Resolution::Update(b"handle".to_vec())));
        a.advance(&updates(&[("k", b"a-side")]), &none()).unwrap();
        b.advance(&updates(&[("k", b"b-side")]), &none()).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"handle".to_vec()));

        // Per-call key resolver beats handle-level key resolver
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_resolver("k", |_, _, _| Ok(Resolution::Update(b"handle".to_vec())));
        a.advance(&updates(&[("k", b"a-side")]), &none()).unwrap();
        let call_fn: MergeFn = Arc::new(|_, _, _| Ok(Resolution::Update(b"call".to_vec())));
        let opts = AdvanceOptions {
            merge_fns: BTreeMap::from([("k".to_string(), call_fn)]),
            ..Default::default()
        };
        b.advance_with(&updates(&[("k", b"b-side")]), &none(), opts)
            .unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"call".to_vec()));

        // Default is the last resort
        let mut a = open_main();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();
        b.set_default_resolver(|_, _, _| Ok(Resolution::Update(b"default".to_vec())));
        a.advance(&updates(&[("k", b"a-side")]), &none()).unwrap();
        b.advance(&updates(&[("k", b"b-side")]), &none()).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"default".to_vec()));
    }

    #[test]
    fn test_create_branch_and_fork_isolation() {
        let mut main = open_main();
        main.advance(&updates(&[("shared", b"v")]), &none()).unwrap();

        let mut dev = main.create_branch("dev", None).unwrap();
        assert_eq!(dev.name(), "dev");
        assert_eq!(dev.current_commit(), main.current_commit());

        dev.advance(&updates(&[("dev-only", b"d")]), &none()).unwrap();

        // Fork advanced alone
        assert_eq!(main.get("dev-only").unwrap(), None);
        assert_eq!(
            main.peek("dev-only", "dev").unwrap(),
            Some(b"d".to_vec())
        );
        assert_eq!(
            main.list_branches().unwrap(),
            vec!["dev".to_string(), "main".to_string()]
        );
    }

    #[test]
    fn test_create_branch_name_collision() {
        let main = open_main();
        main.create_branch("dev", None).unwrap();
        assert!(matches!(
            main.create_branch("dev", None),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_create_branch_at_missing_commit() {
        let main = open_main();
        let ghost = Digest::compute(b"ghost");
        assert!(matches!(
            main.create_branch("dev", Some(&ghost)),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_switch_branch() {
        let mut main = open_main();
        main.advance(&updates(&[("k", b"main")]), &none()).unwrap();
        let mut dev = main.create_branch("dev", None).unwrap();
        dev.advance(&updates(&[("k", b"dev")]), &none()).unwrap();

        main.switch_branch("dev").unwrap();
        assert_eq!(main.name(), "dev");
        assert_eq!(main.get("k").unwrap(), Some(b"dev".to_vec()));

        assert!(matches!(
            main.switch_branch("nope"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_branch() {
        let main = open_main();
        main.create_branch("dev", None).unwrap();
        main.delete_branch("dev").unwrap();
        assert_eq!(main.list_branches().unwrap(), vec!["main".to_string()]);

        assert!(matches!(
            main.delete_branch("dev"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            main.delete_branch("main"),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_checkout_missing_commit_is_none() {
        let main = open_main();
        let ghost = Digest::compute(b"ghost");
        assert!(main.checkout(&ghost, None).unwrap().is_none());
    }

    #[test]
    fn test_checkout_reads_old_state() {
        let mut main = open_main();
        main.advance(&updates(&[("k", b"old")]), &none()).unwrap();
        let old = main.current_commit();
        main.advance(&updates(&[("k", b"new")]), &none()).unwrap();

        let handle = main.checkout(&old, None).unwrap().unwrap();
        assert_eq!(handle.get("k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn test_reset_to_rolls_back() {
        let mut main = open_main();
        main.advance(&updates(&[("k", b"v1")]), &none()).unwrap();
        let first = main.current_commit();
        main.advance(&updates(&[("k", b"v2")]), &none()).unwrap();

        assert!(main.reset_to(&first).unwrap());
        assert_eq!(main.latest_head().unwrap(), Some(first));
        assert_eq!(main.get("k").unwrap(), Some(b"v1".to_vec()));

        let ghost = Digest::compute(b"ghost");
        assert!(!main.reset_to(&ghost).unwrap());
    }

    #[test]
    fn test_refresh_follows_other_writers() {
        let mut a = open_main();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();

        a.advance(&updates(&[("k", b"v")]), &none()).unwrap();
        assert_ne!(b.current_commit(), a.current_commit());

        b.refresh().unwrap();
        assert_eq!(b.current_commit(), a.current_commit());
        assert_eq!(b.base_commit(), a.current_commit());
    }

    /// Backend wrapper that moves the ref to a staged value right before
    /// one CAS, forcing that CAS to lose.
    struct RacingBackend {
        inner: Memory,
        target_key: String,
        stage: Mutex<Option<Vec<u8>>>,
    }

    impl Backend for RacingBackend {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
        fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys()
        }
        fn items(&self) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.items()
        }
        fn cas(&self, key: &str, new: &[u8], expected: Option<&[u8]>) -> Result<bool> {
            if key == self.target_key {
                if let Some(staged) = self.stage.lock().unwrap().take() {
                    self.inner.set(key, &staged)?;
                }
            }
            self.inner.cas(key, new, expected)
        }
        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }
    }

    #[test]
    fn test_state_recovery_after_concurrency_error() {
        let racing = Arc::new(RacingBackend {
            inner: Memory::new(),
            target_key: "refs/main".to_string(),
            stage: Mutex::new(None),
        });
        let store = Store::new(racing.clone() as Arc<dyn Backend>);

        let mut a = Branch::open(store.clone(), "main").unwrap();
        a.advance(&updates(&[("k", b"base")]), &none()).unwrap();
        let mut b = a.checkout(&a.current_commit(), None).unwrap().unwrap();

        // Move HEAD past b so its advance takes the merge path
        a.advance(&updates(&[("x", b"1")]), &none()).unwrap();

        // Stage a competing head that lands mid-merge
        let competing = store
            .write(&a.current_commit(), &updates(&[("y", b"2")]), &none(), None)
            .unwrap();
        *racing.stage.lock().unwrap() = Some(competing.to_hex().into_bytes());

        let before = b.current_commit();
        let err = b.advance(&updates(&[("k", b"mine")]), &none()).unwrap_err();
        assert!(matches!(err, Error::Concurrency { .. }));
        assert_eq!(b.current_commit(), before);

        // Refresh and retry: the pending change lands with nothing lost
        b.refresh().unwrap();
        let result = b.advance(&updates(&[("k", b"mine")]), &none()).unwrap();
        assert!(result.merged);
        assert_eq!(b.get("k").unwrap(), Some(b"mine".to_vec()));
        assert_eq!(b.get("y").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_cas_serializability_across_threads() {
        const THREADS: usize = 4;
        const ADVANCES: usize = 5;

        let store = Store::new(Arc::new(Memory::new()));
        let root_handle = Branch::open(store.clone(), "main").unwrap();
        let root = root_handle.current_commit();

        let mut joins = Vec::new();
        for t in 0..THREADS {
            let store = store.clone();
            joins.push(std::thread::spawn(move || {
                let mut handle = Branch::open(store, "main").unwrap();
                for i in 0..ADVANCES {
                    // All writers contend on one key with distinct values,
                    // so only fast-forwards can succeed; a losing attempt
                    // abandons and retries from the fresh head.
                    let value = format!("{t}:{i}").into_bytes();
                    loop {
                        handle.refresh().unwrap();
                        let opts = AdvanceOptions {
                            on_conflict: OnConflict::Abandon,
                            ..Default::default()
                        };
                        let result = handle
                            .advance_with(
                                &updates(&[("slot", value.as_slice())]),
                                &none(),
                                opts,
                            )
                            .unwrap();
                        if result.merged {
                            break;
                        }
                    }
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }

        // The final head closes a single linear chain of THREADS * ADVANCES
        // commits over the root.
        let check = Branch::open(store.clone(), "main").unwrap();
        let head = check.latest_head().unwrap().unwrap();
        let chain: Vec<Digest> = store
            .history(&head, true)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(chain.len(), THREADS * ADVANCES + 1);
        assert_eq!(*chain.last().unwrap(), root);
        for id in &chain {
            assert!(store.get_commit(id).unwrap().parents.len() <= 1);
        }
    }
}
