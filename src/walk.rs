//! History traversal over the commit DAG.

use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::store::Store;
use std::collections::{HashSet, VecDeque};

/// Upper bound on commits visited by one traversal. A store whose DAG is
/// deeper than this is treated as corrupt rather than walked forever.
const MAX_WALK: usize = 1 << 20;

impl Store {
    /// Walk history from `start`, newest to oldest.
    ///
    /// Linear mode (`all_parents = false`) follows first parents only; DAG
    /// mode visits every parent breadth-first, yielding each commit once.
    /// The walk is lazy and restartable: call again for a fresh iterator.
    pub fn history(&self, start: &Digest, all_parents: bool) -> History {
        History {
            store: self.clone(),
            queue: VecDeque::from([*start]),
            visited: HashSet::new(),
            all_parents,
            steps: 0,
            done: false,
        }
    }

    /// The parent ids of a commit; a missing commit reads as parentless.
    pub fn parents_of(&self, id: &Digest) -> Result<Vec<Digest>> {
        match self.get_commit(id) {
            Ok(commit) => Ok(commit.parents),
            Err(Error::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Lowest common ancestor of two commits.
    ///
    /// Interleaved BFS from both sides; the first commit reached from both
    /// is the answer. `None` only when the commits share no history.
    pub fn lca(&self, a: &Digest, b: &Digest) -> Result<Option<Digest>> {
        if a == b {
            return Ok(Some(*a));
        }

        let mut seen_a: HashSet<Digest> = HashSet::from([*a]);
        let mut seen_b: HashSet<Digest> = HashSet::from([*b]);
        let mut queue_a: VecDeque<Digest> = VecDeque::from([*a]);
        let mut queue_b: VecDeque<Digest> = VecDeque::from([*b]);

        while !queue_a.is_empty() || !queue_b.is_empty() {
            if let Some(current) = queue_a.pop_front() {
                if seen_b.contains(&current) {
                    return Ok(Some(current));
                }
                for parent in self.parents_of(&current)? {
                    if seen_a.insert(parent) {
                        if seen_b.contains(&parent) {
                            return Ok(Some(parent));
                        }
                        queue_a.push_back(parent);
                    }
                }
            }

            if let Some(current) = queue_b.pop_front() {
                if seen_a.contains(&current) {
                    return Ok(Some(current));
                }
                for parent in self.parents_of(&current)? {
                    if seen_b.insert(parent) {
                        if seen_a.contains(&parent) {
                            return Ok(Some(parent));
                        }
                        queue_b.push_back(parent);
                    }
                }
            }
        }

        Ok(None)
    }

    /// Every commit reachable from any branch ref (the GC mark phase).
    pub fn reachable_commits(&self) -> Result<HashSet<Digest>> {
        let mut reachable = HashSet::new();
        for branch in self.branches()? {
            let head = match self.read_ref(&branch)? {
                Some(head) => head,
                None => continue,
            };
            let mut queue = VecDeque::from([head]);
            while let Some(current) = queue.pop_front() {
                if !reachable.insert(current) {
                    continue;
                }
                for parent in self.parents_of(&current)? {
                    if !reachable.contains(&parent) {
                        queue.push_back(parent);
                    }
                }
            }
        }
        Ok(reachable)
    }
}

/// Lazy commit iterator returned by [`Store::history`].
pub struct History {
    store: Store,
    queue: VecDeque<Digest>,
    visited: HashSet<Digest>,
    all_parents: bool,
    steps: usize,
    done: bool,
}

impl Iterator for History {
    type Item = Result<Digest>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let current = match self.queue.pop_front() {
                Some(id) => id,
                None => {
                    self.done = true;
                    return None;
                }
            };
            if !self.visited.insert(current) {
                continue;
            }

            self.steps += 1;
            if self.steps > MAX_WALK {
                self.done = true;
                return Some(Err(Error::corrupt(format!(
                    "history walk exceeded {} commits",
                    MAX_WALK
                ))));
            }

            let parents = match self.store.parents_of(&current) {
                Ok(parents) => parents,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if self.all_parents {
                for parent in parents {
                    if !self.visited.contains(&parent) {
                        self.queue.push_back(parent);
                    }
                }
            } else if let Some(first) = parents.first() {
                if self.visited.contains(first) {
                    self.done = true;
                    return Some(Err(Error::corrupt(format!(
                        "parent cycle at commit {}",
                        first.short()
                    ))));
                }
                self.queue.push_back(*first);
            }

            return Some(Ok(current));
        }
    }
}
