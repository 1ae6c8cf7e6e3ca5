//! # caskv
//!
//! A versioned, content-addressable key-value engine with git-like
//! semantics, layered over any byte-level backend that offers
//! compare-and-swap.
//!
//! ## Features
//!
//! - Immutable, content-addressed commits (BLAKE3 over a canonical
//!   serialization)
//! - Named branches advanced only through CAS on their refs
//! - Fast-forward and three-way merge with pluggable per-key resolvers
//! - Lazy history traversal, key-level diff, and lowest-common-ancestor
//!   computation over the commit DAG
//! - Size-bounded garbage collection: rebase onto a fresh root keeping the
//!   hottest keys, then clean unreachable history
//!
//! There is no engine-level lock. Any number of handles, in one process or
//! several, may target the same branch; the backend's CAS decides which
//! advance lands first and the loser merges or retries.
//!
//! ## Example
//!
//! ```
//! use caskv::{Branch, Memory, Store};
//! use std::collections::{BTreeMap, BTreeSet};
//! use std::sync::Arc;
//!
//! # fn main() -> caskv::Result<()> {
//! let store = Store::new(Arc::new(Memory::new()));
//! let mut branch = Branch::open(store, "main")?;
//!
//! let updates = BTreeMap::from([("greeting".to_string(), b"hello".to_vec())]);
//! let result = branch.advance(&updates, &BTreeSet::new())?;
//! assert!(result.merged);
//!
//! assert_eq!(branch.get("greeting")?, Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

mod backend;
mod branch;
mod commit;
mod error;
mod gc;
mod hash;
mod layout;
mod merge;
mod store;
mod walk;

pub use backend::{Backend, Memory};
pub use branch::{AdvanceOptions, Branch};
pub use commit::{Commit, CommitInfo};
pub use error::{Error, Result};
pub use gc::{is_system_key, Gc, RebaseResult, DEFAULT_MIN_AGE_SECS};
pub use hash::{Digest, DIGEST_SIZE};
pub use layout::{COMMIT_PREFIX, DATA_PREFIX, META_PREFIX, REF_PREFIX};
pub use merge::{DiffResult, MergeFn, MergeResult, MergeStrategy, OnConflict, Resolution};
pub use store::{MetaEntry, Store};
pub use walk::History;
