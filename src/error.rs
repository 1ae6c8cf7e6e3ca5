//! Error types for caskv.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Result type alias using caskv's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A CAS against a branch ref failed because another writer moved it.
    #[error("concurrent update: {reason}")]
    Concurrency { reason: String },

    /// A three-way merge left keys that no resolver could settle.
    #[error("merge conflict on {} key(s)", conflicting_keys.len())]
    MergeConflict {
        /// Keys changed on both sides with no successful resolution.
        conflicting_keys: BTreeSet<String>,
        /// Per-key resolver failures, keyed by user key.
        merge_errors: BTreeMap<String, String>,
    },

    /// A commit, branch, or key does not exist where one is required.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A branch with this name already exists.
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// The backend failed.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// A stored object violates an engine invariant. The store is corrupt.
    #[error("corrupt store: {reason}")]
    Corrupt { reason: String },

    /// The caller passed an argument the engine cannot accept.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl Error {
    /// Create a Concurrency error.
    pub fn concurrency(reason: impl Into<String>) -> Self {
        Error::Concurrency {
            reason: reason.into(),
        }
    }

    /// Create a MergeConflict error.
    pub fn merge_conflict(
        conflicting_keys: BTreeSet<String>,
        merge_errors: BTreeMap<String, String>,
    ) -> Self {
        Error::MergeConflict {
            conflicting_keys,
            merge_errors,
        }
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Error::AlreadyExists { what: what.into() }
    }

    /// Create a Storage error.
    pub fn storage(reason: impl Into<String>) -> Self {
        Error::Storage {
            reason: reason.into(),
        }
    }

    /// Create a Corrupt error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }
}
