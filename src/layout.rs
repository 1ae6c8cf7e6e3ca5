//! Persisted key schema over the backend namespace.
//!
//! Four disjoint key families, identified by reserved prefixes:
//!
//! ```text
//! commits/<hex_id>   canonical commit serialization
//! refs/<branch>      current commit id for the branch (utf-8 hex)
//! data/<pointer>     value blob bytes, verbatim
//! meta/<user_key>    per-key metadata record
//! ```
//!
//! Branch names must not contain `/`. User keys may contain `/` but must
//! not begin with a reserved prefix.

use crate::error::{Error, Result};
use crate::hash::Digest;

/// Prefix for immutable commit objects.
pub const COMMIT_PREFIX: &str = "commits/";

/// Prefix for mutable branch refs.
pub const REF_PREFIX: &str = "refs/";

/// Prefix for content-addressed value blobs.
pub const DATA_PREFIX: &str = "data/";

/// Prefix for per-key metadata records.
pub const META_PREFIX: &str = "meta/";

const RESERVED_PREFIXES: [&str; 4] = [COMMIT_PREFIX, REF_PREFIX, DATA_PREFIX, META_PREFIX];

/// Backend key for a commit object.
pub fn commit_key(id: &Digest) -> String {
    format!("{COMMIT_PREFIX}{id}")
}

/// Backend key for a branch ref.
pub fn ref_key(branch: &str) -> String {
    format!("{REF_PREFIX}{branch}")
}

/// Backend key for a value blob.
pub fn data_key(pointer: &Digest) -> String {
    format!("{DATA_PREFIX}{pointer}")
}

/// Backend key for a user key's metadata record.
pub fn meta_key(user_key: &str) -> String {
    format!("{META_PREFIX}{user_key}")
}

/// The branch name encoded in a backend key, if it is a ref key.
pub fn branch_of_ref_key(backend_key: &str) -> Option<&str> {
    backend_key
        .strip_prefix(REF_PREFIX)
        .filter(|name| !name.is_empty())
}

/// The commit id encoded in a backend key, if it is a commit key.
pub fn id_of_commit_key(backend_key: &str) -> Option<&str> {
    backend_key
        .strip_prefix(COMMIT_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Validate a branch name: non-empty, no `/`.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("branch name must not be empty"));
    }
    if name.contains('/') {
        return Err(Error::invalid_argument(format!(
            "branch name must not contain '/': {name:?}"
        )));
    }
    Ok(())
}

/// Validate a user key: non-empty, not inside a reserved key family.
pub fn validate_user_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    for prefix in RESERVED_PREFIXES {
        if key.starts_with(prefix) {
            return Err(Error::invalid_argument(format!(
                "key must not begin with reserved prefix {prefix:?}: {key:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builders() {
        let id = Digest::compute(b"x");
        assert_eq!(commit_key(&id), format!("commits/{}", id.to_hex()));
        assert_eq!(data_key(&id), format!("data/{}", id.to_hex()));
        assert_eq!(ref_key("main"), "refs/main");
        assert_eq!(meta_key("ns/counter"), "meta/ns/counter");
    }

    #[test]
    fn test_branch_of_ref_key() {
        assert_eq!(branch_of_ref_key("refs/main"), Some("main"));
        assert_eq!(branch_of_ref_key("refs/"), None);
        assert_eq!(branch_of_ref_key("data/abc"), None);
    }

    #[test]
    fn test_id_of_commit_key() {
        assert_eq!(id_of_commit_key("commits/abc"), Some("abc"));
        assert_eq!(id_of_commit_key("refs/main"), None);
    }

    #[test]
    fn test_validate_branch_name() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature-2").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("a/b").is_err());
    }

    #[test]
    fn test_validate_user_key() {
        assert!(validate_user_key("counter").is_ok());
        // User keys may contain '/'
        assert!(validate_user_key("ns/counter").is_ok());
        assert!(validate_user_key("__config").is_ok());
        assert!(validate_user_key("").is_err());
        assert!(validate_user_key("refs/main").is_err());
        assert!(validate_user_key("commits/abc").is_err());
        assert!(validate_user_key("data/abc").is_err());
        assert!(validate_user_key("meta/abc").is_err());
    }
}
