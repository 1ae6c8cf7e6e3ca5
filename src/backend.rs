//! Byte-level key-value backend contract and the in-memory implementation.

use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// An unordered mapping from string keys to byte values.
///
/// The engine layers commits, refs, blobs, and metadata over this surface;
/// the only synchronization primitive it relies on is [`Backend::cas`].
/// Backends must treat values as opaque bytes. All keys the engine passes
/// are ASCII strings using `/` as the reserved separator.
pub trait Backend: Send + Sync {
    /// Get the value for a key, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set the value for a key.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Get multiple keys, returning only the entries that exist.
    fn get_many(&self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut result = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(key)? {
                result.insert((*key).to_string(), value);
            }
        }
        Ok(result)
    }

    /// Set multiple key-value pairs.
    fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Remove multiple keys.
    fn remove_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// All keys currently present.
    fn keys(&self) -> Result<Vec<String>>;

    /// All key-value pairs currently present.
    fn items(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Whether a key is present.
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomic compare-and-swap.
    ///
    /// Sets `key` to `new` only if the current value equals `expected`;
    /// `expected = None` means "create only if absent". Returns whether the
    /// swap happened. Must be linearizable with respect to other `cas`
    /// calls on the same key; other operations need not be.
    fn cas(&self, key: &str, new: &[u8], expected: Option<&[u8]>) -> Result<bool>;

    /// Remove all keys.
    fn clear(&self) -> Result<()>;
}

/// A memory-backed [`Backend`].
///
/// Every operation takes the same mutex, which makes `cas` linearizable
/// and the whole surface safe for concurrent handles in one process.
#[derive(Debug, Default)]
pub struct Memory {
    cells: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Memory {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // A panic while holding the lock leaves plain data behind, so a
        // poisoned guard is still usable.
        self.cells.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Backend for Memory {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn get_many(&self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        let cells = self.lock();
        let mut result = BTreeMap::new();
        for key in keys {
            if let Some(value) = cells.get(*key) {
                result.insert((*key).to_string(), value.clone());
            }
        }
        Ok(result)
    }

    fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let mut cells = self.lock();
        for (key, value) in entries {
            cells.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> Result<()> {
        let mut cells = self.lock();
        for key in keys {
            cells.remove(key);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn items(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lock().contains_key(key))
    }

    fn cas(&self, key: &str, new: &[u8], expected: Option<&[u8]>) -> Result<bool> {
        let mut cells = self.lock();
        let current = cells.get(key).map(|v| v.as_slice());
        if current == expected {
            cells.insert(key.to_string(), new.to_vec());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}
