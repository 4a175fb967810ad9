//! # Key-Value Store Capability
//!
//! Durable storage lives outside this crate. The core only needs a flat
//! string-to-string namespace for directory snapshots and cached settings,
//! so that is the whole contract: four methods, injected by the application
//! shell. A browser shell backs it with local storage, a desktop shell with
//! a file or an embedded database, tests with [`MemoryStore`].

use std::collections::HashMap;

use parking_lot::RwLock;

/// The narrow persistence interface the core consumes.
///
/// Implementations use interior mutability; the core only ever holds
/// `&dyn KeyValueStore`. `set`/`remove` return whether the operation took
/// effect, letting callers notice a read-only or full backend without the
/// core having to care why.
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value under `key`, if present.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> bool;

    /// Delete `key`. Returns `false` when the key was absent.
    fn remove(&self, key: &str) -> bool;

    /// All currently present keys, in no particular order.
    fn keys(&self) -> Vec<String>;
}

/// In-memory store: the test backend and a perfectly serviceable
/// no-persistence default.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        self.entries.write().insert(key.into(), value.into());
        true
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_cycle() {
        let store = MemoryStore::new();
        assert!(store.get("a").is_none());
        assert!(store.set("a", "1"));
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert!(store.set("a", "2"));
        assert_eq!(store.get("a").as_deref(), Some("2"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn keys_lists_everything() {
        let store = MemoryStore::new();
        store.set("x", "1");
        store.set("y", "2");
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
    }
}
