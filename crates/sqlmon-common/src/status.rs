use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-process status registry: key → short human-readable string.
///
/// Every long-running task registers one or more keys at construction and
/// updates them whenever its state changes. Handles are cheap to clone and
/// share one underlying map.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut map = self.inner.write().expect("status registry poisoned");
        map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.inner.read().expect("status registry poisoned");
        map.get(key).cloned()
    }

    pub fn remove(&self, key: &str) {
        let mut map = self.inner.write().expect("status registry poisoned");
        map.remove(key);
    }

    /// Snapshot of all keys, sorted for stable rendering.
    pub fn all(&self) -> Vec<(String, String)> {
        let map = self.inner.read().expect("status registry poisoned");
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort();
        entries
    }
}
