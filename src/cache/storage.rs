//! Named response caches, looked up by request URL.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::CachedResponse;

#[derive(Debug, Default)]
struct NamedCache {
    name: String,
    entries: HashMap<String, CachedResponse>,
}

/// In-memory set of named caches, kept in creation order.
///
/// Cheap to clone; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    inner: Arc<RwLock<Vec<NamedCache>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the cache if it does not exist yet.
    pub fn open(&self, name: &str) {
        let mut caches = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !caches.iter().any(|c| c.name == name) {
            caches.push(NamedCache {
                name: name.to_string(),
                entries: HashMap::new(),
            });
        }
    }

    /// Store `response` under `key` in cache `name`, creating the cache if needed.
    pub fn put(&self, name: &str, key: &str, response: CachedResponse) {
        self.put_all(name, vec![(key.to_string(), response)]);
    }

    /// Store several entries at once; readers never observe a partial batch.
    pub fn put_all(&self, name: &str, entries: Vec<(String, CachedResponse)>) {
        let mut caches = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let index = match caches.iter().position(|c| c.name == name) {
            Some(i) => i,
            None => {
                caches.push(NamedCache {
                    name: name.to_string(),
                    entries: HashMap::new(),
                });
                caches.len() - 1
            }
        };
        for (key, response) in entries {
            tracing::debug!("CacheStorage: {} <- {} ({} bytes)", name, key, response.body.len());
            caches[index].entries.insert(key, response);
        }
    }

    /// Look `key` up in one cache.
    pub fn match_in(&self, name: &str, key: &str) -> Option<CachedResponse> {
        let caches = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        caches
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.entries.get(key))
            .cloned()
    }

    /// Look `key` up across all caches, oldest cache first.
    pub fn match_any(&self, key: &str) -> Option<CachedResponse> {
        let caches = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        caches.iter().find_map(|c| c.entries.get(key)).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        let caches = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        caches.iter().any(|c| c.name == name)
    }

    /// Cache names in creation order.
    pub fn keys(&self) -> Vec<String> {
        let caches = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        caches.iter().map(|c| c.name.clone()).collect()
    }

    /// Remove a whole cache. Returns true if it existed.
    pub fn delete(&self, name: &str) -> bool {
        let mut caches = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = caches.len();
        caches.retain(|c| c.name != name);
        caches.len() != before
    }

    /// Number of entries in cache `name`.
    pub fn len(&self, name: &str) -> usize {
        let caches = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        caches
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.entries.len())
            .unwrap_or(0)
    }
}
