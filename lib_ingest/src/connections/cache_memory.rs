//! # In-Memory Cache
//!
//! A [`CacheBackend`] held in a mutex-guarded map. Expiry is checked lazily
//! on read against `tokio::time::Instant`, so tests running under a paused
//! clock can advance past a TTL deterministically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::collaborators::{CacheBackend, CallResult};
use crate::error::CollaboratorError;

/// Process-local [`CacheBackend`].
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (Bytes, Instant)>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    /// `true` when no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(k, (_, exp))| k.starts_with(prefix) && *exp > now)
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Drops every entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, (Bytes, Instant)>) -> T,
    ) -> CallResult<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("in-memory cache lock poisoned".to_string()))?;
        Ok(f(&mut entries))
    }
}

impl CacheBackend for InMemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CallResult<Option<Bytes>>> {
        Box::pin(async move {
            let now = Instant::now();
            self.with_entries(|entries| {
                let live = entries
                    .get(key)
                    .filter(|(_, expires)| *expires > now)
                    .map(|(value, _)| value.clone());
                if live.is_none() {
                    entries.remove(key);
                }
                live
            })
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CallResult<()>> {
        Box::pin(async move {
            let expires = Instant::now() + ttl;
            self.with_entries(|entries| {
                entries.insert(key.to_string(), (value, expires));
            })
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, CallResult<bool>> {
        Box::pin(async move {
            let now = Instant::now();
            self.with_entries(|entries| {
                if entries.get(key).is_some_and(|(_, expires)| *expires > now) {
                    return false;
                }
                entries.insert(key.to_string(), (value, now + ttl));
                true
            })
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, CallResult<()>> {
        Box::pin(async move {
            self.with_entries(|entries| {
                for key in keys {
                    entries.remove(key);
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn set_if_absent_keeps_the_first_writer() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert!(cache.set_if_absent("k", Bytes::from_static(b"a"), ttl).await.unwrap());
        assert!(!cache.set_if_absent("k", Bytes::from_static(b"b"), ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn delete_ignores_missing_keys() {
        let cache = InMemoryCache::new();
        cache.set("a", Bytes::new(), Duration::from_secs(60)).await.unwrap();
        cache.delete(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(cache.keys_with_prefix("").is_empty());
    }
}
