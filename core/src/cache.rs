//! TTL-gated memoization for slow-changing vendor data.
//!
//! Only idempotent, read-only responses (version strings, static system info)
//! belong here. Anything reflecting live state (power, service status) must
//! never be cached.
//!
//! Reads take the shared lock. A miss takes the client-wide refresh lock,
//! re-checks, then fetches, so concurrent callers on a cold key trigger one
//! fetch between them. Invalidation takes the same refresh lock.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::error::Result;

/// A cached value and when it was stored.
#[derive(Debug, Clone)]
pub struct CachedValue<T> {
    pub data: T,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<T> CachedValue<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

/// Per-client response cache keyed by string.
pub struct ResponseCache<T> {
    entries: RwLock<HashMap<String, CachedValue<T>>>,
    refresh: Mutex<()>,
}

impl<T: Clone> Default for ResponseCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ResponseCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh: Mutex::new(()),
        }
    }

    async fn lookup(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.data.clone())
    }

    /// Return the cached value for `key`, or call `fetch` and cache its result.
    /// Errors from `fetch` are returned and not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(data) = self.lookup(key).await {
            return Ok(data);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(data) = self.lookup(key).await {
            return Ok(data);
        }

        let data = fetch().await?;
        tracing::trace!(key, ttl_ms = ttl.as_millis() as u64, "cache refreshed");
        self.entries
            .write()
            .await
            .insert(key.to_string(), CachedValue::new(data.clone(), ttl));
        Ok(data)
    }

    /// Force the next access for `key` onto the slow path.
    ///
    /// Waits for a refresh already in flight, so a fetch that started before
    /// the invalidation cannot store its result afterwards.
    pub async fn invalidate(&self, key: &str) {
        let _guard = self.refresh.lock().await;
        self.entries.write().await.remove(key);
    }

    /// Drop every entry (e.g. after a reboot). Waits for an in-flight refresh
    /// like [`invalidate`](Self::invalidate).
    pub async fn clear(&self) {
        let _guard = self.refresh.lock().await;
        self.entries.write().await.clear();
    }
}
