// 🗃️ TTL Cache - Deduplicates identical upstream fetches within a time window
//
// Backed by moka with a time-to-live and no capacity cap. Two in-flight
// fetches for the same key both complete and the later insert wins; the
// payload does not depend on which request produced it, so the duplicate
// work is harmless.

use chrono::NaiveDate;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CACHE KEYS
// ============================================================================

/// The three upstream datasets the fetch layer retrieves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    Entries,
    DeviceStatus,
    Profiles,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Entries => "entries",
            DatasetKind::DeviceStatus => "devicestatus",
            DatasetKind::Profiles => "profile",
        }
    }
}

/// Deterministic key for `(dataset, start, end)`
pub fn cache_key(kind: DatasetKind, start: NaiveDate, end: NaiveDate) -> String {
    format!("{}:{}:{}", kind.as_str(), start, end)
}

// ============================================================================
// TTL CACHE
// ============================================================================

/// Shared key/value store of raw payload bytes with a fixed time-to-live.
///
/// Every reader of a live key gets the same `Arc`, so two hits within the
/// TTL are byte-identical. Clones share storage.
#[derive(Clone)]
pub struct TtlCache {
    payloads: Cache<String, Arc<Vec<u8>>>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        let payloads = Cache::builder().time_to_live(ttl).build();
        TtlCache { payloads, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.payloads.get(key).await
    }

    /// Store `value` under `key`, overwriting any previous entry
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Arc<Vec<u8>> {
        let value = Arc::new(value);
        self.payloads.insert(key.to_string(), Arc::clone(&value)).await;
        value
    }

    /// Return the cached value, or run `fetch` and cache its output.
    ///
    /// Failed fetches are not cached. Concurrent misses on one key are not
    /// coalesced.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Arc<Vec<u8>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(hit) = self.get(key).await {
            log::debug!("Cache hit: {}", key);
            return Ok(hit);
        }

        log::debug!("Cache miss: {}", key);
        let payload = fetch().await?;
        Ok(self.set(key, payload).await)
    }
}

// ============================================================================
// TESTS
// ============================================================================
