//! Caching Layer
//!
//! Uniform get/set/del with TTL over two backends: an in-process concurrent
//! map and a remote REST key/value store. Selection happens once at init;
//! a single adapter is installed process-wide.
//!
//! All operations are best-effort: remote transport failures downgrade a
//! `get` to a miss and a `set`/`del` to a logged no-op, so callers never
//! see a cache error.
//!
//! ## Usage
//!
//! ```no_run
//! use llm_substrate::CacheAdapter;
//! # #[tokio::main]
//! # async fn main() {
//! let cache = CacheAdapter::from_env();
//!
//! if let Some(hit) = cache.get("result_key").await {
//!     println!("{hit}");
//! }
//!
//! cache.set("result_key", "serialized result", 3600).await; // TTL: 1 hour
//! # }
//! ```

use crate::now_ms;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable naming the remote cache endpoint.
pub const REMOTE_CACHE_URL: &str = "REMOTE_CACHE_URL";
/// Environment variable holding the remote cache bearer token.
pub const REMOTE_CACHE_TOKEN: &str = "REMOTE_CACHE_TOKEN";

/// How often the in-memory backend sweeps out expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Cache entry with expiration
#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at_ms: u64,
}

/// Cache adapter supporting memory and remote REST backends
#[derive(Clone)]
pub struct CacheAdapter {
    backend: CacheBackend,
}

#[derive(Clone)]
enum CacheBackend {
    Memory(Arc<MemoryCache>),
    Remote(Arc<RemoteCache>),
}

struct MemoryCache {
    store: DashMap<String, CacheEntry>,
}

struct RemoteCache {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl CacheAdapter {
    /// Create an in-memory cache.
    ///
    /// When called inside a Tokio runtime this also spawns the periodic
    /// sweep task; outside a runtime expiry is enforced lazily on `get`.
    pub fn new_memory() -> Self {
        let inner = Arc::new(MemoryCache {
            store: DashMap::new(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweep = Arc::downgrade(&inner);
            handle.spawn(async move {
                let mut tick = tokio::time::interval(SWEEP_INTERVAL);
                tick.tick().await; // first tick fires immediately
                loop {
                    tick.tick().await;
                    let Some(cache) = sweep.upgrade() else { break };
                    let now = now_ms();
                    let before = cache.store.len();
                    cache.store.retain(|_, e| e.expires_at_ms > now);
                    let evicted = before - cache.store.len();
                    if evicted > 0 {
                        debug!(evicted = evicted, "cache sweep evicted expired entries");
                    }
                }
            });
        }

        Self {
            backend: CacheBackend::Memory(inner),
        }
    }

    /// Create a remote REST-backed cache.
    pub fn new_remote(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            backend: CacheBackend::Remote(Arc::new(RemoteCache {
                client: reqwest::Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                token: token.into(),
            })),
        }
    }

    /// Select a backend from the environment: remote when both
    /// `REMOTE_CACHE_URL` and `REMOTE_CACHE_TOKEN` are set, else memory.
    pub fn from_env() -> Self {
        match (
            std::env::var(REMOTE_CACHE_URL),
            std::env::var(REMOTE_CACHE_TOKEN),
        ) {
            (Ok(url), Ok(token)) if !url.is_empty() && !token.is_empty() => {
                debug!(url = %url, "using remote cache backend");
                Self::new_remote(url, token)
            }
            _ => {
                debug!("using in-memory cache backend");
                Self::new_memory()
            }
        }
    }

    /// Get cached value if present and not expired. Never errors: remote
    /// failures are reported as a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.backend {
            CacheBackend::Memory(cache) => {
                if let Some(entry) = cache.store.get(key) {
                    if entry.expires_at_ms > now_ms() {
                        debug!(key = key, "cache hit (memory)");
                        return Some(entry.value.clone());
                    }
                    drop(entry);
                    cache.store.remove(key);
                    debug!(key = key, "cache expired");
                }
                debug!(key = key, "cache miss (memory)");
                None
            }
            CacheBackend::Remote(cache) => match cache.get(key).await {
                Ok(Some(value)) => {
                    debug!(key = key, "cache hit (remote)");
                    Some(value)
                }
                Ok(None) => {
                    debug!(key = key, "cache miss (remote)");
                    None
                }
                Err(e) => {
                    warn!(key = key, error = %e, "remote cache get failed, treating as miss");
                    None
                }
            },
        }
    }

    /// Set cached value with TTL in seconds. Overwrites any previous entry.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl_secs: u64) {
        let key = key.into();
        let value = value.into();

        match &self.backend {
            CacheBackend::Memory(cache) => {
                cache.store.insert(
                    key.clone(),
                    CacheEntry {
                        value,
                        expires_at_ms: now_ms() + ttl_secs * 1000,
                    },
                );
                debug!(key = key, ttl_secs = ttl_secs, "cached (memory)");
            }
            CacheBackend::Remote(cache) => {
                if let Err(e) = cache.set(&key, &value, ttl_secs).await {
                    warn!(key = key, error = %e, "remote cache set failed");
                } else {
                    debug!(key = key, ttl_secs = ttl_secs, "cached (remote)");
                }
            }
        }
    }

    /// Delete cached value.
    pub async fn del(&self, key: &str) {
        match &self.backend {
            CacheBackend::Memory(cache) => {
                cache.store.remove(key);
                debug!(key = key, "deleted from cache (memory)");
            }
            CacheBackend::Remote(cache) => {
                if let Err(e) = cache.del(key).await {
                    warn!(key = key, error = %e, "remote cache delete failed");
                } else {
                    debug!(key = key, "deleted from cache (remote)");
                }
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        match &self.backend {
            CacheBackend::Memory(cache) => CacheStats {
                entries: cache.store.len(),
                backend: "memory".to_string(),
            },
            CacheBackend::Remote(_) => CacheStats {
                entries: 0, // remote size is not tracked locally
                backend: "remote".to_string(),
            },
        }
    }
}

impl RemoteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, reqwest::Error> {
        let resp = self
            .client
            .get(format!("{}/get/{key}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.text().await?))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), reqwest::Error> {
        self.client
            .post(format!("{}/set/{key}?ttl={ttl_secs}", self.base_url))
            .bearer_auth(&self.token)
            .body(value.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), reqwest::Error> {
        self.client
            .post(format!("{}/del/{key}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    /// Number of entries currently held (0 for the remote backend).
    pub entries: usize,
    /// Name of the storage backend in use (`"memory"` or `"remote"`).
    pub backend: String,
}

/// Generate a stable cache key from arbitrary text.
pub fn cache_key(text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("k:{:x}", hasher.finish())
}
