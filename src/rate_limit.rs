//! Rate Limiting
//!
//! Sliding-window request counter per client identifier, stored in the
//! process-wide [`CacheAdapter`] so the window survives whichever backend
//! (memory or remote) the deployment installed.
//!
//! Fail-open by construction: the cache contract downgrades every storage
//! failure to a miss or no-op, so a stalled store yields fresh windows and
//! traffic keeps flowing instead of the limiter DoS-ing its own service.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_substrate::{CacheAdapter, RateLimiter, RateLimitPolicy};
//! # #[tokio::main]
//! # async fn main() {
//! let cache = Arc::new(CacheAdapter::new_memory());
//! let limiter = RateLimiter::new(cache, RateLimitPolicy::from_env());
//!
//! let decision = limiter.check("203.0.113.7").await;
//! if !decision.allowed {
//!     // respond 429 with decision.reset_at_ms
//! }
//! # }
//! ```

use crate::cache::CacheAdapter;
use crate::now_ms;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Environment variable overriding the per-window request budget.
pub const RATE_LIMIT_MAX_REQUESTS: &str = "RATE_LIMIT_MAX_REQUESTS";
/// Environment variable overriding the window length in seconds.
pub const RATE_LIMIT_WINDOW_SECONDS: &str = "RATE_LIMIT_WINDOW_SECONDS";

fn default_max_requests() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60
}

/// Per-client rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum requests allowed per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitPolicy {
    /// Read the policy from `RATE_LIMIT_MAX_REQUESTS` /
    /// `RATE_LIMIT_WINDOW_SECONDS`, falling back to 100 requests / 60 s.
    /// Unparseable values fall back to the defaults with a warning.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Ok(raw) = std::env::var(RATE_LIMIT_MAX_REQUESTS) {
            match raw.parse() {
                Ok(v) => policy.max_requests = v,
                Err(_) => warn!(value = %raw, "ignoring unparseable {RATE_LIMIT_MAX_REQUESTS}"),
            }
        }
        if let Ok(raw) = std::env::var(RATE_LIMIT_WINDOW_SECONDS) {
            match raw.parse() {
                Ok(v) => policy.window_secs = v,
                Err(_) => warn!(value = %raw, "ignoring unparseable {RATE_LIMIT_WINDOW_SECONDS}"),
            }
        }
        policy
    }
}

/// Stored window state for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowEntry {
    count: u32,
    reset_at_ms: u64,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The window budget the decision was made against.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Epoch milliseconds at which the window resets.
    pub reset_at_ms: u64,
}

impl RateLimitDecision {
    /// Seconds until the window resets, rounded up. The `Retry-After`
    /// header value for blocked responses.
    pub fn retry_after_secs(&self) -> u64 {
        let now = now_ms();
        if self.reset_at_ms <= now {
            return 0;
        }
        (self.reset_at_ms - now).div_ceil(1000)
    }
}

/// Sliding-window rate limiter over the shared cache adapter.
pub struct RateLimiter {
    cache: Arc<CacheAdapter>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    /// Create a limiter over the given cache with the given policy.
    pub fn new(cache: Arc<CacheAdapter>, policy: RateLimitPolicy) -> Self {
        Self { cache, policy }
    }

    /// The configured policy.
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Check whether `client_id` may make a request under the configured
    /// policy, consuming one slot when allowed.
    pub async fn check(&self, client_id: &str) -> RateLimitDecision {
        self.check_with(client_id, &self.policy).await
    }

    /// Check with an explicit policy (per-route overrides).
    pub async fn check_with(
        &self,
        client_id: &str,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        let key = format!("ratelimit:{client_id}:{}", policy.window_secs);
        let now = now_ms();
        let window_ms = policy.window_secs * 1000;

        let entry = match self.cache.get(&key).await {
            Some(raw) => match serde_json::from_str::<WindowEntry>(&raw) {
                Ok(e) if now < e.reset_at_ms => Some(e),
                Ok(_) => None, // window elapsed, recreate
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupt rate limit entry, recreating");
                    None
                }
            },
            None => None,
        };

        match entry {
            None => {
                let fresh = WindowEntry {
                    count: 1,
                    reset_at_ms: now + window_ms,
                };
                self.write_entry(&key, &fresh, policy.window_secs).await;
                debug!(client_id = client_id, count = 1, "rate limit window opened");
                RateLimitDecision {
                    allowed: policy.max_requests > 0,
                    limit: policy.max_requests,
                    remaining: policy.max_requests.saturating_sub(1),
                    reset_at_ms: fresh.reset_at_ms,
                }
            }
            Some(entry) if entry.count >= policy.max_requests => {
                warn!(
                    client_id = client_id,
                    count = entry.count,
                    limit = policy.max_requests,
                    "rate limit exceeded"
                );
                RateLimitDecision {
                    allowed: false,
                    limit: policy.max_requests,
                    remaining: 0,
                    reset_at_ms: entry.reset_at_ms,
                }
            }
            Some(mut entry) => {
                entry.count += 1;
                let ttl = (entry.reset_at_ms - now).div_ceil(1000);
                self.write_entry(&key, &entry, ttl).await;
                debug!(
                    client_id = client_id,
                    count = entry.count,
                    limit = policy.max_requests,
                    "rate limit check passed"
                );
                RateLimitDecision {
                    allowed: true,
                    limit: policy.max_requests,
                    remaining: policy.max_requests - entry.count,
                    reset_at_ms: entry.reset_at_ms,
                }
            }
        }
    }

    async fn write_entry(&self, key: &str, entry: &WindowEntry, ttl_secs: u64) {
        match serde_json::to_string(entry) {
            Ok(raw) => self.cache.set(key, raw, ttl_secs.max(1)).await,
            Err(e) => warn!(key = %key, error = %e, "failed to encode rate limit entry"),
        }
    }
}

/// Derive a namespaced client identifier from request metadata.
///
/// First non-empty of: first `x-forwarded-for` token, `x-real-ip`, the
/// transport peer address, or the literal `"unknown"`.
pub fn derive_client_id(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer_addr: Option<&str>,
) -> String {
    let from_forwarded = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let id = from_forwarded
        .or_else(|| real_ip.map(str::trim).filter(|s| !s.is_empty()))
        .or_else(|| peer_addr.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or("unknown");

    format!("client:{id}")
}
