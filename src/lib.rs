//! # llm-substrate
//!
//! A request-orchestration substrate for language-model workloads over Tokio.
//!
//! ## Architecture
//!
//! Three coupled subsystems around a shared telemetry loop:
//! ```text
//! Job ──┬── unary ────► ModerationService ─► RateLimiter → Cache → Router → LlmClient
//!       │                                                            │
//!       └── document ─► Chunker ─► PipelineExecutor ─► Reducer ──────┤
//!                         (bounded pool, retry, checkpoint)          ▼
//!                                                          TelemetryStore (persistent)
//! ```
//!
//! Every model call passes through the [`routing::ModelRouter`], so each call
//! outcome feeds the [`telemetry::TelemetryStore`] that future routing
//! decisions are scored against.

use thiserror::Error;

pub mod cache;
pub mod chunker;
pub mod client;
pub mod metrics;
pub mod moderation;
pub mod pipeline;
pub mod rate_limit;
pub mod reduce;
pub mod routing;
pub mod schema;
pub mod telemetry;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports
pub use cache::{cache_key, CacheAdapter, CacheStats};
pub use chunker::{chunk, Chunk};
pub use client::{EchoClient, InvocationRequest, LlmClient};
pub use moderation::{ModerationResult, ModerationService, Severity};
pub use pipeline::{ChunkFailure, MapPolicy, PipelineExecutor, ProcessingState};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use routing::{BackendProfile, CapabilityTier, ModelRouter, RouterConfig};
pub use telemetry::TelemetryStore;

/// Substrate-wide error taxonomy.
///
/// Internal layers convert transport specifics into one of these variants;
/// callers decide retry/fallback behaviour per variant rather than per
/// underlying cause.
#[derive(Error, Debug)]
pub enum SubstrateError {
    /// Transient backend failure: timeout, 5xx, provider rate limit.
    /// Eligible for retry with backoff.
    #[error("backend error: {0}")]
    Backend(String),

    /// Structured output did not match the declared schema.
    #[error("schema validation failed: {0}")]
    Schema(String),

    /// Cache transport failure. Always downgraded to a miss or no-op
    /// before reaching a caller.
    #[error("cache error: {0}")]
    Cache(String),

    /// Checkpoint could not be written or read.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid configuration, including routing requests no backend can
    /// satisfy. Never silently worked around.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed caller input. Not retried.
    #[error("invalid input: {0}")]
    Input(String),

    /// The operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
}

impl SubstrateError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Schema(_))
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
