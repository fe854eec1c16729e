//! Prometheus metrics for the substrate.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. Every helper is a no-op
//! if `init_metrics` was never called, so library consumers who do not
//! care about Prometheus lose observability, not correctness.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `substrate_requests_total` | Counter | `component` |
//! | `substrate_errors_total` | Counter | `component`, `err_type` |
//! | `substrate_cache_hits_total` | Counter | — |
//! | `substrate_llm_latency_seconds` | Histogram | `backend` |

use crate::SubstrateError;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

/// All Prometheus metrics, bundled so they can live in one [`OnceLock`].
pub struct Metrics {
    /// Registry owning all metric descriptors.
    pub registry: Registry,
    /// Requests processed, by component.
    pub requests_total: CounterVec,
    /// Errors, by component and error type.
    pub errors_total: CounterVec,
    /// Moderation cache hits.
    pub cache_hits_total: IntCounter,
    /// Model call latency, by backend.
    pub llm_latency: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialise all metrics against a private registry.
///
/// Calling it a second time is a no-op returning `Ok(())`.
///
/// # Errors
///
/// Returns [`SubstrateError::Config`] if metric construction or
/// registration fails.
pub fn init_metrics() -> Result<(), SubstrateError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new("substrate_requests_total", "Requests processed"),
        &["component"],
    )
    .map_err(|e| SubstrateError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(|e| SubstrateError::Config(format!("metrics registration failed: {e}")))?;

    let errors_total = CounterVec::new(
        Opts::new("substrate_errors_total", "Errors by component and type"),
        &["component", "err_type"],
    )
    .map_err(|e| SubstrateError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(errors_total.clone()))
        .map_err(|e| SubstrateError::Config(format!("metrics registration failed: {e}")))?;

    let cache_hits_total = IntCounter::new("substrate_cache_hits_total", "Moderation cache hits")
        .map_err(|e| SubstrateError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(cache_hits_total.clone()))
        .map_err(|e| SubstrateError::Config(format!("metrics registration failed: {e}")))?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new("substrate_llm_latency_seconds", "Model call latency"),
        &["backend"],
    )
    .map_err(|e| SubstrateError::Config(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(llm_latency.clone()))
        .map_err(|e| SubstrateError::Config(format!("metrics registration failed: {e}")))?;

    // If another thread raced us the first initialisation wins; both
    // produce identical descriptors.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        errors_total,
        cache_hits_total,
        llm_latency,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Count one processed request for a component. No-op before init.
pub fn inc_request(component: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[component]) {
            c.inc();
        }
    }
}

/// Count one error for a component and error type. No-op before init.
pub fn inc_error(component: &str, err_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .errors_total
            .get_metric_with_label_values(&[component, err_type])
        {
            c.inc();
        }
    }
}

/// Count one moderation cache hit. No-op before init.
pub fn inc_cache_hit() {
    if let Some(m) = metrics() {
        m.cache_hits_total.inc();
    }
}

/// Record one model call latency. No-op before init.
pub fn record_llm_latency(backend: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.llm_latency.get_metric_with_label_values(&[backend]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Gather and encode all metrics in the Prometheus text format.
///
/// Returns an empty string before init or on encoding failure.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_do_not_panic_before_or_after_init() {
        inc_request("moderation");
        inc_error("map", "retryable");
        inc_cache_hit();
        record_llm_latency("some-backend", Duration::from_millis(42));
        let _ = init_metrics();
        inc_request("moderation");
        inc_error("map", "retryable");
        inc_cache_hit();
        record_llm_latency("some-backend", Duration::from_millis(42));
    }

    #[test]
    fn test_gather_metrics_is_valid_utf8() {
        let _ = init_metrics();
        inc_request("gather-probe");
        let text = gather_metrics();
        assert!(std::str::from_utf8(text.as_bytes()).is_ok());
        assert!(text.contains("substrate_requests_total"));
    }
}
