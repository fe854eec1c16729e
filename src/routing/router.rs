//! Backend selection engine.
//!
//! [`ModelRouter`] scores every registered backend against a per-request
//! [`RouterConfig`] and picks the maximum. Scores start from a base of 100,
//! adjusted for capability-tier fit, then blended according to the request
//! priority, then penalised for latency-bound violations and low observed
//! reliability, and finally boosted for fresh, well-sampled telemetry.
//!
//! Ties break on higher `call_count`, then lower cost, then backend name,
//! so selection is fully deterministic for a given telemetry snapshot.
//! Every selection appends exactly one [`DecisionRecord`] to the store.

use crate::routing::{BackendProfile, Capability, RouterConfig};
use crate::telemetry::{
    BackendTelemetry, DecisionRecord, ScoredAlternative, TelemetryStore,
};
use crate::SubstrateError;
use chrono::{Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Scores closer than this are considered tied.
const SCORE_EPSILON: f64 = 1e-9;

/// Telemetry fresher than this window qualifies for the recency boost.
const RECENCY_WINDOW_HOURS: i64 = 24;

/// Minimum sample size before fresh telemetry earns the recency boost.
const RECENCY_MIN_CALLS: u64 = 10;

/// The outcome of a routing decision.
#[derive(Debug, Clone)]
pub struct RouteSelection {
    /// Winning backend name.
    pub selected: String,
    /// Winning score.
    pub score: f64,
    /// Reason tokens explaining the winning score.
    pub reasons: Vec<String>,
    /// Up to three runners-up with their scores.
    pub alternatives: Vec<RouteAlternative>,
}

/// A runner-up candidate.
#[derive(Debug, Clone)]
pub struct RouteAlternative {
    /// Backend name.
    pub backend: String,
    /// Final score (0 for ineligible candidates).
    pub score: f64,
    /// Dominant reason token.
    pub reason: String,
}

struct Candidate<'a> {
    profile: &'a BackendProfile,
    telemetry: BackendTelemetry,
    score: f64,
    reasons: Vec<String>,
    eligible: bool,
}

/// Telemetry-aware backend selector.
///
/// Thread-safe: the profile table is immutable and all mutable state lives
/// in the shared [`TelemetryStore`].
pub struct ModelRouter {
    profiles: Vec<BackendProfile>,
    telemetry: Arc<TelemetryStore>,
    default_backend: String,
}

impl ModelRouter {
    /// Create a router over a validated profile table.
    ///
    /// # Errors
    ///
    /// Returns `SubstrateError::Config` if the profile table fails
    /// validation (duplicate names, negative costs, zero latencies).
    pub fn new(
        profiles: Vec<BackendProfile>,
        telemetry: Arc<TelemetryStore>,
        default_backend: impl Into<String>,
    ) -> Result<Self, SubstrateError> {
        let errors = super::validate_profiles(&profiles);
        if !errors.is_empty() {
            return Err(SubstrateError::Config(errors.join("; ")));
        }
        Ok(Self {
            profiles,
            telemetry,
            default_backend: default_backend.into(),
        })
    }

    /// The static profile table.
    pub fn profiles(&self) -> &[BackendProfile] {
        &self.profiles
    }

    /// The shared telemetry store.
    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    /// Select a backend for `config`.
    ///
    /// An empty profile table yields the configured default backend rather
    /// than an error; a table where required capabilities rule out every
    /// backend is a configuration error and is surfaced to the caller.
    pub fn select(&self, config: &RouterConfig) -> Result<RouteSelection, SubstrateError> {
        if self.profiles.is_empty() {
            let selection = RouteSelection {
                selected: self.default_backend.clone(),
                score: 0.0,
                reasons: vec!["empty_backend_table".to_string()],
                alternatives: Vec::new(),
            };
            self.record(config, &selection);
            return Ok(selection);
        }

        let mut candidates: Vec<Candidate<'_>> = self
            .profiles
            .iter()
            .map(|profile| self.score_candidate(profile, config))
            .collect();

        if !candidates.iter().any(|c| c.eligible) {
            return Err(SubstrateError::Config(format!(
                "no backend satisfies required capabilities {:?}",
                config.required_capabilities
            )));
        }

        candidates.sort_by(|a, b| Self::rank(a, b));

        // Ineligible candidates sort last, so the winner is always eligible.
        let winner = &candidates[0];
        let selection = RouteSelection {
            selected: winner.profile.name.clone(),
            score: winner.score,
            reasons: winner.reasons.clone(),
            alternatives: candidates[1..]
                .iter()
                .take(3)
                .map(|c| RouteAlternative {
                    backend: c.profile.name.clone(),
                    score: c.score,
                    reason: c.reasons.first().cloned().unwrap_or_default(),
                })
                .collect(),
        };

        debug!(
            selected = %selection.selected,
            score = selection.score,
            task = config.task.as_str(),
            priority = config.priority.as_str(),
            "backend selected"
        );

        self.record(config, &selection);
        Ok(selection)
    }

    fn record(&self, config: &RouterConfig, selection: &RouteSelection) {
        self.telemetry.record_decision(DecisionRecord {
            ts: Utc::now(),
            config: config.clone(),
            selected: selection.selected.clone(),
            reasons: selection.reasons.clone(),
            score: selection.score,
            alternatives: selection
                .alternatives
                .iter()
                .map(|a| ScoredAlternative {
                    backend: a.backend.clone(),
                    score: a.score,
                    reason: a.reason.clone(),
                })
                .collect(),
        });
    }

    fn score_candidate<'a>(
        &self,
        profile: &'a BackendProfile,
        config: &RouterConfig,
    ) -> Candidate<'a> {
        let telemetry = self
            .telemetry
            .backend(&profile.name)
            .unwrap_or_else(|| BackendTelemetry::seed(profile));

        // Hard gate: a missing required capability disqualifies outright.
        for cap in &config.required_capabilities {
            if !profile.supports(*cap) {
                let token = match cap {
                    Capability::StructuredOutput => "missing_capability:structured_output",
                    Capability::Streaming => "missing_capability:streaming",
                };
                return Candidate {
                    profile,
                    telemetry,
                    score: 0.0,
                    reasons: vec![token.to_string()],
                    eligible: false,
                };
            }
        }

        let mut reasons = Vec::new();
        let mut base = 100.0;

        let required = config.task.required_tier();
        if profile.tier < required {
            base -= 30.0;
            reasons.push("below_required_tier".to_string());
        } else if profile.tier.index() > required.index() + 1 {
            base -= 10.0;
            reasons.push("tier_overkill".to_string());
        } else {
            reasons.push("tier_fit".to_string());
        }

        let cost = telemetry.cost_per_1k_tokens.max(1e-6);
        let latency = telemetry.avg_latency_ms.max(1.0);
        let tier_rank = f64::from(profile.tier.index() + 1);

        let mut score = match config.priority {
            super::RoutePriority::Cost => 0.3 * base + 0.7 * (100.0 / cost),
            super::RoutePriority::Speed => 0.3 * base + 0.7 * (10_000.0 / latency),
            super::RoutePriority::Quality => 0.3 * base + 0.7 * (tier_rank * 25.0),
            super::RoutePriority::Balanced => {
                0.2 * base
                    + 0.3 * (50.0 / cost)
                    + 0.3 * (5_000.0 / latency)
                    + 0.2 * (tier_rank * 15.0)
            }
        };
        reasons.push(format!("priority={}", config.priority.as_str()));

        if let Some(bound) = config.max_latency_ms {
            if telemetry.avg_latency_ms > bound as f64 {
                score -= 50.0;
                reasons.push("latency_above_bound".to_string());
            }
        }

        if telemetry.success_rate < 0.95 {
            score -= (1.0 - telemetry.success_rate) * 50.0;
            reasons.push("reliability_penalty".to_string());
        }

        let fresh = Utc::now() - telemetry.last_updated
            < ChronoDuration::hours(RECENCY_WINDOW_HOURS);
        if fresh && telemetry.call_count > RECENCY_MIN_CALLS {
            score += 5.0;
            reasons.push("recency_boost".to_string());
        }

        Candidate {
            profile,
            telemetry,
            score: score.max(0.0),
            reasons,
            eligible: true,
        }
    }

    /// Deterministic candidate ordering: eligibility, score, `call_count`
    /// (higher first), cost (lower first), name.
    fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        b.eligible
            .cmp(&a.eligible)
            .then_with(|| {
                if (a.score - b.score).abs() < SCORE_EPSILON {
                    Ordering::Equal
                } else {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(Ordering::Equal)
                }
            })
            .then_with(|| b.telemetry.call_count.cmp(&a.telemetry.call_count))
            .then_with(|| {
                a.profile
                    .cost_per_1k_tokens
                    .partial_cmp(&b.profile.cost_per_1k_tokens)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.profile.name.cmp(&b.profile.name))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
