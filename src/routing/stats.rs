//! Read-only projections of the telemetry store.
//!
//! [`StatsProjector`] turns a [`TelemetrySnapshot`] into the report shape
//! served by `GET /model-router/stats`. It never mutates anything; the
//! numbers are whatever the snapshot said at read time.

use crate::telemetry::TelemetrySnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

fn default_assumed_tokens() -> u64 {
    100
}

/// Projects router telemetry into a visualization-friendly report.
#[derive(Debug, Clone, Copy)]
pub struct StatsProjector {
    /// Tokens assumed per call when estimating spend. The true token count
    /// is not recorded per call, so cost analysis is an estimate scaled by
    /// this constant.
    pub assumed_tokens_per_call: u64,
}

impl Default for StatsProjector {
    fn default() -> Self {
        Self {
            assumed_tokens_per_call: default_assumed_tokens(),
        }
    }
}

/// Top-line counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    /// Decisions currently retained in the log.
    pub total_decisions: usize,
    /// Backends with telemetry entries.
    pub backends_tracked: usize,
    /// Total calls observed across all backends.
    pub total_calls: u64,
}

/// Per-backend performance numbers.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPerformance {
    /// Running mean latency, ms.
    pub avg_latency_ms: f64,
    /// Latency of the most recent call, ms.
    pub last_latency_ms: u64,
    /// Running success rate.
    pub success_rate: f64,
    /// Observed call count.
    pub call_count: u64,
}

/// Estimated spend per backend.
#[derive(Debug, Clone, Serialize)]
pub struct CostAnalysis {
    /// Backend name → estimated USD spend.
    pub estimated_spend_usd: BTreeMap<String, f64>,
    /// Sum across backends.
    pub total_usd: f64,
    /// The tokens-per-call constant the estimate assumed.
    pub assumed_tokens_per_call: u64,
}

/// One recent decision, condensed for timelines.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    /// Decision timestamp.
    pub ts: DateTime<Utc>,
    /// Task kind label.
    pub task: String,
    /// Optimisation priority label.
    pub priority: String,
    /// Selected backend.
    pub selected: String,
    /// Winning score.
    pub score: f64,
}

/// One row of the model comparison matrix.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRow {
    /// Backend name.
    pub name: String,
    /// Tier label.
    pub tier: String,
    /// List price per 1 000 tokens.
    pub cost_per_1k_tokens: f64,
    /// Running mean latency, ms.
    pub avg_latency_ms: f64,
    /// Running success rate.
    pub success_rate: f64,
    /// Observed call count.
    pub call_count: u64,
}

/// The full stats report.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsReport {
    /// Top-line counters.
    pub summary: StatsSummary,
    /// Backend name → times selected (within the retained log).
    pub model_usage: BTreeMap<String, u64>,
    /// Task label → decision count.
    pub task_distribution: BTreeMap<String, u64>,
    /// Priority label → decision count.
    pub priority_distribution: BTreeMap<String, u64>,
    /// Backend name → performance numbers.
    pub performance: BTreeMap<String, BackendPerformance>,
    /// Spend estimates.
    pub cost_analysis: CostAnalysis,
    /// The last 10 decisions, oldest first.
    pub timeline: Vec<TimelineEntry>,
    /// All tracked backends side by side, name order.
    pub comparison: Vec<ComparisonRow>,
}

impl StatsProjector {
    /// Build a report from a snapshot.
    pub fn project(&self, snapshot: &TelemetrySnapshot) -> RouterStatsReport {
        let mut model_usage: BTreeMap<String, u64> = BTreeMap::new();
        let mut task_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut priority_distribution: BTreeMap<String, u64> = BTreeMap::new();

        for decision in &snapshot.decisions {
            *model_usage.entry(decision.selected.clone()).or_default() += 1;
            *task_distribution
                .entry(decision.config.task.as_str().to_string())
                .or_default() += 1;
            *priority_distribution
                .entry(decision.config.priority.as_str().to_string())
                .or_default() += 1;
        }

        let mut performance = BTreeMap::new();
        let mut estimated_spend_usd = BTreeMap::new();
        let mut comparison = Vec::new();
        let mut total_calls = 0u64;
        let mut total_usd = 0.0;

        let mut names: Vec<&String> = snapshot.backends.keys().collect();
        names.sort();
        for name in names {
            let t = &snapshot.backends[name];
            total_calls += t.call_count;
            performance.insert(
                name.clone(),
                BackendPerformance {
                    avg_latency_ms: t.avg_latency_ms,
                    last_latency_ms: t.last_latency_ms,
                    success_rate: t.success_rate,
                    call_count: t.call_count,
                },
            );
            let spend = t.cost_per_1k_tokens * t.call_count as f64
                * self.assumed_tokens_per_call as f64
                / 1000.0;
            total_usd += spend;
            estimated_spend_usd.insert(name.clone(), spend);
            comparison.push(ComparisonRow {
                name: name.clone(),
                tier: format!("{:?}", t.tier).to_lowercase(),
                cost_per_1k_tokens: t.cost_per_1k_tokens,
                avg_latency_ms: t.avg_latency_ms,
                success_rate: t.success_rate,
                call_count: t.call_count,
            });
        }

        let timeline = snapshot
            .decisions
            .iter()
            .rev()
            .take(10)
            .rev()
            .map(|d| TimelineEntry {
                ts: d.ts,
                task: d.config.task.as_str().to_string(),
                priority: d.config.priority.as_str().to_string(),
                selected: d.selected.clone(),
                score: d.score,
            })
            .collect();

        RouterStatsReport {
            summary: StatsSummary {
                total_decisions: snapshot.decisions.len(),
                backends_tracked: snapshot.backends.len(),
                total_calls,
            },
            model_usage,
            task_distribution,
            priority_distribution,
            performance,
            cost_analysis: CostAnalysis {
                estimated_spend_usd,
                total_usd,
                assumed_tokens_per_call: self.assumed_tokens_per_call,
            },
            timeline,
            comparison,
        }
    }
}
