//! Model routing
//!
//! The [`ModelRouter`] scores every registered backend against a per-request
//! [`RouterConfig`] using the static [`BackendProfile`] table and the live
//! telemetry kept by [`crate::telemetry::TelemetryStore`], then records the
//! decision so the telemetry loop closes: observed call outcomes shift
//! future selections.

pub mod router;
pub mod stats;

pub use router::{ModelRouter, RouteAlternative, RouteSelection};
pub use stats::{RouterStatsReport, StatsProjector};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ordinal capability class of a backend: `Basic < Standard < Advanced <
/// Reasoning`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    /// Cheap classification-grade models.
    #[default]
    Basic,
    /// General-purpose workhorses.
    Standard,
    /// High-quality generation.
    Advanced,
    /// Extended-reasoning models.
    Reasoning,
}

impl CapabilityTier {
    /// Zero-based ordinal index.
    pub fn index(self) -> u8 {
        match self {
            Self::Basic => 0,
            Self::Standard => 1,
            Self::Advanced => 2,
            Self::Reasoning => 3,
        }
    }
}

/// The kind of work a request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Label assignment (moderation, intent detection).
    Classification,
    /// Condensing text.
    Summarization,
    /// Multi-step problem solving.
    Reasoning,
    /// Pulling structured entities out of text.
    Extraction,
    /// Open-ended conversation.
    Chat,
    /// Anything else.
    #[default]
    Other,
}

impl TaskKind {
    /// Minimum tier that serves this task well.
    pub fn required_tier(self) -> CapabilityTier {
        match self {
            Self::Classification => CapabilityTier::Basic,
            Self::Summarization | Self::Extraction | Self::Chat | Self::Other => {
                CapabilityTier::Standard
            }
            Self::Reasoning => CapabilityTier::Reasoning,
        }
    }

    /// Stable label for distributions and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Summarization => "summarization",
            Self::Reasoning => "reasoning",
            Self::Extraction => "extraction",
            Self::Chat => "chat",
            Self::Other => "other",
        }
    }
}

/// What the caller wants optimised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutePriority {
    /// Minimise spend.
    Cost,
    /// Maximise output quality.
    Quality,
    /// Minimise latency.
    Speed,
    /// Weighted blend of all three.
    #[default]
    Balanced,
}

impl RoutePriority {
    /// Stable label for distributions and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Quality => "quality",
            Self::Speed => "speed",
            Self::Balanced => "balanced",
        }
    }
}

/// Caller's estimate of request difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Trivial.
    Low,
    /// Typical.
    #[default]
    Medium,
    /// Hard.
    High,
}

/// A hard capability requirement a backend must support to be eligible.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Schema-constrained JSON output.
    StructuredOutput,
    /// Incremental token streaming.
    Streaming,
}

/// Static descriptor of a backend. Loaded at init; immutable in-process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Backend name, unique within the table.
    pub name: String,
    /// Capability tier.
    pub tier: CapabilityTier,
    /// List price per 1 000 tokens, USD.
    pub cost_per_1k_tokens: f64,
    /// Vendor-stated worst-case latency, used to seed telemetry.
    pub nominal_max_latency_ms: u64,
    /// Whether the backend honours output schemas.
    #[serde(default)]
    pub supports_structured_output: bool,
    /// Whether the backend can stream tokens.
    #[serde(default)]
    pub supports_streaming: bool,
}

impl BackendProfile {
    /// Whether this backend satisfies a capability requirement.
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::StructuredOutput => self.supports_structured_output,
            Capability::Streaming => self.supports_streaming,
        }
    }
}

/// Per-request routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    /// Kind of work.
    #[serde(default)]
    pub task: TaskKind,
    /// Optimisation priority.
    #[serde(default)]
    pub priority: RoutePriority,
    /// Estimated difficulty.
    #[serde(default)]
    pub complexity: Complexity,
    /// Hard latency bound; backends whose observed average exceeds it are
    /// heavily penalised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    /// Capabilities the selected backend must support.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<Capability>,
}

impl RouterConfig {
    /// Config for a task with default priority and complexity.
    pub fn for_task(task: TaskKind) -> Self {
        Self {
            task,
            ..Self::default()
        }
    }

    /// Set the optimisation priority.
    pub fn with_priority(mut self, priority: RoutePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the difficulty estimate.
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set the latency bound.
    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    /// Require a capability.
    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }
}

/// Validate a backend profile table, returning one human-readable error per
/// violated constraint.
pub fn validate_profiles(profiles: &[BackendProfile]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();

    for p in profiles {
        if p.name.trim().is_empty() {
            errors.push("backend name must be non-empty".to_string());
        }
        if !seen.insert(p.name.clone()) {
            errors.push(format!("duplicate backend name '{}'", p.name));
        }
        if p.cost_per_1k_tokens < 0.0 {
            errors.push(format!(
                "backend '{}': cost_per_1k_tokens must be >= 0, got {}",
                p.name, p.cost_per_1k_tokens
            ));
        }
        if p.nominal_max_latency_ms == 0 {
            errors.push(format!(
                "backend '{}': nominal_max_latency_ms must be > 0",
                p.name
            ));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_is_basic_to_reasoning() {
        assert!(CapabilityTier::Basic < CapabilityTier::Standard);
        assert!(CapabilityTier::Standard < CapabilityTier::Advanced);
        assert!(CapabilityTier::Advanced < CapabilityTier::Reasoning);
    }

    #[test]
    fn test_tier_index_matches_ordering() {
        assert_eq!(CapabilityTier::Basic.index(), 0);
        assert_eq!(CapabilityTier::Reasoning.index(), 3);
    }

    #[test]
    fn test_required_tier_mapping() {
        assert_eq!(
            TaskKind::Classification.required_tier(),
            CapabilityTier::Basic
        );
        assert_eq!(
            TaskKind::Summarization.required_tier(),
            CapabilityTier::Standard
        );
        assert_eq!(TaskKind::Extraction.required_tier(), CapabilityTier::Standard);
        assert_eq!(TaskKind::Chat.required_tier(), CapabilityTier::Standard);
        assert_eq!(TaskKind::Other.required_tier(), CapabilityTier::Standard);
        assert_eq!(TaskKind::Reasoning.required_tier(), CapabilityTier::Reasoning);
    }

    #[test]
    fn test_profile_capability_checks() {
        let p = BackendProfile {
            name: "m".into(),
            tier: CapabilityTier::Standard,
            cost_per_1k_tokens: 0.01,
            nominal_max_latency_ms: 2000,
            supports_structured_output: true,
            supports_streaming: false,
        };
        assert!(p.supports(Capability::StructuredOutput));
        assert!(!p.supports(Capability::Streaming));
    }

    #[test]
    fn test_router_config_builder() {
        let cfg = RouterConfig::for_task(TaskKind::Classification)
            .with_priority(RoutePriority::Speed)
            .with_complexity(Complexity::Low)
            .with_max_latency_ms(2000)
            .require(Capability::StructuredOutput);
        assert_eq!(cfg.task, TaskKind::Classification);
        assert_eq!(cfg.max_latency_ms, Some(2000));
        assert!(cfg.required_capabilities.contains(&Capability::StructuredOutput));
    }

    #[test]
    fn test_router_config_deserialises_with_defaults() {
        let cfg: RouterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.task, TaskKind::Other);
        assert_eq!(cfg.priority, RoutePriority::Balanced);
        assert!(cfg.required_capabilities.is_empty());
    }

    #[test]
    fn test_validate_profiles_flags_duplicates_and_bad_values() {
        let profiles = vec![
            BackendProfile {
                name: "a".into(),
                tier: CapabilityTier::Basic,
                cost_per_1k_tokens: -1.0,
                nominal_max_latency_ms: 0,
                supports_structured_output: false,
                supports_streaming: false,
            },
            BackendProfile {
                name: "a".into(),
                tier: CapabilityTier::Basic,
                cost_per_1k_tokens: 0.01,
                nominal_max_latency_ms: 1000,
                supports_structured_output: false,
                supports_streaming: false,
            },
        ];
        let errors = validate_profiles(&profiles);
        assert!(errors.iter().any(|e| e.contains("duplicate")));
        assert!(errors.iter().any(|e| e.contains("cost_per_1k_tokens")));
        assert!(errors.iter().any(|e| e.contains("nominal_max_latency_ms")));
    }

    #[test]
    fn test_validate_profiles_clean_table_passes() {
        let profiles = vec![BackendProfile {
            name: "good".into(),
            tier: CapabilityTier::Standard,
            cost_per_1k_tokens: 0.02,
            nominal_max_latency_ms: 1500,
            supports_structured_output: true,
            supports_streaming: true,
        }];
        assert!(validate_profiles(&profiles).is_empty());
    }
}
