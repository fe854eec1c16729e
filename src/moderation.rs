//! Moderation serving path.
//!
//! One request flows: rate limit → cache probe → backend selection →
//! model call → telemetry + rolling metrics → alert routing → cache fill.
//!
//! Failure policy is deliberately asymmetric:
//! - infrastructure failures (cache, limiter storage) fail open;
//! - moderation failures fail safe: the caller gets a `safe`/unflagged
//!   result carrying the error summary in `reasoning`, so a broken
//!   moderator never silently blocks traffic.
//!
//! Critical results are never cached; they must be re-evaluated on every
//! sighting.

use crate::cache::{cache_key, CacheAdapter, CacheStats};
use crate::client::{InvocationRequest, LlmClient};
use crate::metrics;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::routing::{Capability, Complexity, ModelRouter, RoutePriority, RouterConfig, TaskKind};
use crate::schema::{FieldKind, OutputSchema, SchemaValidator, StrictValidator};
use crate::SubstrateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Latency bound requested from the router for moderation calls; doubles
/// as the per-call deadline.
const MODERATION_DEADLINE_MS: u64 = 2000;

/// TTL for cached moderation results.
const CACHE_TTL_SECS: u64 = 3600;

/// How severe the flagged content is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Nothing objectionable.
    #[default]
    Safe,
    /// Borderline; surface to a human.
    Warning,
    /// Policy violation; act immediately.
    Critical,
}

impl Severity {
    /// Stable label for histograms.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Content-policy category labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationCategory {
    /// Targeted abuse of a person.
    Harassment,
    /// Attacks on protected classes.
    HateSpeech,
    /// Threats or glorification of violence.
    Violence,
    /// Self-harm content.
    SelfHarm,
    /// Sexual content.
    Sexual,
    /// Bulk or commercial spam.
    Spam,
    /// Demonstrably false claims presented as fact.
    Misinformation,
}

impl ModerationCategory {
    /// All category labels, for schema enumeration.
    pub const ALL: [&'static str; 7] = [
        "harassment",
        "hate_speech",
        "violence",
        "self_harm",
        "sexual",
        "spam",
        "misinformation",
    ];

    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "harassment" => Some(Self::Harassment),
            "hate_speech" => Some(Self::HateSpeech),
            "violence" => Some(Self::Violence),
            "self_harm" => Some(Self::SelfHarm),
            "sexual" => Some(Self::Sexual),
            "spam" => Some(Self::Spam),
            "misinformation" => Some(Self::Misinformation),
            _ => None,
        }
    }
}

/// The typed moderation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    /// Detected language, English name.
    pub language: String,
    /// Two-letter language code, lowercase.
    pub language_code: String,
    /// Verdict severity.
    pub severity: Severity,
    /// Matched categories, at most three.
    #[serde(default)]
    pub categories: Vec<ModerationCategory>,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Risk score in `[0, 100]`.
    pub risk_score: u8,
    /// Whether the message should be flagged.
    pub flagged: bool,
    /// Model reasoning, or the error summary on degraded paths.
    pub reasoning: String,
}

impl ModerationResult {
    /// Enforce the structural invariants: `critical` implies flagged,
    /// `safe` implies no categories, bounded numerics, two-letter code.
    pub fn normalized(mut self) -> Self {
        if self.severity == Severity::Critical {
            self.flagged = true;
        }
        if self.severity == Severity::Safe {
            self.categories.clear();
        }
        self.categories.truncate(3);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.risk_score = self.risk_score.min(100);
        self.language_code = self
            .language_code
            .trim()
            .to_lowercase()
            .chars()
            .take(2)
            .collect();
        if self.language_code.len() < 2 {
            self.language_code = "xx".into();
        }
        self
    }

    /// The fail-safe verdict: a broken moderator must not block traffic.
    pub fn conservative_default(error_summary: &str) -> Self {
        Self {
            language: "unknown".into(),
            language_code: "xx".into(),
            severity: Severity::Safe,
            categories: Vec::new(),
            confidence: 0.0,
            risk_score: 0,
            flagged: false,
            reasoning: format!("error: {error_summary}"),
        }
    }

    fn from_validated(value: serde_json::Value) -> Result<Self, SubstrateError> {
        #[derive(Deserialize)]
        struct Raw {
            language: String,
            language_code: String,
            severity: Severity,
            #[serde(default)]
            categories: Vec<String>,
            confidence: f64,
            risk_score: i64,
            flagged: bool,
            #[serde(default)]
            reasoning: String,
        }
        let raw: Raw = serde_json::from_value(value)
            .map_err(|e| SubstrateError::Schema(format!("moderation shape: {e}")))?;
        Ok(Self {
            language: raw.language,
            language_code: raw.language_code,
            severity: raw.severity,
            categories: raw
                .categories
                .iter()
                .filter_map(|c| ModerationCategory::parse(c))
                .collect(),
            confidence: raw.confidence,
            risk_score: raw.risk_score.clamp(0, 100) as u8,
            flagged: raw.flagged,
            reasoning: raw.reasoning,
        }
        .normalized())
    }
}

/// The schema every moderation call declares.
pub fn moderation_schema() -> OutputSchema {
    OutputSchema::new("moderation")
        .field("language", FieldKind::String)
        .field("language_code", FieldKind::String)
        .field(
            "severity",
            FieldKind::Enum {
                variants: vec!["safe".into(), "warning".into(), "critical".into()],
            },
        )
        .field("categories", FieldKind::StringArray { max_len: Some(3) })
        .field("confidence", FieldKind::Number)
        .field("risk_score", FieldKind::Integer)
        .field("flagged", FieldKind::Boolean)
        .optional_field("reasoning", FieldKind::String)
}

/// Last-resort parse when the model repeatedly fails schema validation:
/// a keyword scan over the raw output.
fn hand_parse(raw: &str) -> ModerationResult {
    let lowered = raw.to_lowercase();
    let severity = if lowered.contains("critical") {
        Severity::Critical
    } else if lowered.contains("warning") || lowered.contains("flag") {
        Severity::Warning
    } else {
        Severity::Safe
    };
    ModerationResult {
        language: "unknown".into(),
        language_code: "xx".into(),
        severity,
        categories: Vec::new(),
        confidence: 0.2,
        risk_score: match severity {
            Severity::Critical => 90,
            Severity::Warning => 50,
            Severity::Safe => 0,
        },
        flagged: severity != Severity::Safe,
        reasoning: "degraded keyword parse of malformed model output".into(),
    }
    .normalized()
}

// ── Alerts ─────────────────────────────────────────────────────────────

/// A routed alert for flagged content.
#[derive(Debug, Clone, Serialize)]
pub struct ModerationAlert {
    /// When the verdict was produced.
    pub ts: DateTime<Utc>,
    /// Verdict severity.
    pub severity: Severity,
    /// Matched categories.
    pub categories: Vec<ModerationCategory>,
    /// Risk score.
    pub risk_score: u8,
    /// Language code of the offending message.
    pub language_code: String,
    /// Rate-limit client id of the sender.
    pub client_id: String,
    /// Model reasoning.
    pub reasoning: String,
}

/// Destination for moderation alerts. Pluggable; the default logs to
/// stderr.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Delivery failures are the sink's problem;
    /// serving never blocks on them.
    async fn publish(&self, alert: &ModerationAlert);
}

/// Default sink: one JSON line per alert on stderr.
pub struct StderrAlertSink;

#[async_trait]
impl AlertSink for StderrAlertSink {
    async fn publish(&self, alert: &ModerationAlert) {
        match serde_json::to_string(alert) {
            Ok(line) => eprintln!("MODERATION-ALERT {line}"),
            Err(e) => warn!(error = %e, "alert serialisation failed"),
        }
    }
}

// ── Rolling metrics ────────────────────────────────────────────────────

/// Incrementally maintained service aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollingMetrics {
    /// Requests that reached the verdict stage (cached or live).
    pub total_requests: u64,
    /// Verdicts with `flagged == true`.
    pub flagged: u64,
    /// Cache hits served.
    pub cache_hits: u64,
    /// Verdict counts by severity label.
    pub severity: BTreeMap<String, u64>,
    /// Verdict counts by language code.
    pub languages: BTreeMap<String, u64>,
    /// Running mean of live-call latency, ms.
    pub avg_latency_ms: f64,
    /// Number of live calls folded into `avg_latency_ms`.
    pub live_calls: u64,
    /// Running mean risk score.
    pub avg_risk_score: f64,
}

impl RollingMetrics {
    fn record(&mut self, result: &ModerationResult, latency: Option<Duration>) {
        self.total_requests += 1;
        if result.flagged {
            self.flagged += 1;
        }
        *self
            .severity
            .entry(result.severity.as_str().to_string())
            .or_default() += 1;
        *self
            .languages
            .entry(result.language_code.clone())
            .or_default() += 1;

        let n = self.total_requests as f64;
        self.avg_risk_score =
            (self.avg_risk_score * (n - 1.0) + f64::from(result.risk_score)) / n;

        if let Some(latency) = latency {
            self.live_calls += 1;
            let m = self.live_calls as f64;
            self.avg_latency_ms =
                (self.avg_latency_ms * (m - 1.0) + latency.as_millis() as f64) / m;
        }
    }
}

// ── Request / response shapes ──────────────────────────────────────────

/// One moderation request.
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationRequest {
    /// Message to evaluate.
    pub message: String,
    /// BCP-47-ish locale hint from the caller.
    #[serde(default)]
    pub locale: Option<String>,
    /// Rate-limit client id (derived at the transport layer).
    #[serde(default)]
    pub client_id: String,
}

/// A completed verdict plus serving metadata.
#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    /// The verdict.
    pub result: ModerationResult,
    /// Whether it came from cache.
    pub cached: bool,
    /// Which backend produced it (None for cache hits).
    pub backend: Option<String>,
}

/// What the serving path produced for a request.
#[derive(Debug)]
pub enum ServeOutcome {
    /// A verdict, possibly cached, possibly the fail-safe default.
    Completed(ModerationOutcome),
    /// The client is over budget; includes everything a 429 needs.
    RateLimited(RateLimitDecision),
}

/// An in-flight streaming moderation call.
pub struct ModerationStream {
    /// Incremental structured-output deltas.
    pub deltas: mpsc::Receiver<String>,
    /// The backend serving the stream.
    pub backend: String,
}

/// What the streaming path produced for a request.
pub enum StreamServe {
    /// The stream is live; drain `deltas` to completion.
    Streaming(ModerationStream),
    /// The client is over budget.
    RateLimited(RateLimitDecision),
}

// ── Service ────────────────────────────────────────────────────────────

/// The end-to-end moderation request handler.
pub struct ModerationService {
    client: Arc<dyn LlmClient>,
    router: Arc<ModelRouter>,
    cache: Arc<CacheAdapter>,
    limiter: Arc<RateLimiter>,
    validator: Arc<dyn SchemaValidator>,
    alert_sink: Arc<dyn AlertSink>,
    rolling: Mutex<RollingMetrics>,
}

impl ModerationService {
    /// Assemble the service from its shared collaborators.
    pub fn new(
        client: Arc<dyn LlmClient>,
        router: Arc<ModelRouter>,
        cache: Arc<CacheAdapter>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            client,
            router,
            cache,
            limiter,
            validator: Arc::new(StrictValidator),
            alert_sink: Arc::new(StderrAlertSink),
            rolling: Mutex::new(RollingMetrics::default()),
        }
    }

    /// Replace the alert sink.
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    /// Replace the schema validator.
    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Current rolling metrics plus cache stats.
    pub fn metrics(&self) -> (RollingMetrics, CacheStats) {
        let rolling = match self.rolling.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        (rolling, self.cache.stats())
    }

    /// Handle one unary request.
    ///
    /// # Errors
    ///
    /// `SubstrateError::Input` for an empty message;
    /// `SubstrateError::Config` when no backend can satisfy the required
    /// capabilities. Model failures never error: they produce the
    /// fail-safe verdict.
    pub async fn handle(&self, request: &ModerationRequest) -> Result<ServeOutcome, SubstrateError> {
        metrics::inc_request("moderation");

        let decision = self.limiter.check(&request.client_id).await;
        if !decision.allowed {
            metrics::inc_error("moderation", "rate_limited");
            return Ok(ServeOutcome::RateLimited(decision));
        }

        let message = request.message.trim();
        if message.is_empty() {
            return Err(SubstrateError::Input("message must be non-empty".into()));
        }

        let key = self.cache_key_for(message, request.locale.as_deref());
        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str::<ModerationResult>(&raw) {
                Ok(result) => {
                    metrics::inc_cache_hit();
                    let result = result.normalized();
                    self.record_rolling(&result, None, true);
                    debug!(client_id = %request.client_id, "moderation served from cache");
                    return Ok(ServeOutcome::Completed(ModerationOutcome {
                        result,
                        cached: true,
                        backend: None,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "cached moderation entry corrupt, evicting");
                    self.cache.del(&key).await;
                }
            }
        }

        let selection = self.router.select(&self.route_config(false))?;
        let (result, live_latency) = self.evaluate(&selection.selected, message, request).await;

        self.record_rolling(&result, live_latency, false);
        self.alert_if_needed(&result, &request.client_id).await;

        // Critical verdicts are always re-evaluated, never cached.
        if result.severity != Severity::Critical {
            if let Ok(raw) = serde_json::to_string(&result) {
                self.cache.set(&key, raw, CACHE_TTL_SECS).await;
            }
        }

        Ok(ServeOutcome::Completed(ModerationOutcome {
            result,
            cached: false,
            backend: Some(selection.selected),
        }))
    }

    /// Handle one streaming request. Bypasses the cache (state is
    /// partial); telemetry and rolling metrics update when the stream
    /// completes.
    pub async fn stream(&self, request: &ModerationRequest) -> Result<StreamServe, SubstrateError> {
        metrics::inc_request("moderation_stream");

        let decision = self.limiter.check(&request.client_id).await;
        if !decision.allowed {
            metrics::inc_error("moderation", "rate_limited");
            return Ok(StreamServe::RateLimited(decision));
        }
        let message = request.message.trim();
        if message.is_empty() {
            return Err(SubstrateError::Input("message must be non-empty".into()));
        }

        let selection = self.router.select(&self.route_config(true))?;
        let invocation = self.invocation(message, request.locale.as_deref());

        let started = Instant::now();
        let mut upstream = match self
            .client
            .invoke_stream(&selection.selected, invocation)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.router.telemetry().update(
                    &selection.selected,
                    started.elapsed().as_millis() as u64,
                    false,
                );
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let backend = selection.selected.clone();
        let router = Arc::clone(&self.router);

        tokio::spawn(async move {
            let mut bytes = 0usize;
            while let Some(delta) = upstream.recv().await {
                bytes += delta.len();
                if tx.send(delta).await.is_err() {
                    break; // consumer went away; still record the call
                }
            }
            let latency = started.elapsed();
            router
                .telemetry()
                .update(&backend, latency.as_millis() as u64, true);
            metrics::record_llm_latency(&backend, latency);
            debug!(backend = %backend, bytes = bytes, "moderation stream finished");
        });

        Ok(StreamServe::Streaming(ModerationStream {
            deltas: rx,
            backend: selection.selected,
        }))
    }

    // ── internals ──────────────────────────────────────────────────

    fn route_config(&self, streaming: bool) -> RouterConfig {
        let mut config = RouterConfig::for_task(TaskKind::Classification)
            .with_priority(RoutePriority::Speed)
            .with_complexity(Complexity::Low)
            .with_max_latency_ms(MODERATION_DEADLINE_MS)
            .require(Capability::StructuredOutput);
        if streaming {
            config = config.require(Capability::Streaming);
        }
        config
    }

    fn cache_key_for(&self, message: &str, locale: Option<&str>) -> String {
        let normalized = message.trim().to_lowercase();
        format!(
            "moderation:{}",
            cache_key(&format!("{normalized}|{}", locale.unwrap_or("")))
        )
    }

    fn invocation(&self, message: &str, locale: Option<&str>) -> InvocationRequest {
        let locale_hint = locale
            .map(|l| format!("The caller reports locale '{l}'. "))
            .unwrap_or_default();
        let prompt = format!(
            "You are a content-moderation classifier. {locale_hint}Classify the \
             following user message. Respond with a single JSON object with fields: \
             language, language_code (2 letters), severity (safe|warning|critical), \
             categories (up to 3 of {categories:?}), confidence (0..1), \
             risk_score (0..100), flagged (bool), reasoning.\n\nMessage:\n{message}",
            categories = ModerationCategory::ALL,
        );
        InvocationRequest::new(prompt)
            .with_schema(moderation_schema())
            .with_deadline(Duration::from_millis(MODERATION_DEADLINE_MS))
            .with_max_tokens(256)
    }

    /// Call the backend and produce a verdict, degrading in stages:
    /// schema retry → keyword parse → fail-safe default.
    async fn evaluate(
        &self,
        backend: &str,
        message: &str,
        request: &ModerationRequest,
    ) -> (ModerationResult, Option<Duration>) {
        let invocation = self.invocation(message, request.locale.as_deref());
        let schema = moderation_schema();
        let telemetry = self.router.telemetry();

        let started = Instant::now();
        let mut last_raw: Option<String> = None;

        // One schema-driven retry: malformed output is usually transient.
        for attempt in 0..2 {
            let call = tokio::time::timeout(
                invocation.deadline,
                self.client.invoke(backend, invocation.clone()),
            )
            .await;
            let latency = started.elapsed();

            let raw = match call {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    telemetry.update(backend, latency.as_millis() as u64, false);
                    metrics::inc_error("moderation", "backend");
                    warn!(backend = %backend, error = %e, "moderation call failed");
                    return (
                        ModerationResult::conservative_default(&e.to_string()),
                        Some(latency),
                    );
                }
                Err(_) => {
                    telemetry.update(backend, latency.as_millis() as u64, false);
                    metrics::inc_error("moderation", "deadline");
                    warn!(backend = %backend, "moderation call hit its deadline");
                    return (
                        ModerationResult::conservative_default("deadline exceeded"),
                        Some(latency),
                    );
                }
            };

            match self
                .validator
                .validate(&schema, &raw)
                .and_then(ModerationResult::from_validated)
            {
                Ok(result) => {
                    telemetry.update(backend, latency.as_millis() as u64, true);
                    metrics::record_llm_latency(backend, latency);
                    return (result, Some(latency));
                }
                Err(e) => {
                    debug!(backend = %backend, attempt = attempt + 1, error = %e,
                        "moderation output failed schema validation");
                    metrics::inc_error("moderation", "schema");
                    last_raw = Some(raw);
                }
            }
        }

        // Both attempts produced unparseable output. The call itself
        // worked, so it counts as a success for routing telemetry.
        let latency = started.elapsed();
        telemetry.update(backend, latency.as_millis() as u64, true);
        let degraded = hand_parse(last_raw.as_deref().unwrap_or(""));
        (degraded, Some(latency))
    }

    fn record_rolling(
        &self,
        result: &ModerationResult,
        latency: Option<Duration>,
        cache_hit: bool,
    ) {
        let mut rolling = match self.rolling.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if cache_hit {
            rolling.cache_hits += 1;
        }
        rolling.record(result, latency);
    }

    async fn alert_if_needed(&self, result: &ModerationResult, client_id: &str) {
        if !(result.flagged || result.severity == Severity::Critical) {
            return;
        }
        let alert = ModerationAlert {
            ts: Utc::now(),
            severity: result.severity,
            categories: result.categories.clone(),
            risk_score: result.risk_score,
            language_code: result.language_code.clone(),
            client_id: client_id.to_string(),
            reasoning: result.reasoning.clone(),
        };
        info!(
            severity = result.severity.as_str(),
            risk = result.risk_score,
            "routing moderation alert"
        );
        self.alert_sink.publish(&alert).await;
    }
}
