//! Backend telemetry and decision history
//!
//! A single-writer store of per-backend rolling statistics plus a bounded
//! log of routing decisions. Both are persisted as JSON under a data
//! directory (`.model-telemetry.json`, `.routing-history.json`) with
//! write-through on every update and load-on-start, so routing quality
//! survives process restarts.
//!
//! Averages are plain arithmetic running means over `call_count`
//! observations, chosen over an EMA so every persisted number is directly
//! explainable from the counters next to it. `call_count` is monotonically
//! non-decreasing. Writers are serialized behind one lock; readers take
//! consistent snapshots and may observe last-write-wins.

use crate::routing::{BackendProfile, CapabilityTier, RouterConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Maximum retained routing decisions.
pub const DECISION_LOG_CAP: usize = 100;

/// Telemetry file name inside the data directory.
pub const TELEMETRY_FILE: &str = ".model-telemetry.json";
/// Decision-history file name inside the data directory.
pub const HISTORY_FILE: &str = ".routing-history.json";

fn default_success_rate() -> f64 {
    1.0
}

/// Rolling statistics for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTelemetry {
    /// Backend name.
    pub name: String,
    /// Latency of the most recent call, ms.
    #[serde(default)]
    pub last_latency_ms: u64,
    /// List price per 1 000 tokens, copied from the static profile.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Running success rate in `[0, 1]`.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    /// Capability tier, copied from the static profile.
    #[serde(default)]
    pub tier: CapabilityTier,
    /// When the stats were last updated.
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    /// Number of observed calls. Monotonically non-decreasing.
    #[serde(default)]
    pub call_count: u64,
    /// Running mean latency, ms.
    #[serde(default)]
    pub avg_latency_ms: f64,
}

impl BackendTelemetry {
    /// Initial telemetry seeded from a static profile: no calls yet, full
    /// trust, nominal latency.
    pub fn seed(profile: &BackendProfile) -> Self {
        Self {
            name: profile.name.clone(),
            last_latency_ms: 0,
            cost_per_1k_tokens: profile.cost_per_1k_tokens,
            success_rate: 1.0,
            tier: profile.tier,
            last_updated: Utc::now(),
            call_count: 0,
            avg_latency_ms: profile.nominal_max_latency_ms as f64,
        }
    }

    /// Fold one observation into the running means.
    fn observe(&mut self, latency_ms: u64, success: bool) {
        let n = self.call_count + 1;
        let nf = n as f64;
        self.avg_latency_ms = (self.avg_latency_ms * (nf - 1.0) + latency_ms as f64) / nf;
        self.success_rate =
            (self.success_rate * (nf - 1.0) + if success { 1.0 } else { 0.0 }) / nf;
        self.last_latency_ms = latency_ms;
        self.last_updated = Utc::now();
        self.call_count = n;
    }
}

/// A scored runner-up recorded alongside each decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAlternative {
    /// Backend name.
    pub backend: String,
    /// Final score.
    pub score: f64,
    /// Dominant reason token for the score.
    #[serde(default)]
    pub reason: String,
}

/// One routing decision, appended to the bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// When the selection was made.
    pub ts: DateTime<Utc>,
    /// The request config the selection was scored against.
    pub config: RouterConfig,
    /// Winning backend.
    pub selected: String,
    /// Reason tokens explaining the winning score.
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Winning score.
    pub score: f64,
    /// Up to three runners-up.
    #[serde(default)]
    pub alternatives: Vec<ScoredAlternative>,
}

/// A consistent read of the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Backend name → rolling stats.
    pub backends: HashMap<String, BackendTelemetry>,
    /// Decision history, oldest first, at most [`DECISION_LOG_CAP`] entries.
    pub decisions: Vec<DecisionRecord>,
}

#[derive(Default)]
struct TelemetryState {
    backends: HashMap<String, BackendTelemetry>,
    decisions: VecDeque<DecisionRecord>,
}

/// Persistent telemetry store. See the module docs for semantics.
pub struct TelemetryStore {
    inner: RwLock<TelemetryState>,
    data_dir: Option<PathBuf>,
}

impl TelemetryStore {
    /// Open a store under `data_dir`, loading any persisted state and
    /// seeding telemetry for profiles not yet on disk.
    ///
    /// Corrupt or missing files are logged and treated as initial state;
    /// unknown JSON fields are ignored for forward compatibility.
    pub fn open(data_dir: impl Into<PathBuf>, profiles: &[BackendProfile]) -> Self {
        let data_dir = data_dir.into();
        let mut state = TelemetryState {
            backends: load_json::<HashMap<String, BackendTelemetry>>(
                &data_dir.join(TELEMETRY_FILE),
            )
            .unwrap_or_default(),
            decisions: load_json::<Vec<DecisionRecord>>(&data_dir.join(HISTORY_FILE))
                .unwrap_or_default()
                .into(),
        };

        for profile in profiles {
            state
                .backends
                .entry(profile.name.clone())
                .or_insert_with(|| BackendTelemetry::seed(profile));
        }
        while state.decisions.len() > DECISION_LOG_CAP {
            state.decisions.pop_front();
        }

        Self {
            inner: RwLock::new(state),
            data_dir: Some(data_dir),
        }
    }

    /// A store that never touches disk. For tests and embedded use.
    pub fn in_memory(profiles: &[BackendProfile]) -> Self {
        let mut backends = HashMap::new();
        for profile in profiles {
            backends.insert(profile.name.clone(), BackendTelemetry::seed(profile));
        }
        Self {
            inner: RwLock::new(TelemetryState {
                backends,
                decisions: VecDeque::new(),
            }),
            data_dir: None,
        }
    }

    /// Record one call outcome for `backend`.
    pub fn update(&self, backend: &str, latency_ms: u64, success: bool) {
        let persisted = {
            let mut state = match self.inner.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = state
                .backends
                .entry(backend.to_string())
                .or_insert_with(|| BackendTelemetry {
                    name: backend.to_string(),
                    last_latency_ms: 0,
                    cost_per_1k_tokens: 0.0,
                    success_rate: 1.0,
                    tier: CapabilityTier::default(),
                    last_updated: Utc::now(),
                    call_count: 0,
                    avg_latency_ms: latency_ms as f64,
                });
            entry.observe(latency_ms, success);
            debug!(
                backend = backend,
                latency_ms = latency_ms,
                success = success,
                call_count = entry.call_count,
                "telemetry updated"
            );
            state.backends.clone()
        };
        self.persist(TELEMETRY_FILE, &persisted);
    }

    /// Append a decision, dropping the oldest past [`DECISION_LOG_CAP`].
    pub fn record_decision(&self, record: DecisionRecord) {
        let persisted = {
            let mut state = match self.inner.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.decisions.push_back(record);
            while state.decisions.len() > DECISION_LOG_CAP {
                state.decisions.pop_front();
            }
            state.decisions.iter().cloned().collect::<Vec<_>>()
        };
        self.persist(HISTORY_FILE, &persisted);
    }

    /// Stats for one backend, if tracked.
    pub fn backend(&self, name: &str) -> Option<BackendTelemetry> {
        let state = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.backends.get(name).cloned()
    }

    /// Consistent copy of all telemetry and the decision log.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        TelemetrySnapshot {
            backends: state.backends.clone(),
            decisions: state.decisions.iter().cloned().collect(),
        }
    }

    /// Write-through persistence. Failures are logged, never propagated:
    /// losing history must not break serving.
    fn persist<T: Serialize>(&self, file: &str, value: &T) {
        let Some(dir) = &self.data_dir else { return };
        if let Err(e) = write_json(&dir.join(file), value) {
            warn!(file = file, error = %e, "telemetry persistence failed");
        }
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state file");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt state file, starting fresh");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    // Write-then-rename keeps readers from ever seeing a torn file.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)
}
