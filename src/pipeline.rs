//! Map-phase execution with bounded concurrency and checkpointed resume.
//!
//! The executor runs a map function over document chunks with:
//! 1. A semaphore capping in-flight chunk tasks at `concurrency`
//! 2. Per-chunk retry with exponential backoff for transient failures
//! 3. A degraded fallback once retries are exhausted
//! 4. A synthetic failure record when the fallback also fails, so
//!    downstream reduction still accounts for every chunk
//! 5. A checkpoint written after every terminal outcome, keyed by source
//!    fingerprint, so a crashed run resumes instead of restarting
//!
//! Checkpoint write errors never fail the run; they flip a degraded flag on
//! the outcome so callers know a resume may be incomplete. A cancel signal
//! stops dispatch of new chunks, asks in-flight chunks to stop at their
//! next retry boundary, and always writes a final checkpoint.

use crate::chunker::Chunk;
use crate::{metrics, SubstrateError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Checkpoint file name inside the data directory.
pub const STATE_FILE: &str = ".extraction-state.json";

/// Backoff delays are capped here regardless of attempt count.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

fn default_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

/// Execution policy for a map run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapPolicy {
    /// Maximum concurrent chunk tasks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries per chunk after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Whether chunks recorded as failed in a checkpoint are retried on
    /// resume (completed chunks are always skipped).
    #[serde(default = "default_true")]
    pub retry_failed_on_resume: bool,
}

impl Default for MapPolicy {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            retry_failed_on_resume: default_true(),
        }
    }
}

impl MapPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }
}

/// Terminal failure of one chunk, used to build the synthetic result.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    /// Chunk index.
    pub index: u32,
    /// Human-readable error summary.
    pub error: String,
}

/// Map function: chunk in, typed result out.
pub type MapFn<R> =
    Arc<dyn Fn(Chunk) -> BoxFuture<'static, Result<R, SubstrateError>> + Send + Sync>;

/// Degraded fallback invoked when the primary map function exhausts its
/// retries.
pub type FallbackFn<R> =
    Arc<dyn Fn(Chunk, SubstrateError) -> BoxFuture<'static, Result<R, SubstrateError>> + Send + Sync>;

/// Checkpointed progress of one map run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "R: Serialize", deserialize = "R: DeserializeOwned"))]
pub struct ProcessingState<R> {
    /// Stable identifier of the source document.
    pub source_fingerprint: String,
    /// Total chunks in the run.
    pub total_chunks: u32,
    /// Indices with a successful result.
    #[serde(default)]
    pub completed: BTreeSet<u32>,
    /// Indices that exhausted retries and fallback. Disjoint from
    /// `completed`.
    #[serde(default)]
    pub failed: BTreeSet<u32>,
    /// Successful results by index. Keys are always a subset of
    /// `completed`.
    #[serde(default)]
    pub chunk_results: BTreeMap<u32, R>,
    /// When the run started.
    #[serde(default = "Utc::now")]
    pub started: DateTime<Utc>,
    /// When the state last changed.
    #[serde(default = "Utc::now")]
    pub last_update: DateTime<Utc>,
}

impl<R> ProcessingState<R> {
    /// Fresh state for a new run.
    pub fn new(source_fingerprint: impl Into<String>, total_chunks: u32) -> Self {
        Self {
            source_fingerprint: source_fingerprint.into(),
            total_chunks,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            chunk_results: BTreeMap::new(),
            started: Utc::now(),
            last_update: Utc::now(),
        }
    }

    /// Record a successful chunk result.
    pub fn record_success(&mut self, index: u32, result: R) {
        self.failed.remove(&index);
        self.completed.insert(index);
        self.chunk_results.insert(index, result);
        self.last_update = Utc::now();
    }

    /// Record a terminal chunk failure.
    pub fn record_failure(&mut self, index: u32) {
        if !self.completed.contains(&index) {
            self.failed.insert(index);
        }
        self.last_update = Utc::now();
    }

    /// Whether every chunk reached a terminal state.
    pub fn is_settled(&self) -> bool {
        (self.completed.len() + self.failed.len()) as u32 >= self.total_chunks
    }

    /// Check the structural invariants; used by tests and on load.
    pub fn invariants_hold(&self) -> bool {
        self.completed.is_disjoint(&self.failed)
            && (self.completed.len() + self.failed.len()) as u32 <= self.total_chunks
            && self.chunk_results.keys().all(|k| self.completed.contains(k))
    }
}

/// Stable fingerprint of a source document: identical input, identical id.
pub fn fingerprint(text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("fp:{:x}", hasher.finish())
}

/// Persists the single active [`ProcessingState`] document.
pub struct CheckpointStore {
    path: PathBuf,
    // Serialises concurrent writers; they share one temp file.
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Store at an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the conventional file name inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STATE_FILE))
    }

    /// Load the persisted state when it matches `fingerprint`.
    ///
    /// Missing files, corrupt JSON, fingerprint mismatches, and states that
    /// violate their own invariants all yield `None` (fresh start).
    pub fn load<R: DeserializeOwned>(&self, fingerprint: &str) -> Option<ProcessingState<R>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint unreadable");
                return None;
            }
        };
        let state: ProcessingState<R> = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint corrupt, starting fresh");
                return None;
            }
        };
        if state.source_fingerprint != fingerprint {
            debug!(
                found = %state.source_fingerprint,
                expected = %fingerprint,
                "checkpoint is for a different source, starting fresh"
            );
            return None;
        }
        if !state.invariants_hold() {
            warn!(path = %self.path.display(), "checkpoint violates invariants, starting fresh");
            return None;
        }
        Some(state)
    }

    /// Write the state atomically (temp file + rename).
    pub fn save<R: Serialize>(&self, state: &ProcessingState<R>) -> Result<(), SubstrateError> {
        let _guard = match self.write_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SubstrateError::Checkpoint(e.to_string()))?;
        }
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|e| SubstrateError::Checkpoint(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw).map_err(|e| SubstrateError::Checkpoint(e.to_string()))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SubstrateError::Checkpoint(e.to_string()))
    }

    /// Remove the persisted state, if any.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Final outcome of a map run.
#[derive(Debug)]
pub struct MapOutcome<R> {
    /// The settled (or cancelled-partial) processing state.
    pub state: ProcessingState<R>,
    /// Results for every terminal chunk: successes plus synthetic failure
    /// records, keyed by index.
    pub results: BTreeMap<u32, R>,
    /// Whether the run stopped on the cancel signal.
    pub cancelled: bool,
    /// Whether any checkpoint write failed; a resume may then repeat work.
    pub checkpoint_degraded: bool,
}

/// Bounded-concurrency map executor. See the module docs.
pub struct PipelineExecutor {
    policy: MapPolicy,
    checkpoints: Arc<CheckpointStore>,
}

struct RunShared<R> {
    state: Mutex<ProcessingState<R>>,
    synthetic: Mutex<BTreeMap<u32, R>>,
    degraded: AtomicBool,
}

impl PipelineExecutor {
    /// Build an executor over a checkpoint store.
    pub fn new(policy: MapPolicy, checkpoints: CheckpointStore) -> Self {
        Self {
            policy,
            checkpoints: Arc::new(checkpoints),
        }
    }

    /// The configured policy.
    pub fn policy(&self) -> &MapPolicy {
        &self.policy
    }

    /// Make a cancel signal pair for [`run`](Self::run). Send `true` to
    /// request cancellation.
    pub fn cancel_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// Execute `map_fn` over `chunks`, resuming from any checkpoint that
    /// matches `source_fingerprint`.
    pub async fn run<R>(
        &self,
        source_fingerprint: &str,
        chunks: Vec<Chunk>,
        map_fn: MapFn<R>,
        fallback: Option<FallbackFn<R>>,
        cancel: watch::Receiver<bool>,
    ) -> MapOutcome<R>
    where
        R: Clone + Send + Serialize + DeserializeOwned + From<ChunkFailure> + 'static,
    {
        let total = chunks.len() as u32;
        let mut state: ProcessingState<R> = self
            .checkpoints
            .load(source_fingerprint)
            .filter(|s: &ProcessingState<R>| s.total_chunks == total)
            .unwrap_or_else(|| ProcessingState::new(source_fingerprint, total));

        let resumed = !state.completed.is_empty() || !state.failed.is_empty();
        if resumed {
            info!(
                completed = state.completed.len(),
                failed = state.failed.len(),
                total = total,
                "resuming from checkpoint"
            );
            if self.policy.retry_failed_on_resume {
                state.failed.clear();
            }
        }

        let pending: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| !state.completed.contains(&c.index) && !state.failed.contains(&c.index))
            .collect();

        let shared = Arc::new(RunShared {
            state: Mutex::new(state),
            synthetic: Mutex::new(BTreeMap::new()),
            degraded: AtomicBool::new(false),
        });

        let semaphore = Arc::new(Semaphore::new(self.policy.concurrency.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut dispatch_cancelled = false;

        for chunk in pending {
            if *cancel.borrow() {
                dispatch_cancelled = true;
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if *cancel.borrow() {
                dispatch_cancelled = true;
                break;
            }

            let shared = Arc::clone(&shared);
            let checkpoints = Arc::clone(&self.checkpoints);
            let map_fn = Arc::clone(&map_fn);
            let fallback = fallback.clone();
            let policy = self.policy.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permit;
                process_chunk(chunk, &policy, map_fn, fallback, cancel, &shared, &checkpoints)
                    .await;
            });
        }

        while tasks.join_next().await.is_some() {}

        let cancelled = dispatch_cancelled || *cancel.borrow();
        let state = {
            let guard = match shared.state.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        // A cancel always leaves a checkpoint behind.
        if let Err(e) = self.checkpoints.save(&state) {
            warn!(error = %e, "final checkpoint write failed");
            shared.degraded.store(true, Ordering::Relaxed);
        }

        let mut results = state.chunk_results.clone();
        {
            let synthetic = match shared.synthetic.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (idx, r) in synthetic.iter() {
                results.entry(*idx).or_insert_with(|| r.clone());
            }
        }

        info!(
            completed = state.completed.len(),
            failed = state.failed.len(),
            total = state.total_chunks,
            cancelled = cancelled,
            "map phase finished"
        );

        MapOutcome {
            checkpoint_degraded: shared.degraded.load(Ordering::Relaxed),
            state,
            results,
            cancelled,
        }
    }
}

async fn process_chunk<R>(
    chunk: Chunk,
    policy: &MapPolicy,
    map_fn: MapFn<R>,
    fallback: Option<FallbackFn<R>>,
    cancel: watch::Receiver<bool>,
    shared: &RunShared<R>,
    checkpoints: &CheckpointStore,
) where
    R: Clone + Send + Serialize + DeserializeOwned + From<ChunkFailure> + 'static,
{
    let index = chunk.index;
    metrics::inc_request("map");
    let mut attempt: u32 = 0;

    let error = loop {
        match map_fn(chunk.clone()).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(chunk = index, attempt = attempt + 1, "chunk succeeded after retry");
                }
                record_terminal(shared, checkpoints, |state| {
                    state.record_success(index, result)
                });
                return;
            }
            Err(_) if *cancel.borrow() => {
                // Abort at the retry boundary: the chunk stays pending and
                // the resume picks it up.
                debug!(chunk = index, "chunk aborted by cancel");
                return;
            }
            Err(e) if attempt < policy.max_retries => {
                warn!(
                    chunk = index,
                    attempt = attempt + 1,
                    max = policy.max_retries + 1,
                    error = %e,
                    "chunk attempt failed, backing off"
                );
                metrics::inc_error("map", "retryable");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
                if *cancel.borrow() {
                    // Abort at the retry boundary: the chunk stays pending
                    // and the resume picks it up.
                    debug!(chunk = index, "chunk aborted by cancel");
                    return;
                }
            }
            Err(e) => break e,
        }
    };

    warn!(chunk = index, error = %error, "chunk exhausted retries");

    match fallback {
        Some(fb) => match fb(chunk.clone(), error).await {
            Ok(result) => {
                debug!(chunk = index, "fallback produced a degraded result");
                metrics::inc_request("map_fallback");
                record_terminal(shared, checkpoints, |state| {
                    state.record_success(index, result)
                });
            }
            Err(fb_err) => {
                warn!(chunk = index, error = %fb_err, "fallback failed");
                record_synthetic(shared, checkpoints, index, fb_err.to_string());
            }
        },
        None => record_synthetic(shared, checkpoints, index, error.to_string()),
    }
}

fn record_terminal<R, F>(shared: &RunShared<R>, checkpoints: &CheckpointStore, apply: F)
where
    R: Clone + Serialize,
    F: FnOnce(&mut ProcessingState<R>),
{
    let snapshot = {
        let mut state = match shared.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut state);
        state.clone()
    };
    if let Err(e) = checkpoints.save(&snapshot) {
        warn!(error = %e, "checkpoint write failed, resume may repeat work");
        metrics::inc_error("map", "checkpoint");
        shared.degraded.store(true, Ordering::Relaxed);
    }
}

fn record_synthetic<R>(
    shared: &RunShared<R>,
    checkpoints: &CheckpointStore,
    index: u32,
    error: String,
) where
    R: Clone + Serialize + From<ChunkFailure>,
{
    metrics::inc_error("map", "chunk_failed");
    {
        let mut synthetic = match shared.synthetic.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        synthetic.insert(index, R::from(ChunkFailure { index, error }));
    }
    record_terminal(shared, checkpoints, |state| state.record_failure(index));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestResult {
        index: u32,
        summary: String,
        failed: bool,
    }

    impl From<ChunkFailure> for TestResult {
        fn from(f: ChunkFailure) -> Self {
            Self {
                index: f.index,
                summary: format!("chunk {} failed: {}", f.index, f.error),
                failed: true,
            }
        }
    }

    fn make_chunks(n: u32) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                index: i,
                text: format!("chunk body {i}"),
                start: (i as usize) * 100,
                end: (i as usize + 1) * 100,
            })
            .collect()
    }

    fn ok_fn(calls: Arc<AtomicUsize>) -> MapFn<TestResult> {
        Arc::new(move |c: Chunk| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(TestResult {
                    index: c.index,
                    summary: c.text,
                    failed: false,
                })
            })
        })
    }

    /// Fails chunk `target` the first `fail_times` calls, succeeds after.
    fn flaky_fn(target: u32, fail_times: usize, counter: Arc<AtomicUsize>) -> MapFn<TestResult> {
        Arc::new(move |c: Chunk| {
            let counter = counter.clone();
            Box::pin(async move {
                if c.index == target {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < fail_times {
                        return Err(SubstrateError::Backend("synthetic flake".into()));
                    }
                }
                Ok(TestResult {
                    index: c.index,
                    summary: c.text,
                    failed: false,
                })
            })
        })
    }

    fn fast_policy(max_retries: u32) -> MapPolicy {
        MapPolicy {
            concurrency: 3,
            max_retries,
            base_delay_ms: 1,
            retry_failed_on_resume: true,
        }
    }

    fn executor(dir: &tempfile::TempDir, policy: MapPolicy) -> PipelineExecutor {
        PipelineExecutor::new(policy, CheckpointStore::in_dir(dir.path()))
    }

    // ── happy path ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_all_chunks_map_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, fast_policy(3));
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        let outcome = exec
            .run("fp:test", make_chunks(5), ok_fn(calls.clone()), None, cancel)
            .await;

        assert_eq!(outcome.state.completed.len(), 5);
        assert!(outcome.state.failed.is_empty());
        assert_eq!(outcome.results.len(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(!outcome.cancelled);
        assert!(!outcome.checkpoint_degraded);
        assert!(outcome.state.invariants_hold());
    }

    // ── retry semantics ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_failing_k_times_with_k_retries_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, fast_policy(3));
        let counter = Arc::new(AtomicUsize::new(0));
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        let outcome = exec
            .run(
                "fp:retry",
                make_chunks(1),
                flaky_fn(0, 3, counter.clone()),
                None,
                cancel,
            )
            .await;

        assert!(outcome.state.completed.contains(&0), "4th attempt succeeds");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(!outcome.results[&0].failed);
    }

    #[tokio::test]
    async fn test_failing_k_plus_one_times_triggers_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, fast_policy(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let fallback_hits = Arc::new(AtomicUsize::new(0));
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        let hits = fallback_hits.clone();
        let fallback: FallbackFn<TestResult> = Arc::new(move |c, _e| {
            let hits = hits.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(TestResult {
                    index: c.index,
                    summary: "degraded".into(),
                    failed: false,
                })
            })
        });

        let outcome = exec
            .run(
                "fp:fb",
                make_chunks(1),
                flaky_fn(0, 10, counter),
                Some(fallback),
                cancel,
            )
            .await;

        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
        assert!(outcome.state.completed.contains(&0));
        assert_eq!(outcome.results[&0].summary, "degraded");
    }

    #[tokio::test]
    async fn test_failed_fallback_yields_synthetic_record() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, fast_policy(1));
        let counter = Arc::new(AtomicUsize::new(0));
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        let fallback: FallbackFn<TestResult> = Arc::new(|_c, _e| {
            Box::pin(async { Err(SubstrateError::Backend("fallback down too".into())) })
        });

        let outcome = exec
            .run(
                "fp:synth",
                make_chunks(2),
                flaky_fn(1, 10, counter),
                Some(fallback),
                cancel,
            )
            .await;

        assert!(outcome.state.completed.contains(&0));
        assert!(outcome.state.failed.contains(&1));
        // The synthetic record still participates in downstream reduction
        let synthetic = &outcome.results[&1];
        assert!(synthetic.failed);
        assert!(synthetic.summary.contains("fallback down too"));
        // Checkpointed results only hold real successes
        assert!(!outcome.state.chunk_results.contains_key(&1));
        assert!(outcome.state.invariants_hold());
    }

    // ── resume ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_resume_skips_completed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        // First run completes everything
        let exec = executor(&dir, fast_policy(0));
        let calls1 = Arc::new(AtomicUsize::new(0));
        let outcome1 = exec
            .run("fp:res", make_chunks(3), ok_fn(calls1.clone()), None, cancel.clone())
            .await;
        assert_eq!(outcome1.state.completed.len(), 3);

        // Second run with the same fingerprint re-invokes nothing
        let exec = executor(&dir, fast_policy(0));
        let calls2 = Arc::new(AtomicUsize::new(0));
        let outcome2 = exec
            .run("fp:res", make_chunks(3), ok_fn(calls2.clone()), None, cancel)
            .await;

        assert_eq!(calls2.load(Ordering::SeqCst), 0, "no chunk re-invoked");
        assert_eq!(outcome2.results.len(), 3);
        assert_eq!(outcome1.results, outcome2.results);
    }

    #[tokio::test]
    async fn test_resume_retries_failed_chunks_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        // Run 1: chunk 1 fails terminally (no retries, no fallback)
        let exec = executor(&dir, fast_policy(0));
        let c1 = Arc::new(AtomicUsize::new(0));
        let outcome1 = exec
            .run("fp:rf", make_chunks(2), flaky_fn(1, 1, c1), None, cancel.clone())
            .await;
        assert!(outcome1.state.failed.contains(&1));

        // Run 2: the failed chunk runs again and now succeeds
        let exec = executor(&dir, fast_policy(0));
        let c2 = Arc::new(AtomicUsize::new(1)); // counter past the flake window
        let outcome2 = exec
            .run("fp:rf", make_chunks(2), flaky_fn(1, 1, c2), None, cancel)
            .await;
        assert!(outcome2.state.failed.is_empty());
        assert_eq!(outcome2.state.completed.len(), 2);
    }

    #[tokio::test]
    async fn test_different_fingerprint_ignores_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, cancel) = PipelineExecutor::cancel_signal();

        let exec = executor(&dir, fast_policy(0));
        let calls = Arc::new(AtomicUsize::new(0));
        exec.run("fp:one", make_chunks(2), ok_fn(calls.clone()), None, cancel.clone())
            .await;

        let exec = executor(&dir, fast_policy(0));
        exec.run("fp:two", make_chunks(2), ok_fn(calls.clone()), None, cancel)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4, "fresh source runs fully");
    }

    // ── cancellation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_stops_dispatch_and_writes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let policy = MapPolicy {
            concurrency: 1,
            max_retries: 0,
            base_delay_ms: 1,
            retry_failed_on_resume: true,
        };
        let exec = executor(&dir, policy);
        let (tx, cancel) = PipelineExecutor::cancel_signal();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();
        let tx = Arc::new(tx);
        let tx_inner = tx.clone();
        // Cancel after the first chunk's work begins
        let slow_fn: MapFn<TestResult> = Arc::new(move |c: Chunk| {
            let calls = calls_inner.clone();
            let tx = tx_inner.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(true);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(TestResult {
                    index: c.index,
                    summary: "done".into(),
                    failed: false,
                })
            })
        });

        let outcome = exec
            .run("fp:cancel", make_chunks(10), slow_fn, None, cancel)
            .await;

        assert!(outcome.cancelled);
        assert!(
            calls.load(Ordering::SeqCst) < 10,
            "cancel must stop dispatch of remaining chunks"
        );
        // The checkpoint reflects whatever finished before the cancel
        let store = CheckpointStore::in_dir(dir.path());
        let persisted: ProcessingState<TestResult> = store.load("fp:cancel").unwrap();
        assert!(persisted.invariants_hold());
    }

    // ── checkpoint store ─────────────────────────────────────────────

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());

        let mut state: ProcessingState<TestResult> = ProcessingState::new("fp:x", 3);
        state.record_success(
            0,
            TestResult {
                index: 0,
                summary: "s".into(),
                failed: false,
            },
        );
        state.record_failure(2);
        store.save(&state).unwrap();

        let loaded: ProcessingState<TestResult> = store.load("fp:x").unwrap();
        assert_eq!(loaded.completed, state.completed);
        assert_eq!(loaded.failed, state.failed);
        assert_eq!(loaded.chunk_results[&0].summary, "s");
    }

    #[test]
    fn test_checkpoint_load_rejects_wrong_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        let state: ProcessingState<TestResult> = ProcessingState::new("fp:a", 1);
        store.save(&state).unwrap();
        assert!(store.load::<TestResult>("fp:b").is_none());
    }

    #[test]
    fn test_checkpoint_load_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::in_dir(dir.path());
        std::fs::write(dir.path().join(STATE_FILE), "{{{").unwrap();
        assert!(store.load::<TestResult>("fp:a").is_none());
    }

    // ── state invariants ─────────────────────────────────────────────

    #[test]
    fn test_success_after_failure_moves_chunk_out_of_failed() {
        let mut state: ProcessingState<TestResult> = ProcessingState::new("fp", 2);
        state.record_failure(0);
        assert!(state.failed.contains(&0));
        state.record_success(
            0,
            TestResult {
                index: 0,
                summary: "recovered".into(),
                failed: false,
            },
        );
        assert!(state.completed.contains(&0));
        assert!(!state.failed.contains(&0));
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_failure_after_success_is_ignored() {
        let mut state: ProcessingState<TestResult> = ProcessingState::new("fp", 1);
        state.record_success(
            0,
            TestResult {
                index: 0,
                summary: "s".into(),
                failed: false,
            },
        );
        state.record_failure(0);
        assert!(state.completed.contains(&0));
        assert!(!state.failed.contains(&0));
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_fingerprint_stable_and_input_sensitive() {
        assert_eq!(fingerprint("same text"), fingerprint("same text"));
        assert_ne!(fingerprint("same text"), fingerprint("other text"));
    }

    #[test]
    fn test_policy_backoff_doubles_and_caps() {
        let policy = MapPolicy {
            base_delay_ms: 100,
            ..MapPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), MAX_RETRY_DELAY);
    }
}
