//! Batch pipeline runner
//!
//! Chunks a document, extracts structured entities per chunk under the
//! bounded-concurrency executor, merges the results, and reduces the
//! per-chunk summaries hierarchically. Progress is checkpointed under the
//! data directory; a second run with `--resume` skips completed chunks.
//!
//! ```text
//! pipeline-runner <input-file> [--resume] [--chunk-size N] [--overlap N]
//!                 [--concurrency N] [--data-dir DIR]
//! ```
//!
//! Exit codes: 0 on success; 1 on unrecoverable failure or when chunks
//! remain failed (the state file is preserved so `--resume` retries them).

use llm_substrate::client::{EchoClient, InvocationRequest, LlmClient};
use llm_substrate::pipeline::{
    fingerprint, CheckpointStore, FallbackFn, MapFn, MapPolicy, PipelineExecutor,
};
use llm_substrate::reduce::{merge_extractions, ExtractionChunk, SummaryReducer};
use llm_substrate::routing::{
    BackendProfile, Capability, CapabilityTier, ModelRouter, RoutePriority, RouterConfig, TaskKind,
};
use llm_substrate::schema::extract_json_object;
use llm_substrate::telemetry::TelemetryStore;
use llm_substrate::{chunk, init_tracing, metrics, SubstrateError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Demo backend table used when no deployment-specific table is wired in.
fn default_profiles() -> Vec<BackendProfile> {
    vec![
        BackendProfile {
            name: "fast-lite".into(),
            tier: CapabilityTier::Basic,
            cost_per_1k_tokens: 0.0005,
            nominal_max_latency_ms: 800,
            supports_structured_output: true,
            supports_streaming: true,
        },
        BackendProfile {
            name: "workhorse".into(),
            tier: CapabilityTier::Standard,
            cost_per_1k_tokens: 0.003,
            nominal_max_latency_ms: 1500,
            supports_structured_output: true,
            supports_streaming: true,
        },
        BackendProfile {
            name: "deep-thought".into(),
            tier: CapabilityTier::Reasoning,
            cost_per_1k_tokens: 0.015,
            nominal_max_latency_ms: 6000,
            supports_structured_output: true,
            supports_streaming: false,
        },
    ]
}

struct RunnerArgs {
    input: PathBuf,
    resume: bool,
    chunk_size: usize,
    overlap: usize,
    concurrency: usize,
    data_dir: PathBuf,
}

fn parse_args() -> Result<RunnerArgs, String> {
    let mut input = None;
    let mut resume = false;
    let mut chunk_size = 16_000usize;
    let mut overlap = 800usize;
    let mut concurrency = 3usize;
    let mut data_dir = PathBuf::from(".");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--resume" => resume = true,
            "--chunk-size" => {
                chunk_size = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--chunk-size needs a number")?;
            }
            "--overlap" => {
                overlap = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--overlap needs a number")?;
            }
            "--concurrency" => {
                concurrency = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--concurrency needs a number")?;
            }
            "--data-dir" => {
                data_dir = args.next().map(PathBuf::from).ok_or("--data-dir needs a path")?;
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            path => {
                if input.replace(PathBuf::from(path)).is_some() {
                    return Err("exactly one input file expected".into());
                }
            }
        }
    }

    Ok(RunnerArgs {
        input: input.ok_or("usage: pipeline-runner <input-file> [--resume] ...")?,
        resume,
        chunk_size,
        overlap,
        concurrency,
        data_dir,
    })
}

fn extraction_map_fn(client: Arc<dyn LlmClient>, router: Arc<ModelRouter>) -> MapFn<ExtractionChunk> {
    Arc::new(move |chunk| {
        let client = Arc::clone(&client);
        let router = Arc::clone(&router);
        Box::pin(async move {
            let config = RouterConfig::for_task(TaskKind::Extraction)
                .with_priority(RoutePriority::Balanced)
                .require(Capability::StructuredOutput);
            let selection = router.select(&config)?;

            let prompt = format!(
                "Extract structured information from the text below. Respond with a \
                 single JSON object with fields: summary (one paragraph), people \
                 (array of {{name, role}}), companies (array of {{name, industry}}), \
                 concepts (array of strings), relationships (array of \
                 {{person_a, person_b, kind, evidence}}).\n\nText:\n{}",
                chunk.text
            );

            let started = Instant::now();
            let outcome = client
                .invoke(
                    &selection.selected,
                    InvocationRequest::new(prompt).with_deadline(Duration::from_secs(30)),
                )
                .await;
            let latency = started.elapsed();
            let telemetry = router.telemetry();

            let raw = match outcome {
                Ok(raw) => {
                    telemetry.update(&selection.selected, latency.as_millis() as u64, true);
                    metrics::record_llm_latency(&selection.selected, latency);
                    raw
                }
                Err(e) => {
                    telemetry.update(&selection.selected, latency.as_millis() as u64, false);
                    return Err(e);
                }
            };

            let value = extract_json_object(&raw)?;
            let mut parsed: ExtractionChunk = serde_json::from_value(value)
                .map_err(|e| SubstrateError::Schema(format!("extraction shape: {e}")))?;
            parsed.index = chunk.index;
            parsed.failed = false;
            Ok(parsed)
        })
    })
}

/// Degraded per-chunk fallback: a truncated leading-sentence summary so
/// the reduce phase still accounts for the chunk.
fn extraction_fallback() -> FallbackFn<ExtractionChunk> {
    Arc::new(|chunk, error| {
        Box::pin(async move {
            warn!(chunk = chunk.index, error = %error, "using degraded extraction");
            let lead: String = chunk
                .text
                .split_inclusive('.')
                .next()
                .unwrap_or(&chunk.text)
                .chars()
                .take(240)
                .collect();
            Ok(ExtractionChunk {
                index: chunk.index,
                summary: lead.trim().to_string(),
                ..ExtractionChunk::default()
            })
        })
    })
}

async fn run(args: RunnerArgs) -> Result<bool, SubstrateError> {
    let text = std::fs::read_to_string(&args.input)
        .map_err(|e| SubstrateError::Input(format!("{}: {e}", args.input.display())))?;

    let profiles = default_profiles();
    let telemetry = Arc::new(TelemetryStore::open(&args.data_dir, &profiles));
    let router = Arc::new(ModelRouter::new(profiles, telemetry.clone(), "workhorse")?);
    let client: Arc<dyn LlmClient> = Arc::new(EchoClient::new());

    let chunks = chunk(&text, args.chunk_size, args.overlap);
    let source_fingerprint = fingerprint(&text);
    info!(
        chunks = chunks.len(),
        fingerprint = %source_fingerprint,
        resume = args.resume,
        "starting extraction run"
    );

    let checkpoints = CheckpointStore::in_dir(&args.data_dir);
    if !args.resume {
        checkpoints.clear();
    }

    let policy = MapPolicy {
        concurrency: args.concurrency,
        ..MapPolicy::default()
    };
    let executor = PipelineExecutor::new(policy, checkpoints);
    let (_cancel_tx, cancel) = PipelineExecutor::cancel_signal();

    let outcome = executor
        .run(
            &source_fingerprint,
            chunks,
            extraction_map_fn(client.clone(), router.clone()),
            Some(extraction_fallback()),
            cancel,
        )
        .await;

    let report = merge_extractions(&outcome.results);
    let summaries: Vec<String> = outcome
        .results
        .values()
        .filter(|r| !r.failed)
        .map(|r| r.summary.clone())
        .collect();
    let reducer = SummaryReducer::new(client, router, args.concurrency);
    let combined_summary = reducer.reduce(summaries).await.unwrap_or_else(|e| {
        warn!(error = %e, "summary reduction failed");
        String::new()
    });

    let payload = serde_json::json!({
        "fingerprint": source_fingerprint,
        "chunks": outcome.state.total_chunks,
        "completed": outcome.state.completed.len(),
        "failed": outcome.state.failed.len(),
        "summary": combined_summary,
        "report": report,
    });
    println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());

    if outcome.checkpoint_degraded {
        warn!("one or more checkpoint writes failed; a resume may repeat work");
    }

    let clean = outcome.state.failed.is_empty() && !outcome.cancelled;
    if clean {
        // Nothing left to resume.
        CheckpointStore::in_dir(&args.data_dir).clear();
    } else {
        warn!(
            failed = outcome.state.failed.len(),
            "run incomplete; state preserved for --resume"
        );
    }
    Ok(clean)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    if let Err(e) = metrics::init_metrics() {
        warn!(error = %e, "metrics unavailable");
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(1);
        }
    };

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = %e, "pipeline run failed");
            ExitCode::from(1)
        }
    }
}
