//! Reduce phase: combining per-chunk outputs into one aggregate.
//!
//! Two strategies:
//!
//! - [`merge_extractions`] — deduplicating merge for entity-extraction
//!   outputs. Entities collide on a normalised key (lowercase + trim);
//!   the first-seen original spelling is kept for display, scalar
//!   attributes resolve first-non-empty, and chunk provenance is unioned.
//!   Inputs are folded in ascending chunk index, so the output is a
//!   deterministic function of the result multiset.
//! - [`SummaryReducer`] — hierarchical reduction for free-form summaries.
//!   Small fan-ins combine in one model call; large fan-ins reduce in
//!   batches of five under the shared bounded-concurrency policy, then
//!   recurse on the shrunken list.
//!
//! Both are pure functions of their inputs apart from the model calls the
//! summary reducer makes, so a replay over the same chunk results produces
//! the same aggregate.

use crate::client::{InvocationRequest, LlmClient};
use crate::pipeline::ChunkFailure;
use crate::routing::{ModelRouter, RoutePriority, RouterConfig, TaskKind};
use crate::SubstrateError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Fan-in at or below which summaries combine in a single call.
const DIRECT_COMBINE_LIMIT: usize = 10;

/// Batch size for one hierarchical reduction step.
const REDUCE_BATCH: usize = 5;

/// Separator between merged relationship evidence fragments.
const EVIDENCE_SEPARATOR: &str = " | ";

// ── Extraction result types ────────────────────────────────────────────

/// A person mentioned in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PersonMention {
    /// Name as written in the text.
    pub name: String,
    /// Role or title, when stated.
    #[serde(default)]
    pub role: Option<String>,
}

/// An organisation mentioned in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompanyMention {
    /// Name as written in the text.
    pub name: String,
    /// Industry, when stated.
    #[serde(default)]
    pub industry: Option<String>,
}

/// A relationship between two people asserted by a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelationMention {
    /// First person, as written.
    pub person_a: String,
    /// Second person, as written.
    pub person_b: String,
    /// Relationship kind (e.g. "reports_to", "founded_with").
    pub kind: String,
    /// Supporting quote or paraphrase.
    #[serde(default)]
    pub evidence: String,
}

/// Extraction output for one chunk. Carries the chunk index but never the
/// chunk text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractionChunk {
    /// Source chunk index.
    #[serde(default)]
    pub index: u32,
    /// One-paragraph summary of the chunk.
    #[serde(default)]
    pub summary: String,
    /// People mentioned.
    #[serde(default)]
    pub people: Vec<PersonMention>,
    /// Organisations mentioned.
    #[serde(default)]
    pub companies: Vec<CompanyMention>,
    /// Key concepts.
    #[serde(default)]
    pub concepts: Vec<String>,
    /// Person-to-person relationships.
    #[serde(default)]
    pub relationships: Vec<RelationMention>,
    /// Set when this is a synthetic record for a chunk that never
    /// produced a real result.
    #[serde(default)]
    pub failed: bool,
}

impl From<ChunkFailure> for ExtractionChunk {
    fn from(failure: ChunkFailure) -> Self {
        Self {
            index: failure.index,
            summary: format!("chunk {} failed: {}", failure.index, failure.error),
            failed: true,
            ..Self::default()
        }
    }
}

// ── Merged report types ────────────────────────────────────────────────

/// A deduplicated person with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Display name (first-seen spelling).
    pub name: String,
    /// Role, first non-empty across mentions.
    pub role: Option<String>,
    /// Chunk indices that mentioned this person, ascending first-seen.
    pub chunks: Vec<u32>,
}

/// A deduplicated company with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    /// Display name (first-seen spelling).
    pub name: String,
    /// Industry, first non-empty across mentions.
    pub industry: Option<String>,
    /// Chunk indices that mentioned this company.
    pub chunks: Vec<u32>,
}

/// A deduplicated concept with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    /// Display form (first-seen spelling).
    pub name: String,
    /// Chunk indices that mentioned this concept.
    pub chunks: Vec<u32>,
}

/// A deduplicated relationship with concatenated evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// First person, display form.
    pub person_a: String,
    /// Second person, display form.
    pub person_b: String,
    /// Relationship kind.
    pub kind: String,
    /// Evidence fragments joined with `" | "`, substring-deduplicated.
    pub evidence: String,
    /// Chunk indices asserting this relationship.
    pub chunks: Vec<u32>,
}

/// The merged extraction aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractionReport {
    /// Deduplicated people, first-seen order.
    pub people: Vec<Person>,
    /// Deduplicated companies, first-seen order.
    pub companies: Vec<Company>,
    /// Deduplicated concepts, first-seen order.
    pub concepts: Vec<Concept>,
    /// Deduplicated relationships, first-seen order.
    pub relationships: Vec<Relation>,
    /// Chunk indices whose extraction never succeeded.
    pub failed_chunks: Vec<u32>,
}

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

fn push_chunk(chunks: &mut Vec<u32>, index: u32) {
    if !chunks.contains(&index) {
        chunks.push(index);
    }
}

/// Merge evidence fragments, dropping fragments that are substrings of
/// what is already accumulated (and replacing accumulated fragments
/// subsumed by the new one).
fn merge_evidence(existing: &mut String, fresh: &str) {
    let fresh = fresh.trim();
    if fresh.is_empty() {
        return;
    }
    if existing.is_empty() {
        existing.push_str(fresh);
        return;
    }
    let mut parts: Vec<String> = existing
        .split(EVIDENCE_SEPARATOR)
        .map(str::to_string)
        .collect();
    if parts.iter().any(|p| p.contains(fresh)) {
        return;
    }
    parts.retain(|p| !fresh.contains(p.as_str()));
    parts.push(fresh.to_string());
    *existing = parts.join(EVIDENCE_SEPARATOR);
}

/// Deduplicating merge over per-chunk extraction results.
///
/// The `BTreeMap` input fixes the fold order to ascending chunk index,
/// which makes first-seen display forms and provenance ordering
/// deterministic regardless of the order chunks completed in.
pub fn merge_extractions(results: &BTreeMap<u32, ExtractionChunk>) -> ExtractionReport {
    let mut report = ExtractionReport::default();
    let mut people_idx: HashMap<String, usize> = HashMap::new();
    let mut companies_idx: HashMap<String, usize> = HashMap::new();
    let mut concepts_idx: HashMap<String, usize> = HashMap::new();
    let mut relations_idx: HashMap<(String, String, String), usize> = HashMap::new();

    for (&index, chunk) in results {
        if chunk.failed {
            report.failed_chunks.push(index);
            continue;
        }

        for mention in &chunk.people {
            let key = norm(&mention.name);
            if key.is_empty() {
                continue;
            }
            let slot = *people_idx.entry(key).or_insert_with(|| {
                report.people.push(Person {
                    name: mention.name.trim().to_string(),
                    role: None,
                    chunks: Vec::new(),
                });
                report.people.len() - 1
            });
            let person = &mut report.people[slot];
            if person.role.is_none() {
                person.role = mention
                    .role
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string);
            }
            push_chunk(&mut person.chunks, index);
        }

        for mention in &chunk.companies {
            let key = norm(&mention.name);
            if key.is_empty() {
                continue;
            }
            let slot = *companies_idx.entry(key).or_insert_with(|| {
                report.companies.push(Company {
                    name: mention.name.trim().to_string(),
                    industry: None,
                    chunks: Vec::new(),
                });
                report.companies.len() - 1
            });
            let company = &mut report.companies[slot];
            if company.industry.is_none() {
                company.industry = mention
                    .industry
                    .as_deref()
                    .map(str::trim)
                    .filter(|i| !i.is_empty())
                    .map(str::to_string);
            }
            push_chunk(&mut company.chunks, index);
        }

        for concept in &chunk.concepts {
            let key = norm(concept);
            if key.is_empty() {
                continue;
            }
            let slot = *concepts_idx.entry(key).or_insert_with(|| {
                report.concepts.push(Concept {
                    name: concept.trim().to_string(),
                    chunks: Vec::new(),
                });
                report.concepts.len() - 1
            });
            push_chunk(&mut report.concepts[slot].chunks, index);
        }

        for relation in &chunk.relationships {
            let key = (
                norm(&relation.person_a),
                norm(&relation.person_b),
                norm(&relation.kind),
            );
            if key.0.is_empty() || key.1.is_empty() {
                continue;
            }
            let slot = *relations_idx.entry(key).or_insert_with(|| {
                report.relationships.push(Relation {
                    person_a: relation.person_a.trim().to_string(),
                    person_b: relation.person_b.trim().to_string(),
                    kind: norm(&relation.kind),
                    evidence: String::new(),
                    chunks: Vec::new(),
                });
                report.relationships.len() - 1
            });
            let slot = &mut report.relationships[slot];
            merge_evidence(&mut slot.evidence, &relation.evidence);
            push_chunk(&mut slot.chunks, index);
        }
    }

    debug!(
        people = report.people.len(),
        companies = report.companies.len(),
        concepts = report.concepts.len(),
        relationships = report.relationships.len(),
        failed = report.failed_chunks.len(),
        "extraction results merged"
    );
    report
}

// ── Hierarchical summarization ─────────────────────────────────────────

/// Reduces many partial summaries into one via router-selected model
/// calls, batching when the fan-in is large.
pub struct SummaryReducer {
    client: Arc<dyn LlmClient>,
    router: Arc<ModelRouter>,
    concurrency: usize,
}

impl SummaryReducer {
    /// Build a reducer sharing the pipeline's concurrency bound.
    pub fn new(client: Arc<dyn LlmClient>, router: Arc<ModelRouter>, concurrency: usize) -> Self {
        Self {
            client,
            router,
            concurrency: concurrency.max(1),
        }
    }

    /// Reduce `summaries` to a single text.
    ///
    /// Empty input reduces to an empty string without a model call; a
    /// single input is returned unchanged.
    pub async fn reduce(&self, mut summaries: Vec<String>) -> Result<String, SubstrateError> {
        summaries.retain(|s| !s.trim().is_empty());
        loop {
            match summaries.len() {
                0 => return Ok(String::new()),
                1 => return Ok(summaries.remove(0)),
                n if n <= DIRECT_COMBINE_LIMIT => return self.combine(&summaries).await,
                n => {
                    debug!(inputs = n, batch = REDUCE_BATCH, "hierarchical reduce step");
                    summaries = self.reduce_batches(summaries).await?;
                }
            }
        }
    }

    /// One level of batched reduction, bounded by the concurrency policy.
    async fn reduce_batches(&self, summaries: Vec<String>) -> Result<Vec<String>, SubstrateError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let batches: Vec<Vec<String>> = summaries
            .chunks(REDUCE_BATCH)
            .map(|b| b.to_vec())
            .collect();

        let mut handles = Vec::with_capacity(batches.len());
        for batch in batches {
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&self.client);
            let router = Arc::clone(&self.router);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SubstrateError::Cancelled)?;
                combine_once(&client, &router, &batch).await
            }));
        }

        let mut reduced = Vec::with_capacity(handles.len());
        for handle in handles {
            let combined = handle
                .await
                .map_err(|e| SubstrateError::Backend(format!("reduce task panicked: {e}")))??;
            reduced.push(combined);
        }
        Ok(reduced)
    }

    async fn combine(&self, summaries: &[String]) -> Result<String, SubstrateError> {
        combine_once(&self.client, &self.router, summaries).await
    }
}

/// One combine call: route, invoke, record the outcome.
async fn combine_once(
    client: &Arc<dyn LlmClient>,
    router: &Arc<ModelRouter>,
    summaries: &[String],
) -> Result<String, SubstrateError> {
    let config = RouterConfig::for_task(TaskKind::Summarization)
        .with_priority(RoutePriority::Balanced);
    let selection = router.select(&config)?;

    let mut prompt = String::from(
        "Combine the following partial summaries into a single coherent summary. \
         Preserve every distinct fact; remove repetition.\n\n",
    );
    for (i, summary) in summaries.iter().enumerate() {
        prompt.push_str(&format!("--- Summary {} ---\n{}\n\n", i + 1, summary));
    }

    let started = Instant::now();
    let outcome = client
        .invoke(&selection.selected, InvocationRequest::new(prompt))
        .await;
    let latency = started.elapsed();

    let telemetry = router.telemetry();
    match outcome {
        Ok(text) => {
            telemetry.update(&selection.selected, latency.as_millis() as u64, true);
            crate::metrics::record_llm_latency(&selection.selected, latency);
            Ok(text)
        }
        Err(e) => {
            telemetry.update(&selection.selected, latency.as_millis() as u64, false);
            warn!(backend = %selection.selected, error = %e, "combine call failed");
            Err(e)
        }
    }
}
