//! Reducer benchmarks — the dedup merge runs once per completed pipeline.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use llm_substrate::reduce::{
    merge_extractions, ExtractionChunk, PersonMention, RelationMention,
};
use std::collections::BTreeMap;

fn chunk_results(chunks: u32, entities_per_chunk: usize) -> BTreeMap<u32, ExtractionChunk> {
    (0..chunks)
        .map(|i| {
            let people = (0..entities_per_chunk)
                .map(|p| PersonMention {
                    // ~30% collision rate across chunks
                    name: format!("Person {}", (p + i as usize * 7) % (entities_per_chunk * 3)),
                    role: (p % 4 == 0).then(|| "Analyst".to_string()),
                })
                .collect();
            let relationships = (0..entities_per_chunk / 2)
                .map(|r| RelationMention {
                    person_a: format!("Person {r}"),
                    person_b: format!("Person {}", r + 1),
                    kind: "works_with".into(),
                    evidence: format!("observed together in section {i}-{r}"),
                })
                .collect();
            (
                i,
                ExtractionChunk {
                    index: i,
                    summary: format!("summary of chunk {i}"),
                    people,
                    relationships,
                    ..ExtractionChunk::default()
                },
            )
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let small = chunk_results(10, 20);
    let large = chunk_results(200, 50);

    c.bench_function("merge_10_chunks", |b| {
        b.iter(|| merge_extractions(black_box(&small)));
    });
    c.bench_function("merge_200_chunks", |b| {
        b.iter(|| merge_extractions(black_box(&large)));
    });
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
