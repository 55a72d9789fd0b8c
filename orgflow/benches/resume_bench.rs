//! Benchmarks for resume planning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use orgflow::core::{RecordMetadata, StageRecord};
use orgflow::pipeline::resume;
use orgflow::pipeline::ResumePolicy;
use orgflow::registry::StageRegistry;
use serde_json::json;
use std::collections::HashMap;

fn registry(upstream: usize) -> StageRegistry {
    let mut builder = StageRegistry::builder();
    for i in 0..upstream {
        builder = builder.stage(format!("stage-{i}"), format!("Stage {i}"));
    }
    builder.synthesis("synthesis", "Synthesis").build().unwrap()
}

/// Completed records for every stage, hashed the way a run writes them.
fn records(registry: &StageRegistry) -> HashMap<String, StageRecord> {
    let mut records = HashMap::new();
    for stage in registry.stages() {
        let prior = resume::prior_outputs(registry, &records, stage.position());
        let record = StageRecord::completed(
            "acme-corp",
            stage.id(),
            json!({ "summary": format!("{} findings", stage.display_name()), "items": [1, 2, 3] }),
        )
        .with_metadata(RecordMetadata {
            input_hash: Some(resume::input_hash(&prior)),
            ..RecordMetadata::default()
        });
        records.insert(stage.id().to_string(), record);
    }
    records
}

fn resume_benchmark(c: &mut Criterion) {
    for upstream in [4, 16] {
        let registry = registry(upstream);
        let records = records(&registry);

        c.bench_function(&format!("plan_{upstream}_stages"), |b| {
            b.iter(|| resume::plan(black_box(&registry), black_box(&records), ResumePolicy::RetryFailed));
        });

        let prior = resume::prior_outputs(&registry, &records, upstream);
        c.bench_function(&format!("input_hash_{upstream}_stages"), |b| {
            b.iter(|| resume::input_hash(black_box(&prior)));
        });
    }
}

criterion_group!(benches, resume_benchmark);
criterion_main!(benches);
