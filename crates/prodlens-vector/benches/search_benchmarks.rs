//! Benchmarks for filtered passage search.
//!
//! The index holds a mix of reference passages and per-product reviews, the
//! shape the retrieval executor searches. 5,000 passages by default; set
//! `BENCH_FULL_SCALE=1` for 50,000:
//!
//! ```bash
//! BENCH_FULL_SCALE=1 cargo bench -p prodlens-vector
//! ```

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Map, Value};

use prodlens_core::types::MetadataFilter;
use prodlens_vector::{IndexEntry, MockEmbedding, VectorIndex};

const CI_PASSAGE_COUNT: usize = 5_000;
const FULL_SCALE_PASSAGE_COUNT: usize = 50_000;

/// One review per product in 40, the rest reference material.
const PRODUCTS: usize = 250;

fn passage_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_PASSAGE_COUNT
    } else {
        CI_PASSAGE_COUNT
    }
}

fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn build_index(count: usize, embedder: &MockEmbedding) -> VectorIndex {
    let index = VectorIndex::new();
    for i in 0..count {
        let (content, meta) = if i % 40 == 0 {
            (
                format!("Buyer review {}: sharp panel, decent stand, some backlight bleed.", i),
                json!({"type": "reviews", "product_id": (i / 40) % PRODUCTS}),
            )
        } else {
            (
                format!("Reference note {}: response time, refresh rate and panel types.", i),
                json!({"type": "spec"}),
            )
        };
        index
            .insert(IndexEntry {
                id: format!("p{:06}", i),
                embedding: embedder.vector_for(&content),
                content,
                metadata: metadata(meta),
            })
            .expect("insert failed");
    }
    assert_eq!(index.len(), count);
    index
}

fn bench_filtered_search(c: &mut Criterion) {
    let count = passage_count();
    let embedder = MockEmbedding::new();
    let index = build_index(count, &embedder);
    let query = embedder.vector_for("what do buyers say about backlight bleed");

    let reference = MetadataFilter::new().eq("type", "spec");
    let opinions = MetadataFilter::new().eq("type", "reviews").eq("product_id", 7);

    let mut group = c.benchmark_group("filtered_search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function(format!("unfiltered_top3_{}", count), |b| {
        b.iter(|| index.search_filtered(&query, 3, &MetadataFilter::new()).expect("search failed"))
    });
    group.bench_function(format!("reference_top3_{}", count), |b| {
        b.iter(|| index.search_filtered(&query, 3, &reference).expect("search failed"))
    });
    group.bench_function(format!("product_reviews_top3_{}", count), |b| {
        b.iter(|| {
            let hits = index.search_filtered(&query, 3, &opinions).expect("search failed");
            assert!(!hits.is_empty());
            hits
        })
    });

    group.finish();
}

criterion_group!(benches, bench_filtered_search);
criterion_main!(benches);
