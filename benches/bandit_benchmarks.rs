//! Benchmarks for the bandit hot paths
//!
//! - Beta sampling and Wilson intervals (pure math)
//! - Arm choice over a loaded test
//! - Full select / record round trips on both stores

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use subject_optimizer::bandit::selector::{pick_round_robin, pick_thompson};
use subject_optimizer::bandit::types::{Fingerprint, Test, TestId, Variant, VariantId};
use subject_optimizer::bandit::{BanditConfig, BanditSelector};
use subject_optimizer::stats::{sample_thompson_with, wilson_score};
use subject_optimizer::storage::{BanditStore, MemoryBanditStore, RocksBanditStore};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn variants_with_history(arms: u32) -> Vec<Variant> {
    let test_id = TestId::new();
    (0..arms)
        .map(|i| {
            let mut v = Variant::new(test_id, i, format!("Subject {i}"));
            v.counters.times_selected = 1_000 + u64::from(i);
            v.counters.times_sent = 1_000;
            v.counters.conversions = 20 + u64::from(i) * 5;
            v
        })
        .collect()
}

fn seed(store: &Arc<dyn BanditStore>) -> (TestId, VariantId) {
    let test = Test::new(Fingerprint::of("bench content"), None);
    let variants: Vec<Variant> = (0..5)
        .map(|i| Variant::new(test.id, i, format!("Subject {i}")))
        .collect();
    let first = variants[0].id;
    store
        .create_test(&test, &variants)
        .expect("Failed to seed test");
    (test.id, first)
}

// ============================================================================
// BENCHMARKS
// ============================================================================

fn bench_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("stats");
    let mut rng = StdRng::seed_from_u64(7);

    group.bench_function("sample_thompson", |b| {
        b.iter(|| sample_thompson_with(&mut rng, black_box(37), black_box(1_000)))
    });
    group.bench_function("wilson_score", |b| {
        b.iter(|| wilson_score(black_box(37), black_box(1_000)))
    });
    group.finish();
}

fn bench_arm_choice(c: &mut Criterion) {
    let mut group = c.benchmark_group("arm_choice");
    let mut rng = StdRng::seed_from_u64(7);

    for arms in [2u32, 5, 20] {
        let variants = variants_with_history(arms);
        group.bench_with_input(BenchmarkId::new("round_robin", arms), &variants, |b, v| {
            b.iter(|| pick_round_robin(black_box(v)))
        });
        group.bench_with_input(BenchmarkId::new("thompson", arms), &variants, |b, v| {
            b.iter(|| pick_thompson(black_box(v), &mut rng))
        });
    }
    group.finish();
}

fn bench_round_trips(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    group.measurement_time(Duration::from_secs(10));

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let rocks: Arc<dyn BanditStore> = Arc::new(
        RocksBanditStore::open(temp_dir.path(), Duration::from_secs(1))
            .expect("Failed to open RocksDB store"),
    );
    let memory: Arc<dyn BanditStore> = Arc::new(MemoryBanditStore::new());

    for store in [memory, rocks] {
        let name = store.backend_name();
        let (test_id, variant_id) = seed(&store);
        let selector = BanditSelector::new(
            store,
            BanditConfig {
                seed: Some(7),
                ..Default::default()
            },
        );

        group.bench_function(BenchmarkId::new("select_variant", name), |b| {
            b.iter(|| selector.select_variant(black_box(test_id)).expect("select failed"))
        });
        group.bench_function(BenchmarkId::new("record_send", name), |b| {
            b.iter(|| {
                selector
                    .record_event(black_box(variant_id), "send", BTreeMap::new())
                    .expect("record failed")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_stats, bench_arm_choice, bench_round_trips);
criterion_main!(benches);
