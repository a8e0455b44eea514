//! Quick benchmarks for CI and development feedback.
//!
//! Run with:
//! ```
//! cargo bench --bench bench_quick
//! ```

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rolodex_rs::config::LoaderConfig;
use rolodex_rs::test_support::{generate_address_book, generate_insert_ops};
use rolodex_rs::{
    Account, AggregationManager, ApplyTuning, BatchApplier, CancelToken, ContactAssembler,
    ContactRef, MemoryStore, NotificationGateway, PersistentStore, StaticAccountTypes,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// LOAD BENCHMARKS
// =============================================================================

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("quick/load");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    let store = Arc::new(MemoryStore::new());
    let book = generate_address_book(&store, 2_000, 0.2, 42);
    let mut assembler = ContactAssembler::new(
        store,
        Arc::new(StaticAccountTypes::new()),
        Arc::new(NotificationGateway::new()),
        LoaderConfig {
            load_group_metadata: true,
            format_phone_numbers: true,
            ..LoaderConfig::default()
        },
    );
    let targets: Vec<ContactRef> = book
        .raw_contacts
        .iter()
        .step_by(50)
        .map(|raw| ContactRef::RawContact(*raw))
        .collect();

    group.throughput(Throughput::Elements(targets.len() as u64));
    group.bench_function("raw_contact_refs", |b| {
        b.iter(|| {
            for target in &targets {
                black_box(assembler.load(target));
            }
        })
    });

    group.finish();
}

// =============================================================================
// APPLY BENCHMARKS
// =============================================================================

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("quick/apply");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    let op_count = 2_000usize;
    let ops = generate_insert_ops(&Account::local(), op_count, 7);
    group.throughput(Throughput::Elements(op_count as u64));

    for max_batch in [100usize, 499] {
        group.bench_with_input(
            BenchmarkId::new("memory", format!("max_batch_{max_batch}")),
            &max_batch,
            |b, &max_batch| {
                b.iter_batched(
                    || {
                        BatchApplier::new(
                            Arc::new(MemoryStore::new()),
                            ApplyTuning {
                                max_batch,
                                ..ApplyTuning::default()
                            },
                        )
                    },
                    |applier| black_box(applier.apply(&ops, &CancelToken::new()).unwrap()),
                    BatchSize::SmallInput,
                )
            },
        );
    }

    group.bench_function(BenchmarkId::new("persistent", "max_batch_499"), |b| {
        b.iter_batched(
            || {
                let temp = TempDir::new().expect("temp dir");
                let store = PersistentStore::open(temp.path()).expect("open store");
                (temp, BatchApplier::new(Arc::new(store), ApplyTuning::default()))
            },
            |(_temp, applier)| black_box(applier.apply(&ops, &CancelToken::new()).unwrap()),
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

// =============================================================================
// AGGREGATION BENCHMARKS
// =============================================================================

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("quick/join");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    for contacts in [2usize, 8] {
        group.bench_with_input(BenchmarkId::new("contacts", contacts), &contacts, |b, &contacts| {
            b.iter_batched(
                || {
                    let store = Arc::new(MemoryStore::new());
                    let book = generate_address_book(&store, 500, 0.0, 11);
                    let ids: Vec<_> = book
                        .raw_contacts
                        .iter()
                        .take(contacts)
                        .filter_map(|raw| store.contact_id_of(*raw))
                        .collect();
                    let manager = AggregationManager::new(
                        BatchApplier::new(store, ApplyTuning::default()),
                        Arc::new(NotificationGateway::new()),
                    );
                    (manager, ids)
                },
                |(manager, ids)| black_box(manager.join(&ids, &CancelToken::new())),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_load, bench_apply, bench_join);
criterion_main!(benches);
