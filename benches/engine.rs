//! Queue engine benchmarks (Criterion).
//!
//! Run: `cargo bench` or `cargo bench --bench engine`.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use peditos_queue::{OrderKind, OrderStore, QueueEngine, Role, UserId};
use std::sync::Arc;

/// In-memory engine with `n` registered users and one admin.
fn engine_with_users(n: usize) -> (QueueEngine, Vec<UserId>, UserId) {
    let store = Arc::new(OrderStore::open_in_memory().unwrap());
    let users = (0..n)
        .map(|i| {
            store
                .insert_user(&format!("user{i}"), &format!("user{i}@example.com"), Role::User)
                .unwrap()
                .id
        })
        .collect();
    let admin = store.insert_user("admin", "admin@example.com", Role::Admin).unwrap().id;
    (QueueEngine::new(store), users, admin)
}

fn bench_admit_throughput(c: &mut Criterion) {
    const N: usize = 200;
    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(N as u64));
    group.bench_function("admit_200", |b| {
        b.iter_batched(
            || engine_with_users(N),
            |(engine, users, _)| {
                for owner in users {
                    engine.admit(owner, OrderKind::Product).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_promote_next(c: &mut Criterion) {
    const QUEUED: usize = 200;
    const PROMOTES: usize = 50;
    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(PROMOTES as u64));
    group.bench_function("promote_50_from_200_queued", |b| {
        b.iter_batched(
            || {
                let (engine, users, admin) = engine_with_users(QUEUED);
                for owner in users {
                    engine.admit(owner, OrderKind::Service).unwrap();
                }
                (engine, admin)
            },
            |(engine, admin)| {
                for _ in 0..PROMOTES {
                    engine.promote_next(admin).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_finalize_head(c: &mut Criterion) {
    const QUEUED: usize = 200;
    const FINALIZES: usize = 50;
    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(FINALIZES as u64));
    group.bench_function("finalize_50_from_200_queued", |b| {
        b.iter_batched(
            || {
                let (engine, users, admin) = engine_with_users(QUEUED);
                let ids: Vec<_> = users
                    .into_iter()
                    .map(|owner| engine.admit(owner, OrderKind::Support).unwrap().id)
                    .collect();
                (engine, ids, admin)
            },
            |(engine, ids, admin)| {
                for id in ids.into_iter().take(FINALIZES) {
                    engine.finalize(id, admin).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_admit_throughput, bench_promote_next, bench_finalize_head);
criterion_main!(benches);
