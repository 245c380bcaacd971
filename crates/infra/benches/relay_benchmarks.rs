use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use bidbus_core::{AggregateId, ConsumerId, MessageId};
use bidbus_events::{Envelope, HandlerError, InMemoryTransport};
use bidbus_infra::config::RelayConfig;
use bidbus_infra::dispatch::{ConsumerDispatcher, HandlerRegistry};
use bidbus_infra::outbox::{self, InMemoryOutbox};
use bidbus_infra::projection::ProjectionStore;
use bidbus_infra::relay::OutboxRelay;
use bidbus_infra::store::{Database, Transaction};
use chrono::Utc;
use serde_json::json;

const BENCH_TYPE: &str = "BenchEvent";

/// Fill `db`'s outbox with `rows` messages spread over `aggregates` aggregates.
fn fill_outbox(db: &Database, rows: usize, aggregates: usize) {
    let ids: Vec<AggregateId> = (0..aggregates.max(1)).map(|_| AggregateId::new()).collect();
    let mut tx = db.begin();
    for i in 0..rows {
        outbox::enqueue(&mut tx, ids[i % ids.len()], BENCH_TYPE, json!({ "n": i })).unwrap();
    }
    tx.commit().unwrap();
}

fn handler<F>(f: F) -> F
where
    F: Fn(&mut Transaction<'_>, &Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    f
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbox_enqueue");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &n| {
            let db = Database::new("bench");
            let aggregate = AggregateId::new();
            b.iter(|| {
                let mut tx = db.begin();
                for i in 0..n {
                    black_box(outbox::enqueue(&mut tx, aggregate, BENCH_TYPE, json!({ "n": i })).unwrap());
                }
                tx.commit().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_relay_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_pass");

    for aggregates in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(
            BenchmarkId::new("100_rows", aggregates),
            &aggregates,
            |b, &aggregates| {
                b.iter_batched(
                    || {
                        let db = Arc::new(Database::new("bench"));
                        fill_outbox(&db, 100, aggregates);
                        let transport = Arc::new(InMemoryTransport::default());
                        transport.bind("bench", BENCH_TYPE).unwrap();
                        OutboxRelay::new(
                            InMemoryOutbox::new(db),
                            transport,
                            RelayConfig::default().with_batch_size(100),
                        )
                    },
                    |relay| black_box(relay.run_once().unwrap()),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("consumer_dispatch");

    let db = Arc::new(Database::new("bench"));
    let items = ProjectionStore::new(db.clone(), "bench_items");
    let mut registry = HandlerRegistry::new();
    let projector = handler(move |tx, env| {
        let fields = env.payload().as_object().cloned().unwrap_or_default();
        items.upsert(tx, env.aggregate_id(), env.aggregate_version(), fields);
        Ok(())
    });
    registry.register(BENCH_TYPE, projector).unwrap();
    let dispatcher = ConsumerDispatcher::new(
        ConsumerId::new("bench-consumer").unwrap(),
        db,
        registry,
        Arc::new(InMemoryTransport::new(Duration::from_secs(30))),
    );

    let envelope = |version: u64| {
        Envelope::new(MessageId::new(), BENCH_TYPE, AggregateId::new(), version, Utc::now(), json!({ "model": "GT" }))
    };

    group.bench_function("first_delivery", |b| {
        b.iter_batched(
            || envelope(1),
            |env| black_box(dispatcher.dispatch(&env).unwrap()),
            BatchSize::SmallInput,
        );
    });

    let seen = envelope(1);
    dispatcher.dispatch(&seen).unwrap();
    group.bench_function("duplicate_delivery", |b| {
        b.iter(|| black_box(dispatcher.dispatch(&seen).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_relay_pass,
    bench_dispatch
);
criterion_main!(benches);
