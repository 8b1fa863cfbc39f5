use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use windowtally::event::parse::parse_publish;
use windowtally::event::{Attributes, Event};
use windowtally::fanout::{Fanout, KeyFilter};
use windowtally::store::{AggregationStore, WindowedKey};
use windowtally::topology::{DeadLetterSink, EventFilter, Topology, Watermark};
use windowtally::window::{Window, WindowAssigner};

fn page_view(ts: i64, page: &str) -> Event {
    let mut attributes = Attributes::new();
    attributes.insert("page".into(), json!(page));
    attributes.insert("duration".into(), json!(42));
    Event::new("bench-user", ts, attributes)
}

fn build_topology(fanout: Fanout) -> Topology {
    Topology::new(
        WindowAssigner::from_millis(60_000, 15_000).expect("valid geometry"),
        Arc::new(AggregationStore::new(5_000)),
        Arc::new(Watermark::new()),
        fanout,
        Arc::new(DeadLetterSink::new(1_024)),
    )
    .with_filter(Some(EventFilter::new("duration", 0.0)))
}

fn bench_assign(c: &mut Criterion) {
    let tumbling = WindowAssigner::from_millis(5_000, 5_000).expect("tumbling");
    let hopping = WindowAssigner::from_millis(60_000, 15_000).expect("hopping");
    let mut buf = Vec::with_capacity(4);

    c.bench_function("window/assign_tumbling", |b| {
        b.iter(|| {
            tumbling
                .assign_into(black_box(1_700_000_123_456), &mut buf)
                .expect("assign");
            black_box(buf.len())
        })
    });

    c.bench_function("window/assign_hopping", |b| {
        b.iter(|| {
            hopping
                .assign_into(black_box(1_700_000_123_456), &mut buf)
                .expect("assign");
            black_box(buf.len())
        })
    });
}

fn bench_store(c: &mut Criterion) {
    let store = AggregationStore::new(0);
    let hot = WindowedKey::new("P1", Window { start: 0, end: 5_000 });

    c.bench_function("store/increment_hot_key", |b| {
        b.iter(|| store.increment(black_box(&hot)).expect("increment"))
    });

    let keys: Vec<String> = (0..1_024).map(|i| format!("page-{i}")).collect();
    let windows = [
        Window { start: 0, end: 10_000 },
        Window {
            start: 5_000,
            end: 15_000,
        },
    ];
    let mut i = 0usize;
    c.bench_function("store/increment_all_spread_keys", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            store
                .increment_all(black_box(&keys[i]), &windows)
                .expect("increment_all")
        })
    });
}

fn bench_topology(c: &mut Criterion) {
    let fanout = Fanout::new(1_024, 0);
    let _subscriber = fanout.subscribe(KeyFilter::All).expect("subscribe");
    let topology = build_topology(fanout);
    let mut ts = 0i64;

    c.bench_function("topology/process_with_subscriber", |b| {
        b.iter(|| {
            ts += 1;
            topology
                .process(black_box(page_view(ts, "P1")))
                .expect("process")
        })
    });
}

fn bench_parse(c: &mut Criterion) {
    let body = br#"{"stream":"pageviews","key":"u1","timestamp":"2024-01-01T00:00:00Z","attributes":{"page":"P1","duration":12}}"#;

    c.bench_function("parse/publish_rfc3339", |b| {
        b.iter(|| parse_publish(black_box(body), 0).expect("parse"))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_assign(c);
    bench_store(c);
    bench_topology(c);
    bench_parse(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
