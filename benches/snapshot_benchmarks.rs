use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pico_telemetry::{
    platform::sim::{SimBoard, SimHeap, SimRadio},
    transport::sim::SimBroker,
    AgentConfig, CategorySet, FailureCounters, LinkManager, MetricsCollector, Supervisor,
};
use std::time::Duration;

fn associated_link() -> LinkManager<SimRadio> {
    LinkManager::new(SimRadio::associated(), "bench", "secret")
}

/// Benchmark snapshot collection for each category preset
fn bench_snapshot_collection(c: &mut Criterion) {
    let link = associated_link();
    let counters = FailureCounters::default();

    for (name, categories) in [("full", CategorySet::full()), ("minimal", CategorySet::minimal())] {
        let mut collector = MetricsCollector::new(SimBoard::new(), SimHeap::new()).with_categories(categories);
        c.bench_with_input(BenchmarkId::new("snapshot_collection", name), &name, |b, _| {
            b.iter(|| collector.snapshot(&link, &counters).expect("Should collect snapshot"))
        });
    }

    let mut probing = MetricsCollector::new(SimBoard::new(), SimHeap::new()).with_fragmentation_probe(true);
    c.bench_function("snapshot_collection_with_probe", |b| {
        b.iter(|| probing.snapshot(&link, &counters).expect("Should collect snapshot"))
    });
}

/// Benchmark JSON encoding of a full snapshot
fn bench_json_encoding(c: &mut Criterion) {
    let link = associated_link();
    let mut collector = MetricsCollector::new(SimBoard::new(), SimHeap::new());
    let snapshot = collector
        .snapshot(&link, &FailureCounters::default())
        .expect("Should collect snapshot");

    c.bench_function("json_encoding", |b| {
        b.iter(|| snapshot.to_json().expect("Should encode"))
    });

    c.bench_function("json_pretty_encoding", |b| {
        b.iter(|| serde_json::to_string_pretty(&snapshot).expect("Should encode pretty"))
    });
}

/// Benchmark one healthy loop iteration against the simulator
fn bench_publish_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Should create tokio runtime");

    let config = AgentConfig::new("bench", "secret", "localhost").with_publish_interval(0);
    let mut supervisor = Supervisor::new(
        &config,
        SimRadio::associated(),
        SimBroker::new(),
        SimBoard::new(),
        SimHeap::new(),
    );
    rt.block_on(supervisor.transport_mut().connect());

    c.bench_function("publish_cycle", |b| {
        b.iter(|| rt.block_on(supervisor.run_once()).expect("Should complete cycle"))
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_snapshot_collection, bench_json_encoding, bench_publish_cycle
);
criterion_main!(benches);
