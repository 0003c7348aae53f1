//! Benchmarks for candidate selection and the lock registry
//!
//! Target: scheduling across 1K hosts well under a millisecond

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use localpv_provisioner::controlplane::{HostTopology, TopologySegment, GIB};
use localpv_provisioner::crd::{LocalVolume, LocalVolumeSpec, NODE_ID_LABEL};
use localpv_provisioner::{LockRegistry, Scheduler, SchedulingAlgorithm};
use std::collections::BTreeMap;

fn inventory(hosts: usize) -> Vec<HostTopology> {
    (0..hosts)
        .map(|i| {
            let mut labels = BTreeMap::new();
            labels.insert("zone".to_string(), format!("z{}", i % 4));
            HostTopology::new(format!("node-{:04}", i), labels)
        })
        .collect()
}

fn volumes(hosts: usize, count: usize) -> Vec<LocalVolume> {
    (0..count)
        .map(|i| {
            let owner = format!("node-{:04}", (i * 7) % hosts);
            LocalVolume::pending(
                &format!("pvc-{}", i),
                "openebs",
                LocalVolumeSpec::new(owner, "tank", (1 + i as u64 % 8) * GIB),
            )
        })
        .collect()
}

fn zone(value: &str) -> TopologySegment {
    let mut segment = BTreeMap::new();
    segment.insert("zone".to_string(), value.to_string());
    segment
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");

    for hosts in [10usize, 100, 1000] {
        let inventory = inventory(hosts);
        let load = Scheduler::load_by_host(SchedulingAlgorithm::VolumeWeighted, &volumes(hosts, hosts * 5), "tank");
        let constraint = vec![zone("z0"), zone("z1"), zone("z2"), zone("z3")];

        group.throughput(Throughput::Elements(hosts as u64));
        group.bench_with_input(BenchmarkId::new("select", hosts), &hosts, |b, _| {
            b.iter(|| Scheduler::select(black_box(&constraint), black_box(&inventory), black_box(&load)));
        });
    }

    let inventory = inventory(1000);
    let mut pinned = BTreeMap::new();
    pinned.insert(NODE_ID_LABEL.to_string(), "node-0500".to_string());
    let constraint = vec![pinned];
    group.bench_function("select_pinned_host", |b| {
        b.iter(|| Scheduler::select(black_box(&constraint), black_box(&inventory), &Default::default()));
    });

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    let records = volumes(100, 10_000);

    group.throughput(Throughput::Elements(records.len() as u64));
    for algorithm in [SchedulingAlgorithm::VolumeWeighted, SchedulingAlgorithm::CapacityWeighted] {
        group.bench_with_input(BenchmarkId::new("load_by_host", algorithm), &algorithm, |b, algorithm| {
            b.iter(|| Scheduler::load_by_host(*algorithm, black_box(&records), "tank"));
        });
    }

    group.finish();
}

fn bench_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("locks");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let locks = LockRegistry::new();

    group.bench_function("acquire_release", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("volume/pvc-{}", counter % 1000);
            rt.block_on(async {
                let guard = locks.acquire(black_box(&key)).await.unwrap();
                drop(guard);
            });
        });
    });

    group.bench_function("acquire_pair", |b| {
        b.iter(|| {
            rt.block_on(async {
                let guard = locks
                    .acquire_both(black_box("volume/pvc-1"), black_box("snapshot/snap-1"))
                    .await
                    .unwrap();
                drop(guard);
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_select, bench_load, bench_locks);
criterion_main!(benches);
