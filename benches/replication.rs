//! Replication benchmarks
//!
//! Change-frame fast path against the byte diff, and relay fan-out with and
//! without the shared delta cache.
//!
//! Run with: cargo bench --bench replication

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use snapshot_replication::config::ReplicationConfig;
use snapshot_replication::metrics::ReplicationMetrics;
use snapshot_replication::net::{ConsumerKind, DeltaComputer, ReplicationClient, Replicator};
use snapshot_replication::snapshot::packed_entity::VisibilityMask;
use snapshot_replication::snapshot::packer::{EntityPacker, LiveEntity, WorldSource};
use snapshot_replication::snapshot::{
    ClassDescriptor, EntitySlot, PropertyValue, Snapshot, SnapshotManager, Tick,
};

/// Every slot filled with one class of `props` integer properties
struct BenchWorld {
    tick: Tick,
    class: Arc<ClassDescriptor>,
    values: Vec<Vec<PropertyValue>>,
}

impl BenchWorld {
    fn new(entities: usize, props: usize) -> Self {
        Self {
            tick: 1,
            class: Arc::new(ClassDescriptor::new(1, "bench", props)),
            values: vec![vec![PropertyValue::Int(0); props]; entities],
        }
    }

    /// Next tick with `changes` random properties rewritten per entity
    fn advance(&mut self, rng: &mut StdRng, changes: usize) {
        self.tick += 1;
        for values in self.values.iter_mut() {
            for _ in 0..changes {
                let prop = rng.gen_range(0..values.len());
                values[prop] = PropertyValue::Int(rng.gen_range(1..1_000_000));
            }
        }
    }
}

impl WorldSource for BenchWorld {
    fn current_tick(&self) -> Tick {
        self.tick
    }

    fn entity_slot_count(&self) -> usize {
        self.values.len()
    }

    fn live_entities(&self) -> Vec<LiveEntity> {
        self.values
            .iter()
            .enumerate()
            .map(|(slot, values)| LiveEntity {
                slot: slot as EntitySlot,
                class: Arc::clone(&self.class),
                serial: slot as u32 + 1,
                values: values.clone(),
                visibility: VisibilityMask::all_visible(),
            })
            .collect()
    }
}

/// Two consecutive snapshots of the same world
fn timeline(entities: usize, props: usize, changes: usize) -> (Arc<SnapshotManager>, Arc<Snapshot>, Arc<Snapshot>) {
    let manager = Arc::new(SnapshotManager::new(Arc::new(ReplicationMetrics::new())));
    let packer = EntityPacker::new(Arc::clone(&manager));
    let mut rng = StdRng::seed_from_u64(11);
    let mut world = BenchWorld::new(entities, props);

    let first = packer.pack_snapshot(&world, 0).unwrap();
    world.advance(&mut rng, changes);
    let second = packer.pack_snapshot(&world, 0).unwrap();
    (manager, first, second)
}

/// Changed-property lookup for one entity at various class sizes
fn bench_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta");
    let metrics = ReplicationMetrics::new();

    for props in [64, 256, 1024] {
        let (_manager, from, to) = timeline(1, props, 2);
        let old = Arc::clone(from.entity(0).unwrap());
        let new = Arc::clone(to.entity(0).unwrap());
        let computer = DeltaComputer::new(&metrics);

        group.throughput(Throughput::Elements(props as u64));
        group.bench_with_input(BenchmarkId::new("change_frames", props), &props, |b, _| {
            b.iter(|| black_box(computer.calc_delta(Some((old.as_ref(), from.tick())), &new)))
        });
        group.bench_with_input(BenchmarkId::new("byte_diff", props), &props, |b, _| {
            b.iter(|| black_box(DeltaComputer::diff_slow(&old, &new)))
        });
    }
    group.finish();
}

/// One tick of updates for `relays` consumers sharing a baseline
fn bench_relay_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_fanout");
    group.sample_size(30);

    for relays in [4, 16, 64] {
        for cached in [false, true] {
            let (manager, base, next) = timeline(256, 32, 3);
            let replicator = Replicator::new(
                manager,
                ReplicationConfig {
                    delta_cache_enabled: cached,
                    max_packet_bytes: 1 << 20,
                    ..Default::default()
                },
            );

            let mut clients: Vec<_> = (0..relays)
                .map(|id| ReplicationClient::new(id, ConsumerKind::Relay, 8))
                .collect();
            replicator.prepare_tick(&base);
            for client in clients.iter_mut() {
                replicator.build_update(client, &base).unwrap();
                replicator.acknowledge_received(client, base.tick()).unwrap();
            }
            replicator.prepare_tick(&next);

            let name = if cached { "cached" } else { "uncached" };
            group.throughput(Throughput::Elements(relays as u64));
            group.bench_with_input(BenchmarkId::new(name, relays), &relays, |b, _| {
                b.iter(|| {
                    replicator.cache().flush();
                    black_box(replicator.build_updates(&mut clients, &next))
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_delta, bench_relay_fanout);

criterion_main!(benches);
