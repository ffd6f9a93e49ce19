//! Replication soak driver
//!
//! Runs a randomized world through the full pipeline (pack, delta, encode,
//! decode, acknowledge) for players and relays, and checks every decoded
//! client state against the snapshot it was built from.
//!
//! Tuning: SOAK_TICKS, SOAK_SLOTS, SOAK_PLAYERS, SOAK_RELAYS, SOAK_SEED,
//! SOAK_LOSS_PERCENT plus the REPLICATION_* variables.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use snapshot_replication::config::ReplicationConfig;
use snapshot_replication::constants::entity::SERIAL_NUMBER_BITS;
use snapshot_replication::constants::snapshot::DEFAULT_SET;
use snapshot_replication::metrics::ReplicationMetrics;
use snapshot_replication::net::{
    decode_update, AckBuffer, AckSender, ClientEntityTable, ClientId, ConsumerKind,
    ReplicationClient, ReplicationError, Replicator,
};
use snapshot_replication::snapshot::packed_entity::{ProxyGroup, VisibilityMask};
use snapshot_replication::snapshot::packer::{EntityPacker, LiveEntity, WorldSource};
use snapshot_replication::snapshot::{
    BaselineUpdate, ClassDescriptor, ClassRegistry, EntitySlot, PropertyValue, Snapshot,
    SnapshotManager, Tick,
};

/// Owner-only properties of the mover class
const PRIVATE_PROPS: [u16; 2] = [6, 7];

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {} '{}', using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

struct SimEntity {
    class: usize,
    serial: u32,
    values: Vec<PropertyValue>,
    owner: Option<ClientId>,
}

struct SoakWorld {
    rng: StdRng,
    tick: Tick,
    classes: Vec<Arc<ClassDescriptor>>,
    slots: Vec<Option<SimEntity>>,
    next_serial: u32,
    players: usize,
}

impl SoakWorld {
    fn new(seed: u64, slot_count: usize, players: usize, registry: &mut ClassRegistry) -> anyhow::Result<Self> {
        let mover = registry.register(ClassDescriptor::new(1, "mover", 8))?;
        let crate_class = registry.register(
            ClassDescriptor::new(2, "crate", 4).with_baseline(&[
                PropertyValue::Bool(false),
                PropertyValue::Int(0),
                PropertyValue::Float(0.0),
                PropertyValue::Text("crate".into()),
            ])?,
        )?;

        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            tick: 0,
            classes: vec![mover, crate_class],
            slots: (0..slot_count).map(|_| None).collect(),
            next_serial: 1,
            players,
        })
    }

    fn spawn(&mut self) -> SimEntity {
        let class = self.rng.gen_range(0..self.classes.len());
        let values = match class {
            0 => (0..8).map(|_| PropertyValue::Int(self.rng.gen_range(-1000..1000))).collect(),
            _ => vec![
                PropertyValue::Bool(false),
                PropertyValue::Int(0),
                PropertyValue::Float(self.rng.gen_range(0.0..1.0)),
                PropertyValue::Text("crate".into()),
            ],
        };
        let serial = self.next_serial;
        self.next_serial = (self.next_serial + 1) % (1 << SERIAL_NUMBER_BITS);
        SimEntity {
            class,
            serial,
            values,
            owner: None,
        }
    }

    fn mutate(rng: &mut StdRng, value: &mut PropertyValue) {
        match value {
            PropertyValue::Bool(b) => *b = !*b,
            PropertyValue::Int(i) => *i = rng.gen_range(-1000..1000),
            PropertyValue::Float(f) => *f = rng.gen_range(0.0..1.0),
            PropertyValue::Text(t) => *t = format!("crate-{}", rng.gen_range(0..4)),
            _ => {}
        }
    }

    /// Advance one tick; destroyed slots may be reported as explicit deletes
    fn step(&mut self, manager: &SnapshotManager) {
        self.tick += 1;
        for slot in 0..self.slots.len() {
            let roll: f64 = self.rng.gen();
            if self.slots[slot].is_none() {
                if roll < 0.05 {
                    let entity = self.spawn();
                    self.slots[slot] = Some(entity);
                }
                continue;
            }
            if roll < 0.02 {
                self.slots[slot] = None;
                if self.rng.gen_bool(0.5) {
                    manager.add_explicit_delete(DEFAULT_SET, slot as EntitySlot);
                }
                continue;
            }

            let players = self.players;
            let rng = &mut self.rng;
            let Some(entity) = self.slots[slot].as_mut() else {
                continue;
            };
            if roll < 0.3 {
                let count = entity.values.len();
                for _ in 0..rng.gen_range(1..=3) {
                    let prop = rng.gen_range(0..count);
                    Self::mutate(rng, &mut entity.values[prop]);
                }
            }
            if entity.class == 0 && rng.gen_bool(0.01) {
                entity.owner = (players > 0 && rng.gen_bool(0.5)).then(|| rng.gen_range(0..players));
            }
        }
    }

    fn visibility(entity: &SimEntity) -> VisibilityMask {
        match (entity.class, entity.owner) {
            (0, Some(owner)) => {
                VisibilityMask::all_visible().with_group(ProxyGroup::new(&PRIVATE_PROPS, &[owner]))
            }
            _ => VisibilityMask::all_visible(),
        }
    }
}

impl WorldSource for SoakWorld {
    fn current_tick(&self) -> Tick {
        self.tick
    }

    fn entity_slot_count(&self) -> usize {
        self.slots.len()
    }

    fn live_entities(&self) -> Vec<LiveEntity> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entity)| {
                let entity = entity.as_ref()?;
                Some(LiveEntity {
                    slot: slot as EntitySlot,
                    class: Arc::clone(&self.classes[entity.class]),
                    serial: entity.serial,
                    values: entity.values.clone(),
                    visibility: Self::visibility(entity),
                })
            })
            .collect()
    }
}

/// Receiving side of one consumer
struct Receiver {
    table: ClientEntityTable,
    acks: AckSender,
}

/// Compare a decoded client state with the snapshot it claims to mirror
fn verify(
    client: &ReplicationClient,
    table: &ClientEntityTable,
    snapshot: &Snapshot,
) -> anyhow::Result<()> {
    let tick = snapshot.tick();
    let expected: Vec<EntitySlot> = snapshot
        .valid_slots()
        .iter()
        .copied()
        .filter(|&slot| client.can_see(slot))
        .collect();
    let held = table.slots(tick);
    if held != expected {
        bail!(
            "client {} tick {}: holds {:?}, expected {:?}",
            client.id(),
            tick,
            held,
            expected
        );
    }

    let serial_mask = (1u32 << SERIAL_NUMBER_BITS) - 1;
    for &slot in &expected {
        let (Some(packed), Some(decoded)) = (snapshot.entity(slot), table.entity(tick, slot)) else {
            bail!("client {} tick {}: slot {} missing", client.id(), tick, slot);
        };
        if decoded.serial != packed.serial() & serial_mask || decoded.class != packed.class().id() {
            bail!("client {} tick {}: slot {} identity mismatch", client.id(), tick, slot);
        }
        for prop in 0..packed.class().flattened_property_count() as u16 {
            let visible = !client.kind().applies_proxy_culling()
                || packed.visibility().is_visible(prop, client.id());
            if !visible {
                continue;
            }
            if decoded.field(prop) != Some(packed.data().field(prop)) {
                bail!(
                    "client {} tick {}: slot {} prop {} diverged",
                    client.id(),
                    tick,
                    slot,
                    prop
                );
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Replication soak v{}", env!("CARGO_PKG_VERSION"));

    let config = ReplicationConfig::load_or_default();
    if let Err(reason) = config.validate() {
        bail!("invalid configuration: {reason}");
    }

    let ticks: Tick = env_or("SOAK_TICKS", 600);
    let slot_count: usize = env_or("SOAK_SLOTS", 256usize).min(config.max_entity_slots);
    let players: usize = env_or("SOAK_PLAYERS", 8);
    let relays: usize = env_or("SOAK_RELAYS", 2);
    let seed: u64 = env_or("SOAK_SEED", 7);
    let loss_percent: u32 = env_or("SOAK_LOSS_PERCENT", 5u32).min(100);
    info!(ticks, slot_count, players, relays, seed, loss_percent, "soak configured");

    let metrics = Arc::new(ReplicationMetrics::new());
    let manager = Arc::new(SnapshotManager::from_config(Arc::clone(&metrics), &config));
    let packer = EntityPacker::new(Arc::clone(&manager));
    let replicator = Replicator::new(Arc::clone(&manager), config.clone());
    let ack_buffer = AckBuffer::new(config.ack_buffer_capacity);

    let mut registry = ClassRegistry::new();
    let mut world = SoakWorld::new(seed, slot_count, players, &mut registry)?;
    let mut net_rng = StdRng::seed_from_u64(seed ^ 0x5eed);

    let mut clients: Vec<ReplicationClient> = (0..players + relays)
        .map(|id| {
            let kind = if id < players {
                ConsumerKind::Player
            } else {
                ConsumerKind::Relay
            };
            ReplicationClient::new(id, kind, config.max_client_frames)
        })
        .collect();
    let mut receivers: Vec<Receiver> = clients
        .iter()
        .map(|_| Receiver {
            table: ClientEntityTable::default(),
            acks: ack_buffer.sender(),
        })
        .collect();

    // (deliver at tick, client, update bytes)
    let mut in_flight: VecDeque<(Tick, ClientId, Vec<u8>)> = VecDeque::new();
    let mut history: BTreeMap<Tick, Arc<Snapshot>> = BTreeMap::new();
    let mut verified = 0u64;

    for _ in 0..ticks {
        world.step(&manager);
        let snapshot = packer.pack_snapshot(&world, DEFAULT_SET)?;
        let tick = snapshot.tick();
        history.insert(tick, Arc::clone(&snapshot));
        while history.len() > 64 {
            history.pop_first();
        }

        // Players occasionally change which entities upstream lets them see
        if tick % 50 == 1 {
            for client in clients.iter_mut().filter(|c| c.kind() == ConsumerKind::Player) {
                let visible: Vec<EntitySlot> = (0..slot_count as EntitySlot)
                    .filter(|_| net_rng.gen_bool(0.8))
                    .collect();
                client.set_visible_entities(Some(visible.as_slice()));
            }
        }

        let accepted = replicator.apply_acks(&mut clients, &ack_buffer)?;
        replicator.prepare_tick(&snapshot);

        let results = replicator.build_updates(&mut clients, &snapshot);
        for (id, result) in results.into_iter().enumerate() {
            match result {
                Ok(update) => {
                    if net_rng.gen_range(0..100) < loss_percent {
                        continue;
                    }
                    let delay = net_rng.gen_range(0..4);
                    in_flight.push_back((tick + delay, id, update.bytes));
                }
                // Counted and logged by the replicator; the baseline stays put
                Err(ReplicationError::DidNotFit { .. }) => {}
                Err(e) => return Err(e).context("building update"),
            }
        }

        let mut pending = VecDeque::with_capacity(in_flight.len());
        for (deliver_at, id, bytes) in in_flight.drain(..) {
            if deliver_at > tick {
                pending.push_back((deliver_at, id, bytes));
                continue;
            }
            let decoded = decode_update(&bytes).context("decoding update")?;
            let receiver = &mut receivers[id];

            // Instance baselines travel on their own reliable channel
            let baselines = manager
                .instance_baselines()
                .updates_since(receiver.table.baseline_version());
            if !baselines.is_empty() {
                let wire = baselines.encode()?;
                receiver
                    .table
                    .apply_baselines(&BaselineUpdate::decode(&wire)?)
                    .context("applying instance baselines")?;
            }

            receiver
                .table
                .apply(&decoded, &registry)
                .with_context(|| format!("client {id} applying tick {}", decoded.to_tick))?;

            // Visibility lists change every 50 ticks; only check updates built
            // under the current list
            let same_epoch = (decoded.to_tick - 1) / 50 == (tick - 1) / 50;
            if let Some(built_from) = history.get(&decoded.to_tick).filter(|_| same_epoch) {
                verify(&clients[id], &receiver.table, built_from)?;
                verified += 1;
            }
            if let Err(e) = receiver.acks.try_send(id, decoded.to_tick) {
                warn!(client = id, tick = decoded.to_tick, "ack dropped: {}", e);
            }
        }
        in_flight = pending;

        debug!(tick, accepted, in_flight = in_flight.len(), "tick replicated");
        // Clients hold their own references from here on
        manager.release_snapshot(snapshot.handle())?;

        if tick % 100 == 0 {
            info!(
                tick,
                snapshots = manager.live_snapshot_count(),
                packed = manager.live_packed_entity_count(),
                cache_hit_percent = metrics.cache_hit_percent(),
                p95_us = ReplicationMetrics::get(&metrics.build_time_p95_us),
                "soak progress"
            );
        }
    }

    for client in clients.iter_mut() {
        replicator.remove_client(client)?;
    }
    history.clear();

    info!("{}", metrics.to_json());
    if manager.live_snapshot_count() != 0 || manager.live_packed_entity_count() != 0 {
        bail!(
            "leaked {} snapshots and {} packed entities",
            manager.live_snapshot_count(),
            manager.live_packed_entity_count()
        );
    }
    info!(verified, "soak passed");
    Ok(())
}
