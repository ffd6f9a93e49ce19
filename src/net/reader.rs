//! Client-side decoding of entity updates
//!
//! `decode_update` parses a packet into records; `ClientEntityTable` applies
//! them on top of the acknowledged state, keeping one state per received tick
//! so deltas can reference any recent baseline. Instance baselines arrive
//! separately through `apply_baselines` and must be applied before the
//! updates that enter from them.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use tracing::trace;

use crate::constants::entity::SERIAL_NUMBER_BITS;
use crate::constants::wire::TICK_BITS;
use crate::net::bitbuf::{BitBufError, BitReader};
use crate::snapshot::baseline::BaselineUpdate;
use crate::snapshot::class::{ClassDescriptor, ClassId, ClassRegistry, CodecError, PropIndex, PropertyValue};
use crate::snapshot::{EntitySlot, Tick};

/// Received ticks kept as potential baselines
const DEFAULT_HISTORY: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Bits(#[from] BitBufError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("delta against tick {0}, which is not held")]
    MissingBaseline(Tick),
    #[error("update for slot {0}, which holds no entity")]
    UnknownEntity(EntitySlot),
    #[error("property {prop} out of range for class {class}")]
    PropOutOfRange { class: ClassId, prop: PropIndex },
    #[error("enter view from the instance baseline of class {0}, which is not held")]
    MissingInstanceBaseline(ClassId),
    #[error("baseline update starts at version {from}, table holds {held}")]
    BaselineGap { held: u64, from: u64 },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// Decoded field values by property index
pub type FieldUpdates = Vec<(PropIndex, Vec<u8>)>;

#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    Enter {
        slot: EntitySlot,
        class: ClassId,
        serial: u32,
        /// `fields` apply on top of the class or instance baseline
        from_baseline: bool,
        fields: FieldUpdates,
    },
    Leave {
        slot: EntitySlot,
        delete: bool,
    },
    Changed {
        slot: EntitySlot,
        fields: FieldUpdates,
    },
}

impl EntityEvent {
    pub fn slot(&self) -> EntitySlot {
        match self {
            EntityEvent::Enter { slot, .. }
            | EntityEvent::Leave { slot, .. }
            | EntityEvent::Changed { slot, .. } => *slot,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedUpdate {
    pub to_tick: Tick,
    /// Baseline tick; `None` for full updates
    pub from_tick: Option<Tick>,
    pub events: Vec<EntityEvent>,
    pub deletions: Vec<EntitySlot>,
}

impl DecodedUpdate {
    #[inline]
    pub fn is_delta(&self) -> bool {
        self.from_tick.is_some()
    }
}

fn to_u16(value: u64, what: &'static str) -> Result<u16, ReadError> {
    u16::try_from(value).map_err(|_| ReadError::Malformed(what))
}

/// Reads gap-encoded ascending values
struct GapReader {
    previous: Option<u64>,
}

impl GapReader {
    fn new() -> Self {
        Self { previous: None }
    }

    fn read(&mut self, reader: &mut BitReader<'_>) -> Result<u64, ReadError> {
        let gap = reader.read_varint()?;
        let value = match self.previous {
            Some(previous) => previous
                .checked_add(gap)
                .and_then(|v| v.checked_add(1))
                .ok_or(ReadError::Malformed("index gap overflow"))?,
            None => gap,
        };
        self.previous = Some(value);
        Ok(value)
    }
}

fn read_fields(reader: &mut BitReader<'_>) -> Result<FieldUpdates, ReadError> {
    let count = reader.read_varint()? as usize;
    if count > reader.remaining() {
        return Err(ReadError::Malformed("property count"));
    }
    let mut gaps = GapReader::new();
    let props = (0..count)
        .map(|_| gaps.read(reader).and_then(|p| to_u16(p, "property index")))
        .collect::<Result<Vec<_>, _>>()?;

    props
        .into_iter()
        .map(|prop| {
            let len = reader.read_varint()? as usize;
            if len * 8 > reader.remaining() {
                return Err(ReadError::Malformed("field length"));
            }
            Ok((prop, reader.read_bytes(len)?))
        })
        .collect()
}

/// Parse one update packet
pub fn decode_update(bytes: &[u8]) -> Result<DecodedUpdate, ReadError> {
    let mut reader = BitReader::from_bytes(bytes);

    let is_delta = reader.read_bit()?;
    let to_tick = reader.read_bits(TICK_BITS)? as Tick;
    let from_tick = if is_delta {
        Some(reader.read_bits(TICK_BITS)? as Tick)
    } else {
        None
    };

    let mut events = Vec::new();
    let mut slots = GapReader::new();
    while reader.read_bit()? {
        let slot = to_u16(slots.read(&mut reader)?, "entity slot")?;
        let event = if reader.read_bit()? {
            EntityEvent::Leave {
                slot,
                delete: reader.read_bit()?,
            }
        } else if reader.read_bit()? {
            let class = to_u16(reader.read_varint()?, "class id")?;
            let serial = reader.read_bits(SERIAL_NUMBER_BITS)? as u32;
            let from_baseline = reader.read_bit()?;
            EntityEvent::Enter {
                slot,
                class,
                serial,
                from_baseline,
                fields: read_fields(&mut reader)?,
            }
        } else {
            EntityEvent::Changed {
                slot,
                fields: read_fields(&mut reader)?,
            }
        };
        events.push(event);
    }

    let mut deletions = Vec::new();
    if is_delta {
        let count = reader.read_varint()? as usize;
        if count > reader.remaining() {
            return Err(ReadError::Malformed("deletion count"));
        }
        let mut gaps = GapReader::new();
        for _ in 0..count {
            deletions.push(to_u16(gaps.read(&mut reader)?, "deleted slot")?);
        }
    }

    Ok(DecodedUpdate {
        to_tick,
        from_tick,
        events,
        deletions,
    })
}

/// What a consumer knows about one entity
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEntity {
    pub class: ClassId,
    pub serial: u32,
    /// `None` for properties never received
    pub fields: Vec<Option<Vec<u8>>>,
}

impl ClientEntity {
    pub fn field(&self, prop: PropIndex) -> Option<&[u8]> {
        self.fields.get(prop as usize)?.as_deref()
    }

    /// Decoded value of `prop`, if it was ever received
    pub fn value(&self, class: &ClassDescriptor, prop: PropIndex) -> Result<Option<PropertyValue>, ReadError> {
        match self.field(prop) {
            Some(bytes) => Ok(Some(class.codec().decode_field(prop, bytes)?)),
            None => Ok(None),
        }
    }
}

type EntityMap = HashMap<EntitySlot, ClientEntity, FxBuildHasher>;

/// Per-tick entity state as a consumer reconstructs it
#[derive(Debug)]
pub struct ClientEntityTable {
    states: BTreeMap<Tick, Arc<EntityMap>>,
    history: usize,
    baselines: HashMap<ClassId, Vec<Vec<u8>>, FxBuildHasher>,
    baseline_version: u64,
}

impl Default for ClientEntityTable {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl ClientEntityTable {
    pub fn new(history: usize) -> Self {
        Self {
            states: BTreeMap::new(),
            history: history.max(1),
            baselines: HashMap::with_hasher(FxBuildHasher),
            baseline_version: 0,
        }
    }

    /// Instance baselines held so far, as a version for `updates_since`
    #[inline]
    pub fn baseline_version(&self) -> u64 {
        self.baseline_version
    }

    /// Record instance baselines. Entries already held are skipped.
    pub fn apply_baselines(&mut self, update: &BaselineUpdate) -> Result<(), ReadError> {
        if update.from_version > self.baseline_version {
            return Err(ReadError::BaselineGap {
                held: self.baseline_version,
                from: update.from_version,
            });
        }
        let skip = (self.baseline_version - update.from_version) as usize;
        for entry in update.entries.iter().skip(skip) {
            self.baselines
                .entry(entry.class)
                .or_insert_with(|| entry.fields.clone());
        }
        self.baseline_version = self.baseline_version.max(update.to_version());
        Ok(())
    }

    /// Starting fields of an entity entering view
    fn enter_fields(
        &self,
        descriptor: &ClassDescriptor,
        from_baseline: bool,
    ) -> Result<Vec<Option<Vec<u8>>>, ReadError> {
        let count = descriptor.flattened_property_count();
        if !from_baseline {
            return Ok(vec![None; count]);
        }
        let fields: Vec<Option<Vec<u8>>> = match descriptor.baseline() {
            Some(configured) => configured.fields().map(|f| Some(f.to_vec())).collect(),
            None => self
                .baselines
                .get(&descriptor.id())
                .ok_or(ReadError::MissingInstanceBaseline(descriptor.id()))?
                .iter()
                .map(|f| Some(f.clone()))
                .collect(),
        };
        if fields.len() != count {
            return Err(ReadError::Malformed("baseline property count"));
        }
        Ok(fields)
    }

    /// Apply `update` on top of its baseline and record the result for its tick
    pub fn apply(&mut self, update: &DecodedUpdate, registry: &ClassRegistry) -> Result<(), ReadError> {
        let mut state: EntityMap = match update.from_tick {
            Some(from) => self
                .states
                .get(&from)
                .map(|s| EntityMap::clone(s))
                .ok_or(ReadError::MissingBaseline(from))?,
            None => EntityMap::default(),
        };

        for event in &update.events {
            match event {
                EntityEvent::Enter {
                    slot,
                    class,
                    serial,
                    from_baseline,
                    fields,
                } => {
                    let descriptor = registry.require(*class)?;
                    let mut entity = ClientEntity {
                        class: *class,
                        serial: *serial,
                        fields: self.enter_fields(descriptor, *from_baseline)?,
                    };
                    Self::apply_fields(&mut entity, fields)?;
                    state.insert(*slot, entity);
                }
                EntityEvent::Leave { slot, .. } => {
                    state.remove(slot);
                }
                EntityEvent::Changed { slot, fields } => {
                    let entity = state.get_mut(slot).ok_or(ReadError::UnknownEntity(*slot))?;
                    Self::apply_fields(entity, fields)?;
                }
            }
        }
        for slot in &update.deletions {
            state.remove(slot);
        }

        trace!(tick = update.to_tick, entities = state.len(), "client state applied");
        self.states.insert(update.to_tick, Arc::new(state));
        while self.states.len() > self.history {
            self.states.pop_first();
        }
        Ok(())
    }

    fn apply_fields(entity: &mut ClientEntity, fields: &FieldUpdates) -> Result<(), ReadError> {
        for (prop, bytes) in fields {
            let slot = entity
                .fields
                .get_mut(*prop as usize)
                .ok_or(ReadError::PropOutOfRange {
                    class: entity.class,
                    prop: *prop,
                })?;
            *slot = Some(bytes.clone());
        }
        Ok(())
    }

    pub fn entity(&self, tick: Tick, slot: EntitySlot) -> Option<&ClientEntity> {
        self.states.get(&tick)?.get(&slot)
    }

    /// Slots known at `tick`, ascending
    pub fn slots(&self, tick: Tick) -> Vec<EntitySlot> {
        let mut slots: Vec<_> = self
            .states
            .get(&tick)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        slots.sort_unstable();
        slots
    }

    pub fn has_tick(&self, tick: Tick) -> bool {
        self.states.contains_key(&tick)
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.states.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    use crate::metrics::ReplicationMetrics;
    use crate::net::bitbuf::BitWriter;
    use crate::net::client::{ClientFrame, ConsumerKind, DormantSlots};
    use crate::net::entity_writer::ReplicationStateMachine;
    use crate::snapshot::change_frame::ChangeFrameList;
    use crate::snapshot::manager::{NewPackedEntity, Snapshot, SnapshotManager};
    use crate::snapshot::packed_entity::{ProxyGroup, VisibilityMask};

    struct World {
        manager: SnapshotManager,
        metrics: ReplicationMetrics,
        registry: ClassRegistry,
    }

    impl World {
        fn new() -> Self {
            let mut registry = ClassRegistry::new();
            registry.register(ClassDescriptor::new(3, "door", 3)).unwrap();
            registry
                .register(
                    ClassDescriptor::new(4, "lamp", 2)
                        .with_baseline(&[PropertyValue::Bool(false), PropertyValue::Int(100)])
                        .unwrap(),
                )
                .unwrap();
            Self {
                manager: SnapshotManager::new(std::sync::Arc::new(ReplicationMetrics::new())),
                metrics: ReplicationMetrics::new(),
                registry,
            }
        }

        fn snapshot(
            &self,
            tick: Tick,
            entities: &[(EntitySlot, ClassId, u32, Vec<PropertyValue>, VisibilityMask)],
        ) -> Arc<Snapshot> {
            let h = self.manager.create_snapshot(tick, 8, 0).unwrap();
            for (slot, class, serial, values, mask) in entities {
                let class = Arc::clone(self.registry.get(*class).unwrap());
                self.manager
                    .create_packed_entity(
                        h,
                        *slot,
                        NewPackedEntity {
                            data: class.encode(values).unwrap(),
                            change_frames: ChangeFrameList::without_history(values.len(), tick),
                            class,
                            serial: *serial,
                            visibility: mask.clone(),
                        },
                    )
                    .unwrap();
            }
            self.manager.publish(h).unwrap()
        }

        fn encode(
            &self,
            to: &Snapshot,
            from: Option<&ClientFrame>,
            kind: ConsumerKind,
            recipient: usize,
        ) -> (Vec<u8>, ClientFrame) {
            let mut writer = BitWriter::unbounded();
            let outcome = ReplicationStateMachine::new(to, &self.metrics)
                .from_frame(from)
                .for_recipient(recipient, kind)
                .write_update(&mut writer)
                .unwrap();
            let snapshot = self.manager.acquire_snapshot(to.handle()).unwrap();
            (
                writer.into_bytes(),
                ClientFrame::new(snapshot, outcome.transmitted, outcome.dormant),
            )
        }

        /// Deliver every instance baseline `table` is missing, over the wire
        fn sync_baselines(&self, table: &mut ClientEntityTable) {
            let update = self
                .manager
                .instance_baselines()
                .updates_since(table.baseline_version());
            let wire = update.encode().unwrap();
            table.apply_baselines(&BaselineUpdate::decode(&wire).unwrap()).unwrap();
        }
    }

    fn ints(values: &[i64]) -> Vec<PropertyValue> {
        values.iter().map(|&v| PropertyValue::Int(v)).collect()
    }

    // ========================================================================
    // Round trips through the state machine
    // ========================================================================

    #[test]
    fn test_full_then_delta_reconstructs_values() {
        let world = World::new();
        let open = VisibilityMask::all_visible();
        let t1 = world.snapshot(1, &[(2, 3, 7, ints(&[1, 2, 3]), open.clone())]);
        let t2 = world.snapshot(2, &[(2, 3, 7, ints(&[1, 9, 3]), open.clone())]);

        let (bytes1, frame1) = world.encode(&t1, None, ConsumerKind::Relay, 0);
        let (bytes2, _) = world.encode(&t2, Some(&frame1), ConsumerKind::Relay, 0);

        let mut table = ClientEntityTable::default();
        world.sync_baselines(&mut table);
        let update1 = decode_update(&bytes1).unwrap();
        assert!(!update1.is_delta());
        table.apply(&update1, &world.registry).unwrap();

        let update2 = decode_update(&bytes2).unwrap();
        assert_eq!(update2.from_tick, Some(1));
        assert_eq!(
            update2.events,
            vec![EntityEvent::Changed {
                slot: 2,
                fields: vec![(1, t2.entity(2).unwrap().data().field(1).to_vec())],
            }]
        );
        table.apply(&update2, &world.registry).unwrap();

        let class = world.registry.get(3).unwrap();
        let entity = table.entity(2, 2).unwrap();
        assert_eq!(entity.serial, 7);
        assert_eq!(entity.value(class, 1).unwrap(), Some(PropertyValue::Int(9)));
        assert_eq!(table.latest_tick(), Some(2));
    }

    #[test]
    fn test_enter_view_starts_from_class_baseline() {
        let world = World::new();
        let lamp = vec![PropertyValue::Bool(true), PropertyValue::Int(100)];
        let t1 = world.snapshot(1, &[(5, 4, 1, lamp, VisibilityMask::all_visible())]);

        let (bytes, _) = world.encode(&t1, None, ConsumerKind::Relay, 0);
        let update = decode_update(&bytes).unwrap();

        // Only the property differing from the class baseline travels
        match &update.events[0] {
            EntityEvent::Enter { fields, class, .. } => {
                assert_eq!(*class, 4);
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].0, 0);
            }
            other => panic!("expected enter, got {other:?}"),
        }

        let mut table = ClientEntityTable::default();
        table.apply(&update, &world.registry).unwrap();
        let class = world.registry.get(4).unwrap();
        let entity = table.entity(1, 5).unwrap();
        assert_eq!(entity.value(class, 0).unwrap(), Some(PropertyValue::Bool(true)));
        assert_eq!(entity.value(class, 1).unwrap(), Some(PropertyValue::Int(100)));
    }

    #[test]
    fn test_enter_view_from_instance_baseline() {
        let world = World::new();
        let open = VisibilityMask::all_visible();
        // The slot 1 door becomes the class's instance baseline
        let t1 = world.snapshot(1, &[(1, 3, 1, ints(&[5, 6, 7]), open.clone())]);
        let t2 = world.snapshot(
            2,
            &[
                (1, 3, 1, ints(&[5, 6, 7]), open.clone()),
                (4, 3, 2, ints(&[5, 0, 7]), open.clone()),
            ],
        );
        assert_eq!(world.manager.instance_baselines().version(), 1);

        let (bytes1, frame1) = world.encode(&t1, None, ConsumerKind::Relay, 0);
        let (bytes2, _) = world.encode(&t2, Some(&frame1), ConsumerKind::Relay, 0);

        let update2 = decode_update(&bytes2).unwrap();
        match &update2.events[..] {
            [EntityEvent::Enter { slot: 4, from_baseline: true, fields, .. }] => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].0, 1);
            }
            other => panic!("expected one enter from the baseline, got {other:?}"),
        }

        // Without the baseline the enter cannot be rebuilt
        let mut table = ClientEntityTable::default();
        let err = table.apply(&decode_update(&bytes1).unwrap(), &world.registry).unwrap_err();
        assert_eq!(err, ReadError::MissingInstanceBaseline(3));

        world.sync_baselines(&mut table);
        assert_eq!(table.baseline_version(), 1);
        table.apply(&decode_update(&bytes1).unwrap(), &world.registry).unwrap();
        table.apply(&update2, &world.registry).unwrap();

        let class = world.registry.get(3).unwrap();
        let entered = table.entity(2, 4).unwrap();
        let values: Vec<_> = (0..3).map(|p| entered.value(class, p).unwrap()).collect();
        assert_eq!(
            values,
            vec![Some(PropertyValue::Int(5)), Some(PropertyValue::Int(0)), Some(PropertyValue::Int(7))]
        );
    }

    #[test]
    fn test_baseline_gap_is_rejected() {
        let mut table = ClientEntityTable::default();
        let update = BaselineUpdate {
            from_version: 2,
            entries: Vec::new(),
        };
        assert_eq!(
            table.apply_baselines(&update).unwrap_err(),
            ReadError::BaselineGap { held: 0, from: 2 }
        );
    }

    #[test]
    fn test_player_never_receives_hidden_property() {
        let world = World::new();
        let owner_only = VisibilityMask::all_visible().with_group(ProxyGroup::new(&[2], &[0]));
        let t1 = world.snapshot(1, &[(1, 3, 1, ints(&[0, 0, 42]), owner_only)]);

        let (bytes, _) = world.encode(&t1, None, ConsumerKind::Player, 1);
        let mut table = ClientEntityTable::default();
        table.apply(&decode_update(&bytes).unwrap(), &world.registry).unwrap();

        let entity = table.entity(1, 1).unwrap();
        assert!(entity.field(0).is_some());
        assert!(entity.field(2).is_none());
    }

    #[test]
    fn test_missing_baseline_is_rejected() {
        let world = World::new();
        let t1 = world.snapshot(1, &[]);
        let t2 = world.snapshot(2, &[]);
        let (_, frame1) = world.encode(&t1, None, ConsumerKind::Relay, 0);
        let (bytes, _) = world.encode(&t2, Some(&frame1), ConsumerKind::Relay, 0);

        let mut table = ClientEntityTable::default();
        let err = table.apply(&decode_update(&bytes).unwrap(), &world.registry).unwrap_err();
        assert_eq!(err, ReadError::MissingBaseline(1));
    }

    // ========================================================================
    // Table bookkeeping
    // ========================================================================

    #[test]
    fn test_history_is_bounded() {
        let registry = ClassRegistry::new();
        let mut table = ClientEntityTable::new(2);
        for tick in 1..=3 {
            let update = DecodedUpdate {
                to_tick: tick,
                from_tick: None,
                events: Vec::new(),
                deletions: Vec::new(),
            };
            table.apply(&update, &registry).unwrap();
        }
        assert!(!table.has_tick(1));
        assert!(table.has_tick(3));
    }

    #[test]
    fn test_truncated_packet_fails() {
        let mut writer = BitWriter::unbounded();
        writer.write_bit(true).unwrap();
        writer.write_bits(5, TICK_BITS).unwrap();
        let bytes = writer.into_bytes();
        assert!(matches!(decode_update(&bytes), Err(ReadError::Bits(_))));
    }

    #[test]
    fn test_dormant_entity_deleted_out_of_view() {
        let world = World::new();
        let open = VisibilityMask::all_visible();
        let t1 = world.snapshot(1, &[(3, 3, 1, ints(&[0, 0, 0]), open)]);
        let t2 = world.snapshot(2, &[]);

        let (bytes1, frame1) = world.encode(&t1, None, ConsumerKind::Relay, 0);
        // Pretend slot 3 went dormant rather than being sent a LeaveView
        let mut dormant = DormantSlots::default();
        dormant.insert(3, 1);
        let dormant_frame = ClientFrame::new(Arc::clone(frame1.snapshot()), BitVec::new(), dormant);
        let (bytes2, frame2) = world.encode(&t2, Some(&dormant_frame), ConsumerKind::Relay, 0);

        let update2 = decode_update(&bytes2).unwrap();
        assert!(update2.events.is_empty());
        assert_eq!(update2.deletions, vec![3]);
        assert!(frame2.dormant().is_empty());

        let mut table = ClientEntityTable::default();
        world.sync_baselines(&mut table);
        table.apply(&decode_update(&bytes1).unwrap(), &world.registry).unwrap();
        table.apply(&update2, &world.registry).unwrap();
        assert!(table.slots(2).is_empty());
    }
}
