//! Snapshot timeline and packed-entity ownership
//!
//! The simulation thread creates one snapshot per tick, fills it with packed
//! entities (fresh or reused from the previous tick) and publishes it. After
//! publication a snapshot is an `Arc<Snapshot>` that never changes, so
//! consumers traverse it without locking. Creation, publication and every
//! ownership count change go through the manager's single lock.
//!
//! # Ownership
//!
//! - `create_snapshot` returns a handle holding one reference.
//! - Each holder takes its own reference with `add_snapshot_reference` (or
//!   `acquire_snapshot`) and gives it back with `release_snapshot`.
//! - A snapshot holds one reference on every packed entity in its slots; a
//!   packed entity reused across ticks is held once per snapshot.
//! - Freeing a snapshot releases its packed-entity references.
//!
//! The manager also records per-class instance baselines as entities are
//! packed; see `snapshot::baseline`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use tracing::{debug, trace};

use crate::config::ReplicationConfig;
use crate::constants::entity::MAX_ENTITY_SLOTS;
use crate::metrics::ReplicationMetrics;
use crate::snapshot::baseline::InstanceBaselines;
use crate::snapshot::change_frame::ChangeFrameList;
use crate::snapshot::class::{ClassDescriptor, ClassId, PackedData};
use crate::snapshot::packed_entity::{PackedEntity, VisibilityMask};
use crate::snapshot::{EntitySlot, SnapshotSet, Tick};
use crate::util::arena::{ArenaError, Handle, HandleArena};
use crate::util::contract_violation;

pub type SnapshotHandle = Handle<SnapshotRecord>;
pub type PackedEntityHandle = Handle<Arc<PackedEntity>>;

/// Snapshot manager errors. All of them are contract violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("slot {slot} outside a snapshot of {count} slots")]
    SlotOutOfRange { slot: EntitySlot, count: usize },
    #[error("snapshot of {count} slots exceeds the limit of {limit}")]
    TooManySlots { count: usize, limit: usize },
    #[error("snapshot {0:?} is already published")]
    AlreadyPublished(SnapshotHandle),
    #[error("snapshot {0:?} is not published")]
    NotPublished(SnapshotHandle),
    #[error("class {class} has {expected} properties, packed state carries {actual}")]
    PropertyCountMismatch {
        class: ClassId,
        expected: usize,
        actual: usize,
    },
    #[error("class {class} has {count} properties, visibility names property {prop}")]
    VisibilityOutOfRange {
        class: ClassId,
        prop: usize,
        count: usize,
    },
}

/// One occupied snapshot slot
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    handle: PackedEntityHandle,
    entity: Arc<PackedEntity>,
}

impl SnapshotEntry {
    #[inline]
    pub fn handle(&self) -> PackedEntityHandle {
        self.handle
    }

    #[inline]
    pub fn entity(&self) -> &Arc<PackedEntity> {
        &self.entity
    }

    #[inline]
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        self.entity.class()
    }

    #[inline]
    pub fn serial(&self) -> u32 {
        self.entity.serial()
    }
}

/// Entity existence and identity at one tick
#[derive(Debug)]
pub struct Snapshot {
    handle: SnapshotHandle,
    tick: Tick,
    set: SnapshotSet,
    entries: Vec<Option<SnapshotEntry>>,
    valid: Vec<EntitySlot>,
    explicit_deletes: Vec<EntitySlot>,
}

impl Snapshot {
    fn empty(handle: SnapshotHandle, tick: Tick, set: SnapshotSet) -> Self {
        Self {
            handle,
            tick,
            set,
            entries: Vec::new(),
            valid: Vec::new(),
            explicit_deletes: Vec::new(),
        }
    }

    #[inline]
    pub fn handle(&self) -> SnapshotHandle {
        self.handle
    }

    #[inline]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    #[inline]
    pub fn set(&self) -> SnapshotSet {
        self.set
    }

    /// Declared entity slot count
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn entry(&self, slot: EntitySlot) -> Option<&SnapshotEntry> {
        self.entries.get(slot as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn entity(&self, slot: EntitySlot) -> Option<&Arc<PackedEntity>> {
        self.entry(slot).map(SnapshotEntry::entity)
    }

    /// Occupied slots, ascending
    #[inline]
    pub fn valid_slots(&self) -> &[EntitySlot] {
        &self.valid
    }

    /// Slots destroyed since the previous snapshot of this set, ascending
    #[inline]
    pub fn explicit_deletes(&self) -> &[EntitySlot] {
        &self.explicit_deletes
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<PackedEntity>> + '_ {
        self.valid.iter().filter_map(move |&slot| self.entity(slot))
    }
}

#[derive(Debug)]
enum RecordState {
    Building(Snapshot),
    Published(Arc<Snapshot>),
}

/// Arena record behind a `SnapshotHandle`
#[derive(Debug)]
pub struct SnapshotRecord(RecordState);

impl SnapshotRecord {
    fn snapshot(&self) -> &Snapshot {
        match &self.0 {
            RecordState::Building(s) => s,
            RecordState::Published(s) => s,
        }
    }
}

/// State needed to pack one entity into a snapshot under construction
#[derive(Debug)]
pub struct NewPackedEntity {
    pub class: Arc<ClassDescriptor>,
    pub serial: u32,
    pub data: PackedData,
    pub change_frames: ChangeFrameList,
    pub visibility: VisibilityMask,
}

struct ManagerInner {
    snapshots: HandleArena<SnapshotRecord>,
    packed: HandleArena<Arc<PackedEntity>>,
    /// Most recently packed entity per (set, slot). Holds no ownership.
    last_packed: HashMap<(SnapshotSet, EntitySlot), PackedEntityHandle, FxBuildHasher>,
    pending_deletes: HashMap<SnapshotSet, Vec<EntitySlot>, FxBuildHasher>,
    /// Published snapshots in publication order
    timeline: Vec<SnapshotHandle>,
}

impl ManagerInner {
    fn building_mut(&mut self, snap: SnapshotHandle) -> Result<&mut Snapshot, SnapshotError> {
        let record = self
            .snapshots
            .get_mut(snap)
            .ok_or(SnapshotError::Arena(ArenaError::StaleHandle {
                index: snap.index(),
                generation: snap.generation(),
            }))?;
        match &mut record.0 {
            RecordState::Building(s) => Ok(s),
            RecordState::Published(_) => Err(SnapshotError::AlreadyPublished(snap)),
        }
    }

    fn release_packed(&mut self, handle: PackedEntityHandle, metrics: &ReplicationMetrics) -> Result<(), SnapshotError> {
        if let Some(entity) = self.packed.release(handle)? {
            let key = (entity.set(), entity.slot());
            if self.last_packed.get(&key) == Some(&handle) {
                self.last_packed.remove(&key);
            }
            metrics.packed_entities_live.fetch_sub(1, Ordering::Relaxed);
            trace!(slot = entity.slot(), tick = entity.creation_tick(), "packed entity freed");
        }
        Ok(())
    }

    /// Put `entry` into `slot`, releasing whatever was there
    fn place(
        &mut self,
        snap: SnapshotHandle,
        slot: EntitySlot,
        entry: SnapshotEntry,
        metrics: &ReplicationMetrics,
    ) -> Result<(), SnapshotError> {
        let snapshot = self.building_mut(snap)?;
        let previous = snapshot.entries[slot as usize].replace(entry);
        if let Some(previous) = previous {
            self.release_packed(previous.handle, metrics)?;
        }
        Ok(())
    }
}

/// Owns every snapshot and packed entity
pub struct SnapshotManager {
    inner: Mutex<ManagerInner>,
    baselines: InstanceBaselines,
    max_entity_slots: usize,
    metrics: Arc<ReplicationMetrics>,
}

impl SnapshotManager {
    pub fn new(metrics: Arc<ReplicationMetrics>) -> Self {
        Self::with_capacity(metrics, 64, 1024)
    }

    /// Manager bounded by the configured slot limit
    pub fn from_config(metrics: Arc<ReplicationMetrics>, config: &ReplicationConfig) -> Self {
        let mut manager = Self::new(metrics);
        manager.max_entity_slots = config.max_entity_slots.min(MAX_ENTITY_SLOTS);
        manager
    }

    pub fn with_capacity(metrics: Arc<ReplicationMetrics>, snapshots: usize, packed: usize) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                snapshots: HandleArena::with_capacity(snapshots),
                packed: HandleArena::with_capacity(packed),
                last_packed: HashMap::with_hasher(FxBuildHasher),
                pending_deletes: HashMap::with_hasher(FxBuildHasher),
                timeline: Vec::with_capacity(snapshots),
            }),
            baselines: InstanceBaselines::new(),
            max_entity_slots: MAX_ENTITY_SLOTS,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn instance_baselines(&self) -> &InstanceBaselines {
        &self.baselines
    }

    pub fn max_entity_slots(&self) -> usize {
        self.max_entity_slots
    }

    /// Start a snapshot for `tick` with `slot_count` empty slots.
    ///
    /// Explicit deletes queued for `set` move into the new snapshot.
    pub fn create_snapshot(
        &self,
        tick: Tick,
        slot_count: usize,
        set: SnapshotSet,
    ) -> Result<SnapshotHandle, SnapshotError> {
        if slot_count > self.max_entity_slots {
            return Err(contract_violation(SnapshotError::TooManySlots {
                count: slot_count,
                limit: self.max_entity_slots,
            }));
        }

        let mut inner = self.inner.lock();
        let mut deletes = inner.pending_deletes.remove(&set).unwrap_or_default();
        deletes.sort_unstable();
        deletes.dedup();

        let handle = inner.snapshots.insert_with(|handle| {
            let mut snapshot = Snapshot::empty(handle, tick, set);
            snapshot.entries = vec![None; slot_count];
            snapshot.explicit_deletes = deletes;
            SnapshotRecord(RecordState::Building(snapshot))
        });

        ReplicationMetrics::incr(&self.metrics.snapshots_created);
        ReplicationMetrics::incr(&self.metrics.snapshots_live);
        debug!(tick, set, slot_count, ?handle, "snapshot created");
        Ok(handle)
    }

    /// Pack a fresh entity into `slot` of a snapshot under construction.
    ///
    /// The new entity becomes the slot's most recently packed entity. A class
    /// without a configured baseline may get its instance baseline here.
    pub fn create_packed_entity(
        &self,
        snap: SnapshotHandle,
        slot: EntitySlot,
        new: NewPackedEntity,
    ) -> Result<PackedEntityHandle, SnapshotError> {
        let expected = new.class.flattened_property_count();
        let actual = if new.change_frames.property_count() != expected {
            new.change_frames.property_count()
        } else {
            new.data.field_count()
        };
        if actual != expected {
            return Err(contract_violation(SnapshotError::PropertyCountMismatch {
                class: new.class.id(),
                expected,
                actual,
            }));
        }
        if let Some(prop) = new.visibility.highest_proxied_prop().filter(|&p| p >= expected) {
            return Err(contract_violation(SnapshotError::VisibilityOutOfRange {
                class: new.class.id(),
                prop,
                count: expected,
            }));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let snapshot = inner.building_mut(snap).map_err(contract_violation)?;
        if slot as usize >= snapshot.entries.len() {
            return Err(contract_violation(SnapshotError::SlotOutOfRange {
                slot,
                count: snapshot.entries.len(),
            }));
        }
        let (tick, set) = (snapshot.tick, snapshot.set);

        let needs_tick_revalidation = new.class.has_tick_relative_properties();
        let baseline = match new.class.baseline() {
            Some(configured) => Some(Arc::clone(configured)),
            None => self
                .baselines
                .ensure(&new.class, &new.data, &new.visibility, tick),
        };
        let entity = Arc::new(PackedEntity {
            slot,
            class: new.class,
            serial: new.serial,
            data: new.data,
            change_frames: new.change_frames,
            visibility: new.visibility,
            creation_tick: tick,
            set,
            needs_tick_revalidation,
            baseline,
        });

        let handle = inner.packed.insert(Arc::clone(&entity));
        inner.place(snap, slot, SnapshotEntry { handle, entity }, &self.metrics)?;
        inner.last_packed.insert((set, slot), handle);

        ReplicationMetrics::incr(&self.metrics.packed_entities_created);
        ReplicationMetrics::incr(&self.metrics.packed_entities_live);
        trace!(tick, slot, "packed entity created");
        Ok(handle)
    }

    /// Attach the slot's previous packed entity to `snap` unchanged.
    ///
    /// Succeeds only when that entity is still alive, belongs to the same
    /// instance `serial` and its class has no tick-relative properties.
    pub fn try_reuse_last_packet(
        &self,
        snap: SnapshotHandle,
        slot: EntitySlot,
        serial: u32,
    ) -> Result<bool, SnapshotError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let snapshot = inner.building_mut(snap).map_err(contract_violation)?;
        if slot as usize >= snapshot.entries.len() {
            return Err(contract_violation(SnapshotError::SlotOutOfRange {
                slot,
                count: snapshot.entries.len(),
            }));
        }
        let set = snapshot.set;

        let Some(&handle) = inner.last_packed.get(&(set, slot)) else {
            return Ok(false);
        };
        let Some(entity) = inner.packed.get(handle).cloned() else {
            inner.last_packed.remove(&(set, slot));
            return Ok(false);
        };
        if entity.serial() != serial || entity.needs_tick_revalidation() {
            return Ok(false);
        }

        inner.packed.add_ref(handle)?;
        inner.place(snap, slot, SnapshotEntry { handle, entity }, &self.metrics)?;

        ReplicationMetrics::incr(&self.metrics.packed_entities_reused);
        trace!(slot, serial, "packed entity reused");
        Ok(true)
    }

    /// Most recently packed entity for `slot` in `set`, if still alive
    pub fn last_packed(&self, set: SnapshotSet, slot: EntitySlot) -> Option<Arc<PackedEntity>> {
        let inner = self.inner.lock();
        let handle = *inner.last_packed.get(&(set, slot))?;
        inner.packed.get(handle).cloned()
    }

    /// Report `slot` as destroyed in the next snapshot built for `set`
    pub fn add_explicit_delete(&self, set: SnapshotSet, slot: EntitySlot) {
        self.inner
            .lock()
            .pending_deletes
            .entry(set)
            .or_default()
            .push(slot);
    }

    /// Freeze a snapshot. Its contents never change afterwards.
    pub fn publish(&self, snap: SnapshotHandle) -> Result<Arc<Snapshot>, SnapshotError> {
        let mut inner = self.inner.lock();
        let building = inner.building_mut(snap).map_err(contract_violation)?;

        let (tick, set) = (building.tick, building.set);
        let mut snapshot = std::mem::replace(building, Snapshot::empty(snap, tick, set));
        snapshot.valid = snapshot
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(slot, _)| slot as EntitySlot)
            .collect();

        let published = Arc::new(snapshot);
        if let Some(record) = inner.snapshots.get_mut(snap) {
            record.0 = RecordState::Published(Arc::clone(&published));
        }
        inner.timeline.push(snap);

        debug!(
            tick,
            set,
            entities = published.valid.len(),
            deletes = published.explicit_deletes.len(),
            "snapshot published"
        );
        Ok(published)
    }

    /// Published snapshot behind `snap`, without taking a reference
    pub fn snapshot(&self, snap: SnapshotHandle) -> Option<Arc<Snapshot>> {
        let inner = self.inner.lock();
        match &inner.snapshots.get(snap)?.0 {
            RecordState::Published(s) => Some(Arc::clone(s)),
            RecordState::Building(_) => None,
        }
    }

    /// Take a reference on a snapshot. Returns the new count.
    pub fn add_snapshot_reference(&self, snap: SnapshotHandle) -> Result<u32, SnapshotError> {
        let mut inner = self.inner.lock();
        inner
            .snapshots
            .add_ref(snap)
            .map_err(|e| contract_violation(SnapshotError::from(e)))
    }

    /// Take a reference on a published snapshot and return it
    pub fn acquire_snapshot(&self, snap: SnapshotHandle) -> Result<Arc<Snapshot>, SnapshotError> {
        let mut inner = self.inner.lock();
        let published = match inner.snapshots.get(snap).map(|r| &r.0) {
            Some(RecordState::Published(s)) => Arc::clone(s),
            Some(RecordState::Building(_)) => {
                return Err(contract_violation(SnapshotError::NotPublished(snap)))
            }
            None => {
                return Err(contract_violation(SnapshotError::Arena(ArenaError::StaleHandle {
                    index: snap.index(),
                    generation: snap.generation(),
                })))
            }
        };
        inner
            .snapshots
            .add_ref(snap)
            .map_err(|e| contract_violation(SnapshotError::from(e)))?;
        Ok(published)
    }

    /// Drop one reference; the last one frees the snapshot and its entity holds
    pub fn release_snapshot(&self, snap: SnapshotHandle) -> Result<(), SnapshotError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let record = match inner.snapshots.release(snap) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(e) => return Err(contract_violation(SnapshotError::from(e))),
        };

        inner.timeline.retain(|&h| h != snap);
        let snapshot = record.snapshot();
        for entry in snapshot.entries.iter().flatten() {
            inner
                .release_packed(entry.handle, &self.metrics)
                .map_err(contract_violation)?;
        }

        self.metrics
            .snapshots_live
            .fetch_sub(1, Ordering::Relaxed);
        debug!(tick = snapshot.tick, set = snapshot.set, "snapshot freed");
        Ok(())
    }

    /// Take a reference on a packed entity directly
    pub fn add_packed_entity_reference(&self, handle: PackedEntityHandle) -> Result<u32, SnapshotError> {
        let mut inner = self.inner.lock();
        inner
            .packed
            .add_ref(handle)
            .map_err(|e| contract_violation(SnapshotError::from(e)))
    }

    /// Drop one reference on a packed entity
    pub fn release_packed_entity(&self, handle: PackedEntityHandle) -> Result<(), SnapshotError> {
        let mut inner = self.inner.lock();
        inner
            .release_packed(handle, &self.metrics)
            .map_err(contract_violation)
    }

    /// Newest published snapshot of `set`
    pub fn latest_snapshot(&self, set: SnapshotSet) -> Option<Arc<Snapshot>> {
        let inner = self.inner.lock();
        inner.timeline.iter().rev().find_map(|&h| match &inner.snapshots.get(h)?.0 {
            RecordState::Published(s) if s.set == set => Some(Arc::clone(s)),
            _ => None,
        })
    }

    /// Every live published snapshot of `set`, oldest first
    pub fn published_snapshots(&self, set: SnapshotSet) -> Vec<Arc<Snapshot>> {
        let inner = self.inner.lock();
        inner
            .timeline
            .iter()
            .filter_map(|&h| match &inner.snapshots.get(h)?.0 {
                RecordState::Published(s) if s.set == set => Some(Arc::clone(s)),
                _ => None,
            })
            .collect()
    }

    pub fn live_snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    pub fn live_packed_entity_count(&self) -> usize {
        self.inner.lock().packed.len()
    }

    pub fn snapshot_ref_count(&self, snap: SnapshotHandle) -> Option<u32> {
        self.inner.lock().snapshots.ref_count(snap)
    }

    pub fn packed_ref_count(&self, handle: PackedEntityHandle) -> Option<u32> {
        self.inner.lock().packed.ref_count(handle)
    }
}
