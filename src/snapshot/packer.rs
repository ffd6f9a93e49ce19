//! Per-tick packing of live simulation state into a snapshot
//!
//! For every live entity the packer encodes the current values and compares
//! them against the slot's previous packed entity. Identical state reuses the
//! previous packet; otherwise a new packed entity is created whose change
//! frames continue the previous instance's history, or start fresh for a new
//! instance.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::snapshot::change_frame::ChangeFrameList;
use crate::snapshot::class::{ClassDescriptor, CodecError, PropIndex, PropertyValue};
use crate::snapshot::manager::{NewPackedEntity, Snapshot, SnapshotError, SnapshotHandle, SnapshotManager};
use crate::snapshot::packed_entity::VisibilityMask;
use crate::snapshot::{EntitySlot, SnapshotSet, Tick};

/// One live entity as reported by the simulation
#[derive(Debug, Clone)]
pub struct LiveEntity {
    pub slot: EntitySlot,
    pub class: Arc<ClassDescriptor>,
    pub serial: u32,
    pub values: Vec<PropertyValue>,
    pub visibility: VisibilityMask,
}

/// The simulation as seen by the replication core
pub trait WorldSource {
    fn current_tick(&self) -> Tick;

    /// Slots a snapshot of this world must be able to address
    fn entity_slot_count(&self) -> usize;

    fn live_entities(&self) -> Vec<LiveEntity>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// What happened to one entity during a pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    /// Previous packet attached unchanged
    Reused,
    /// Same instance, new packet with `changed` fields stamped
    Repacked { changed: usize },
    /// New instance in this slot
    Created,
}

/// Packs world state through a `SnapshotManager`
pub struct EntityPacker {
    manager: Arc<SnapshotManager>,
}

impl EntityPacker {
    pub fn new(manager: Arc<SnapshotManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SnapshotManager> {
        &self.manager
    }

    /// Build and publish the snapshot for the world's current tick.
    ///
    /// The caller owns the snapshot's initial reference.
    pub fn pack_snapshot<W: WorldSource + ?Sized>(
        &self,
        world: &W,
        set: SnapshotSet,
    ) -> Result<Arc<Snapshot>, PackError> {
        let tick = world.current_tick();
        let snap = self
            .manager
            .create_snapshot(tick, world.entity_slot_count(), set)?;

        let (mut reused, mut repacked, mut created) = (0usize, 0usize, 0usize);
        for entity in world.live_entities() {
            match self.pack_entity(snap, tick, set, entity) {
                Ok(PackOutcome::Reused) => reused += 1,
                Ok(PackOutcome::Repacked { .. }) => repacked += 1,
                Ok(PackOutcome::Created) => created += 1,
                Err(e) => {
                    // Give back the creation reference before bailing out
                    if let Err(release) = self.manager.release_snapshot(snap) {
                        warn!(tick, set, error = %release, "failed to release abandoned snapshot");
                    }
                    return Err(e);
                }
            }
        }

        let snapshot = self.manager.publish(snap)?;
        debug!(tick, set, reused, repacked, created, "tick packed");
        Ok(snapshot)
    }

    /// Pack one entity into the snapshot under construction
    pub fn pack_entity(
        &self,
        snap: SnapshotHandle,
        tick: Tick,
        set: SnapshotSet,
        entity: LiveEntity,
    ) -> Result<PackOutcome, PackError> {
        let data = entity.class.encode(&entity.values)?;
        let property_count = entity.class.flattened_property_count();

        let previous = self
            .manager
            .last_packed(set, entity.slot)
            .filter(|p| p.serial() == entity.serial && p.class().id() == entity.class.id());

        let (change_frames, outcome) = match previous {
            Some(prev) => {
                if prev.data() == &data
                    && prev.visibility() == &entity.visibility
                    && self.manager.try_reuse_last_packet(snap, entity.slot, entity.serial)?
                {
                    return Ok(PackOutcome::Reused);
                }

                let changed: SmallVec<[PropIndex; 16]> = prev.data().changed_fields(&data).collect();
                let mut frames = if prev.change_frames().property_count() == property_count {
                    prev.change_frames().copy()
                } else {
                    ChangeFrameList::new(property_count, tick)
                };
                frames.set_change_tick(&changed, tick);
                (frames, PackOutcome::Repacked { changed: changed.len() })
            }
            None => (ChangeFrameList::new(property_count, tick), PackOutcome::Created),
        };

        self.manager.create_packed_entity(
            snap,
            entity.slot,
            NewPackedEntity {
                class: entity.class,
                serial: entity.serial,
                data,
                change_frames,
                visibility: entity.visibility,
            },
        )?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ReplicationMetrics;
    use crate::snapshot::packed_entity::ProxyGroup;

    struct TestWorld {
        tick: Tick,
        slots: usize,
        entities: Vec<LiveEntity>,
    }

    impl WorldSource for TestWorld {
        fn current_tick(&self) -> Tick {
            self.tick
        }

        fn entity_slot_count(&self) -> usize {
            self.slots
        }

        fn live_entities(&self) -> Vec<LiveEntity> {
            self.entities.clone()
        }
    }

    fn setup() -> (EntityPacker, TestWorld) {
        let manager = Arc::new(SnapshotManager::new(Arc::new(ReplicationMetrics::new())));
        let class = Arc::new(ClassDescriptor::new(1, "crate", 40));
        let world = TestWorld {
            tick: 1,
            slots: 16,
            entities: vec![LiveEntity {
                slot: 4,
                class,
                serial: 11,
                values: vec![PropertyValue::Int(0); 40],
                visibility: VisibilityMask::all_visible(),
            }],
        };
        (EntityPacker::new(manager), world)
    }

    #[test]
    fn test_unchanged_entity_reuses_packet() {
        let (packer, mut world) = setup();
        let first = packer.pack_snapshot(&world, 0).unwrap();

        world.tick = 2;
        let second = packer.pack_snapshot(&world, 0).unwrap();

        let a = first.entry(4).unwrap();
        let b = second.entry(4).unwrap();
        assert_eq!(a.handle(), b.handle());
        assert!(Arc::ptr_eq(a.entity(), b.entity()));
        assert_eq!(packer.manager().packed_ref_count(a.handle()), Some(2));
        assert_eq!(ReplicationMetrics::get(&packer.manager().metrics().packed_entities_reused), 1);
    }

    #[test]
    fn test_changed_fields_are_stamped() {
        let (packer, mut world) = setup();
        packer.pack_snapshot(&world, 0).unwrap();

        world.tick = 10;
        world.entities[0].values[3] = PropertyValue::Int(3);
        packer.pack_snapshot(&world, 0).unwrap();

        world.tick = 50;
        world.entities[0].values[35] = PropertyValue::Int(35);
        let snap = packer.pack_snapshot(&world, 0).unwrap();

        let frames = snap.entity(4).unwrap().change_frames();
        assert_eq!(frames.changed_since(5).collect::<Vec<_>>(), vec![3, 35]);
        assert_eq!(frames.changed_since(20).collect::<Vec<_>>(), vec![35]);
        assert_eq!(frames.changed_since(60).count(), 0);
        assert_eq!(frames.history_start(), Some(1));
    }

    #[test]
    fn test_new_serial_starts_fresh_history() {
        let (packer, mut world) = setup();
        packer.pack_snapshot(&world, 0).unwrap();

        world.tick = 5;
        world.entities[0].serial = 12;
        let snap = packer.pack_snapshot(&world, 0).unwrap();

        let entity = snap.entity(4).unwrap();
        assert_eq!(entity.serial(), 12);
        assert_eq!(entity.change_frames().history_start(), Some(5));
        assert_eq!(entity.change_frames().changed_since(4).count(), 40);
    }

    #[test]
    fn test_visibility_change_repacks_without_stamping() {
        let (packer, mut world) = setup();
        let first = packer.pack_snapshot(&world, 0).unwrap();

        world.tick = 2;
        world.entities[0].visibility =
            VisibilityMask::all_visible().with_group(ProxyGroup::new(&[1], &[0]));
        let second = packer.pack_snapshot(&world, 0).unwrap();

        assert_ne!(first.entry(4).unwrap().handle(), second.entry(4).unwrap().handle());
        assert_eq!(second.entity(4).unwrap().change_frames().changed_since(1).count(), 0);
    }

    #[test]
    fn test_pack_carries_explicit_deletes() {
        let (packer, world) = setup();
        packer.manager().add_explicit_delete(0, 7);
        let snap = packer.pack_snapshot(&world, 0).unwrap();
        assert_eq!(snap.explicit_deletes(), &[7]);
        assert_eq!(snap.valid_slots(), &[4]);
    }

    #[test]
    fn test_codec_error_releases_snapshot() {
        let (packer, mut world) = setup();
        world.entities[0].values.pop();
        let err = packer.pack_snapshot(&world, 0).unwrap_err();
        assert!(matches!(err, PackError::Codec(CodecError::PropertyCount { .. })));
        assert_eq!(packer.manager().live_snapshot_count(), 0);
    }
}
