//! Changed-property computation between two packed entities
//!
//! Two ways to answer "which properties differ between `from` and `to`":
//! - the change-frame query on `to`, whose cost follows the number of changed
//!   properties, valid only when `to` carries continuous history back to the
//!   baseline tick
//! - a field-by-field byte comparison of the two blobs, always valid and
//!   O(property count)
//!
//! The fast query may over-report a property whose value changed and then
//! changed back; that costs bandwidth, never correctness.

use smallvec::SmallVec;
use tracing::debug;

use crate::metrics::ReplicationMetrics;
use crate::snapshot::class::PropIndex;
use crate::snapshot::packed_entity::PackedEntity;
use crate::snapshot::Tick;

// ============================================================================
// Results
// ============================================================================

/// Ordered, duplicate-free changed property indices for one comparison
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaResult {
    props: SmallVec<[PropIndex; 16]>,
}

impl DeltaResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every property of a class with `count` properties
    pub fn all(count: usize) -> Self {
        Self {
            props: (0..count).map(|i| i as PropIndex).collect(),
        }
    }

    /// From indices in any order; sorts and removes duplicates
    pub fn from_unsorted<I: IntoIterator<Item = PropIndex>>(props: I) -> Self {
        let mut props: SmallVec<[PropIndex; 16]> = props.into_iter().collect();
        props.sort_unstable();
        props.dedup();
        Self { props }
    }

    /// From indices the caller already produced in ascending order
    pub(crate) fn from_ascending<I: IntoIterator<Item = PropIndex>>(props: I) -> Self {
        let props: SmallVec<[PropIndex; 16]> = props.into_iter().collect();
        debug_assert!(props.windows(2).all(|w| w[0] < w[1]));
        Self { props }
    }

    #[inline]
    pub fn as_slice(&self) -> &[PropIndex] {
        &self.props
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PropIndex> + '_ {
        self.props.iter().copied()
    }

    pub fn contains(&self, prop: PropIndex) -> bool {
        self.props.binary_search(&prop).is_ok()
    }
}

/// Outcome of the change-frame query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeQuery {
    Determinate(DeltaResult),
    /// History does not reach back to the baseline; the answer would be wrong
    Indeterminate,
}

/// Which algorithm produced a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaPath {
    /// Change frames
    Fast,
    /// Byte comparison
    Slow,
    /// No baseline, every property
    Full,
}

// ============================================================================
// Delta Computation
// ============================================================================

/// Computes `DeltaResult`s and accounts for them in the metrics
pub struct DeltaComputer<'a> {
    metrics: &'a ReplicationMetrics,
}

impl<'a> DeltaComputer<'a> {
    pub fn new(metrics: &'a ReplicationMetrics) -> Self {
        Self { metrics }
    }

    /// True when `to`'s change frames answer "changed since `from_tick`"
    /// exactly for the baseline `from`.
    ///
    /// Requires the same timeline and the same instance, history in `to`
    /// reaching back to `from_tick`, and `from` not being newer than `to`.
    #[inline]
    pub fn can_use_change_frames(from: &PackedEntity, from_tick: Tick, to: &PackedEntity) -> bool {
        from.set() == to.set()
            && from.same_instance(to)
            && from.creation_tick() <= to.creation_tick()
            && to.change_frames().covers(from_tick)
    }

    /// Change-frame query, or `Indeterminate` when it cannot be trusted
    pub fn changed_since_fast(from: &PackedEntity, from_tick: Tick, to: &PackedEntity) -> ChangeQuery {
        if !Self::can_use_change_frames(from, from_tick, to) {
            return ChangeQuery::Indeterminate;
        }
        ChangeQuery::Determinate(DeltaResult::from_ascending(
            to.change_frames().changed_since(from_tick),
        ))
    }

    /// Field-by-field comparison of the two blobs. Costs O(property count).
    pub fn diff_slow(from: &PackedEntity, to: &PackedEntity) -> DeltaResult {
        DeltaResult::from_ascending(from.data().changed_fields(to.data()))
    }

    /// Properties to send when `to` enters view: those differing from its
    /// class or instance baseline, or every property when it has none.
    pub fn calc_enter(&self, to: &PackedEntity) -> DeltaResult {
        ReplicationMetrics::incr(&self.metrics.delta_computations);
        ReplicationMetrics::incr(&self.metrics.delta_full);
        match to.baseline() {
            Some(baseline) if baseline.field_count() == to.data().field_count() => {
                DeltaResult::from_ascending(baseline.changed_fields(to.data()))
            }
            _ => DeltaResult::all(to.class().flattened_property_count()),
        }
    }

    /// Changed properties from `from` (packed at `from_tick`) to `to`.
    ///
    /// With no baseline every property is reported.
    pub fn calc_delta(
        &self,
        from: Option<(&PackedEntity, Tick)>,
        to: &PackedEntity,
    ) -> (DeltaResult, DeltaPath) {
        ReplicationMetrics::incr(&self.metrics.delta_computations);

        let Some((from, from_tick)) = from else {
            ReplicationMetrics::incr(&self.metrics.delta_full);
            return (
                DeltaResult::all(to.class().flattened_property_count()),
                DeltaPath::Full,
            );
        };

        // Same packet on both sides (reused across ticks)
        if std::ptr::eq(from, to) {
            ReplicationMetrics::incr(&self.metrics.delta_fast_path);
            return (DeltaResult::empty(), DeltaPath::Fast);
        }

        match Self::changed_since_fast(from, from_tick, to) {
            ChangeQuery::Determinate(result) => {
                ReplicationMetrics::incr(&self.metrics.delta_fast_path);
                (result, DeltaPath::Fast)
            }
            ChangeQuery::Indeterminate => {
                ReplicationMetrics::incr(&self.metrics.indeterminate_fallbacks);
                ReplicationMetrics::incr(&self.metrics.delta_slow_path);
                debug!(
                    slot = to.slot(),
                    from_tick,
                    to_tick = to.creation_tick(),
                    history_start = ?to.change_frames().history_start(),
                    "change history discontinuous, comparing bytes"
                );
                (Self::diff_slow(from, to), DeltaPath::Slow)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::snapshot::change_frame::ChangeFrameList;
    use crate::snapshot::class::{ClassDescriptor, PropertyValue};
    use crate::snapshot::manager::{Snapshot, SnapshotManager};
    use crate::snapshot::packed_entity::VisibilityMask;
    use crate::snapshot::packer::{EntityPacker, LiveEntity, WorldSource};

    fn entity(class: &Arc<ClassDescriptor>, serial: u32, values: &[i64], frames: ChangeFrameList, tick: Tick) -> PackedEntity {
        let values: Vec<PropertyValue> = values.iter().map(|&v| PropertyValue::Int(v)).collect();
        PackedEntity {
            slot: 0,
            class: Arc::clone(class),
            serial,
            data: class.encode(&values).unwrap(),
            change_frames: frames,
            visibility: VisibilityMask::all_visible(),
            creation_tick: tick,
            set: 0,
            needs_tick_revalidation: false,
            baseline: class.baseline().cloned(),
        }
    }

    #[test]
    fn test_no_baseline_is_full() {
        let metrics = ReplicationMetrics::new();
        let class = Arc::new(ClassDescriptor::new(0, "thing", 5));
        let to = entity(&class, 1, &[0; 5], ChangeFrameList::new(5, 3), 3);

        let (result, path) = DeltaComputer::new(&metrics).calc_delta(None, &to);
        assert_eq!(path, DeltaPath::Full);
        assert_eq!(result.as_slice(), &[0, 1, 2, 3, 4]);
        assert_eq!(ReplicationMetrics::get(&metrics.delta_full), 1);
    }

    #[test]
    fn test_enter_view_diffs_against_class_baseline() {
        let metrics = ReplicationMetrics::new();
        let computer = DeltaComputer::new(&metrics);

        let plain = Arc::new(ClassDescriptor::new(0, "thing", 3));
        let e = entity(&plain, 1, &[0, 0, 0], ChangeFrameList::new(3, 1), 1);
        assert_eq!(computer.calc_enter(&e).as_slice(), &[0, 1, 2]);

        let with_baseline = Arc::new(
            ClassDescriptor::new(1, "door", 3)
                .with_baseline(&[PropertyValue::Int(0), PropertyValue::Int(0), PropertyValue::Int(0)])
                .unwrap(),
        );
        let e = entity(&with_baseline, 1, &[0, 4, 0], ChangeFrameList::new(3, 1), 1);
        assert_eq!(computer.calc_enter(&e).as_slice(), &[1]);
    }

    #[test]
    fn test_same_packet_is_empty() {
        let metrics = ReplicationMetrics::new();
        let class = Arc::new(ClassDescriptor::new(0, "thing", 3));
        let e = entity(&class, 1, &[1, 2, 3], ChangeFrameList::new(3, 1), 1);

        let (result, path) = DeltaComputer::new(&metrics).calc_delta(Some((&e, 1)), &e);
        assert!(result.is_empty());
        assert_eq!(path, DeltaPath::Fast);
    }

    #[test]
    fn test_fast_path_uses_change_frames() {
        let metrics = ReplicationMetrics::new();
        let class = Arc::new(ClassDescriptor::new(0, "thing", 40));
        let from = entity(&class, 1, &[0; 40], ChangeFrameList::new(40, 1), 1);

        let mut frames = ChangeFrameList::new(40, 1);
        frames.set_change_tick(&[3], 10);
        frames.set_change_tick(&[35], 50);
        let mut values = [0i64; 40];
        values[3] = 3;
        values[35] = 35;
        let to = entity(&class, 1, &values, frames, 50);

        let (result, path) = DeltaComputer::new(&metrics).calc_delta(Some((&from, 5)), &to);
        assert_eq!(path, DeltaPath::Fast);
        assert_eq!(result.as_slice(), &[3, 35]);
        assert_eq!(ReplicationMetrics::get(&metrics.indeterminate_fallbacks), 0);
    }

    #[test]
    fn test_discontinuous_history_falls_back() {
        let metrics = ReplicationMetrics::new();
        let class = Arc::new(ClassDescriptor::new(0, "thing", 4));
        let from = entity(&class, 1, &[0, 0, 0, 0], ChangeFrameList::new(4, 1), 1);
        let to = entity(&class, 1, &[0, 9, 0, 0], ChangeFrameList::without_history(4, 20), 20);

        assert_eq!(DeltaComputer::changed_since_fast(&from, 1, &to), ChangeQuery::Indeterminate);

        let (result, path) = DeltaComputer::new(&metrics).calc_delta(Some((&from, 1)), &to);
        assert_eq!(path, DeltaPath::Slow);
        assert_eq!(result.as_slice(), &[1]);
        assert_eq!(ReplicationMetrics::get(&metrics.indeterminate_fallbacks), 1);
        assert_eq!(ReplicationMetrics::get(&metrics.delta_slow_path), 1);
    }

    #[test]
    fn test_history_starting_after_baseline_is_indeterminate() {
        let class = Arc::new(ClassDescriptor::new(0, "thing", 2));
        let from = entity(&class, 1, &[0, 0], ChangeFrameList::new(2, 1), 1);
        let to = entity(&class, 1, &[0, 1], ChangeFrameList::new(2, 30), 30);

        assert!(!DeltaComputer::can_use_change_frames(&from, 10, &to));
        assert!(DeltaComputer::can_use_change_frames(&from, 30, &to));
    }

    #[test]
    fn test_different_instance_is_indeterminate() {
        let class = Arc::new(ClassDescriptor::new(0, "thing", 2));
        let from = entity(&class, 1, &[0, 0], ChangeFrameList::new(2, 1), 1);
        let to = entity(&class, 2, &[0, 0], ChangeFrameList::new(2, 1), 5);
        assert!(!DeltaComputer::can_use_change_frames(&from, 1, &to));
    }

    // ========================================================================
    // Fast/slow agreement over a packed timeline
    // ========================================================================

    struct RandomWorld {
        tick: Tick,
        entities: Vec<LiveEntity>,
    }

    impl WorldSource for RandomWorld {
        fn current_tick(&self) -> Tick {
            self.tick
        }

        fn entity_slot_count(&self) -> usize {
            8
        }

        fn live_entities(&self) -> Vec<LiveEntity> {
            self.entities.clone()
        }
    }

    #[test]
    fn test_fast_and_slow_paths_agree() {
        let mut rng = StdRng::seed_from_u64(7);
        let manager = Arc::new(SnapshotManager::new(Arc::new(ReplicationMetrics::new())));
        let packer = EntityPacker::new(Arc::clone(&manager));

        let class = Arc::new(ClassDescriptor::new(1, "wide", 100));
        let mut world = RandomWorld {
            tick: 1,
            entities: (0..4)
                .map(|slot| LiveEntity {
                    slot,
                    class: Arc::clone(&class),
                    serial: slot as u32 + 1,
                    values: vec![PropertyValue::Int(0); 100],
                    visibility: VisibilityMask::all_visible(),
                })
                .collect(),
        };

        let mut snapshots: Vec<Arc<Snapshot>> = Vec::new();
        for tick in 1..=40u32 {
            world.tick = tick;
            for e in &mut world.entities {
                // Values only grow, so nothing ever reverts
                for _ in 0..rng.gen_range(0..6) {
                    let prop = rng.gen_range(0..100);
                    e.values[prop] = PropertyValue::Int(tick as i64 * 1000 + prop as i64);
                }
            }
            snapshots.push(packer.pack_snapshot(&world, 0).unwrap());
        }

        let metrics = ReplicationMetrics::new();
        let computer = DeltaComputer::new(&metrics);
        for _ in 0..200 {
            let a = rng.gen_range(0..snapshots.len());
            let b = rng.gen_range(a..snapshots.len());
            let (from_snap, to_snap) = (&snapshots[a], &snapshots[b]);

            for slot in 0..4u16 {
                let from = from_snap.entity(slot).unwrap();
                let to = to_snap.entity(slot).unwrap();

                let (fast, path) = computer.calc_delta(Some((from.as_ref(), from_snap.tick())), to);
                assert_eq!(path, DeltaPath::Fast);
                assert_eq!(fast, DeltaComputer::diff_slow(from, to), "slot {} {}->{}", slot, a, b);
            }
        }
        assert_eq!(ReplicationMetrics::get(&metrics.indeterminate_fallbacks), 0);
    }

    #[test]
    fn test_from_unsorted_dedups() {
        let result = DeltaResult::from_unsorted([5, 1, 5, 3]);
        assert_eq!(result.as_slice(), &[1, 3, 5]);
        assert!(result.contains(3));
        assert!(!result.contains(2));
    }
}
