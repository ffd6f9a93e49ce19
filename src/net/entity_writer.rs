//! Per-consumer entity update encoding
//!
//! `ReplicationStateMachine` walks the consumer's baseline frame and the
//! target snapshot in ascending slot order and classifies every slot:
//!
//! - EnterView: absent from the baseline, or a different instance now
//!   (recreate); sends class, serial and the properties differing from the
//!   entity's class or instance baseline
//! - LeaveView: in the baseline, no longer visible; flags a delete when the
//!   instance is gone
//! - Changed: same instance with a non-empty delta
//! - Unchanged: same instance, empty delta; nothing is written
//!
//! A delta update ends with a deletions section for slots the walk never
//! visited: dormant entities destroyed out of view and explicit deletes.
//!
//! # Wire format
//! ```text
//! update   := is_delta:1 to_tick:32 [from_tick:32] record* 0 [deletions]
//! record   := 1 varint(slot gap) leave:1 (delete:1 | enter:1 (enter_body | props))
//! enter    := varint(class) serial:17 from_baseline:1 props
//! props    := varint(count) varint(index gap)* (varint(len) bytes)*
//! deletions:= varint(count) varint(slot gap)*
//! ```
//! Gaps are `value - previous - 1`, with the first gap taken from -1.

use bitvec::prelude::*;
use tracing::trace;

use crate::constants::entity::SERIAL_NUMBER_BITS;
use crate::constants::wire::TICK_BITS;
use crate::metrics::ReplicationMetrics;
use crate::net::bitbuf::{BitBufError, BitCount, BitWriter};
use crate::net::client::{ClientFrame, ConsumerKind, DormantSlots};
use crate::net::delta::{DeltaComputer, DeltaResult};
use crate::net::delta_cache::{CachedDelta, DeltaEncodingCache};
use crate::net::proxy_filter::RecipientProxyFilter;
use crate::snapshot::manager::Snapshot;
use crate::snapshot::packed_entity::{PackedEntity, RecipientId};
use crate::snapshot::EntitySlot;

/// Classification of one slot for one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityUpdate {
    EnterView,
    LeaveView { delete: bool },
    Changed,
    Unchanged,
}

/// Counters for one built update
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateStats {
    pub entered: usize,
    pub left: usize,
    pub deleted: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Entries in the trailing deletions section
    pub deletions: usize,
    pub cache_hits: usize,
    pub bits: usize,
}

/// Everything one walk produced besides the bits
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub stats: UpdateStats,
    pub updates: Vec<(EntitySlot, EntityUpdate)>,
    /// Slots the consumer holds after applying the update
    pub transmitted: BitVec,
    pub dormant: DormantSlots,
    pub deletions: Vec<EntitySlot>,
    /// Cache entries to commit once the packet is known to fit
    pub(crate) cache_stores: Vec<CachedDelta>,
}

/// Gap-encodes ascending values
struct GapWriter {
    previous: Option<u64>,
}

impl GapWriter {
    fn new() -> Self {
        Self { previous: None }
    }

    fn write(&mut self, writer: &mut BitWriter, value: u64) -> Result<BitCount, BitBufError> {
        let gap = match self.previous {
            Some(previous) => value - previous - 1,
            None => value,
        };
        self.previous = Some(value);
        writer.write_varint(gap)
    }
}

/// Write a property section for `props` of `entity`
pub fn write_props(
    writer: &mut BitWriter,
    entity: &PackedEntity,
    props: &DeltaResult,
) -> Result<BitCount, BitBufError> {
    let mut written = writer.write_varint(props.len() as u64)?;
    let mut gaps = GapWriter::new();
    for prop in props.iter() {
        written += gaps.write(writer, prop as u64)?;
    }
    for prop in props.iter() {
        let field = entity.data().field(prop);
        written += writer.write_varint(field.len() as u64)?;
        written += writer.write_bytes(field)?;
    }
    Ok(written)
}

/// EnterView body: class, serial, baseline flag, properties
fn write_enter_body(
    writer: &mut BitWriter,
    entity: &PackedEntity,
    props: &DeltaResult,
) -> Result<BitCount, BitBufError> {
    let serial_mask = (1u64 << SERIAL_NUMBER_BITS) - 1;
    let mut written = writer.write_varint(entity.class().id() as u64)?;
    written += writer.write_bits(entity.serial() as u64 & serial_mask, SERIAL_NUMBER_BITS)?;
    written += writer.write_bit(entity.baseline().is_some())?;
    written += write_props(writer, entity, props)?;
    Ok(written)
}

/// Encodes one update for one consumer
pub struct ReplicationStateMachine<'a> {
    to: &'a Snapshot,
    from: Option<&'a ClientFrame>,
    recipient: RecipientId,
    cull: bool,
    visible: Option<&'a BitSlice>,
    cache: Option<&'a DeltaEncodingCache>,
    computer: DeltaComputer<'a>,
}

impl<'a> ReplicationStateMachine<'a> {
    /// Full, uncensored update of every entity in `to`
    pub fn new(to: &'a Snapshot, metrics: &'a ReplicationMetrics) -> Self {
        Self {
            to,
            from: None,
            recipient: 0,
            cull: false,
            visible: None,
            cache: None,
            computer: DeltaComputer::new(metrics),
        }
    }

    /// Delta against an acknowledged frame
    pub fn from_frame(mut self, from: Option<&'a ClientFrame>) -> Self {
        self.from = from;
        self
    }

    pub fn for_recipient(mut self, recipient: RecipientId, kind: ConsumerKind) -> Self {
        self.recipient = recipient;
        self.cull = kind.applies_proxy_culling();
        self
    }

    /// Restrict to the slots upstream visibility allows
    pub fn with_visibility(mut self, visible: Option<&'a BitSlice>) -> Self {
        self.visible = visible;
        self
    }

    /// Share encoded records; ignored for consumers that cull properties
    pub fn with_cache(mut self, cache: Option<&'a DeltaEncodingCache>) -> Self {
        self.cache = cache;
        self
    }

    #[inline]
    fn is_visible(&self, slot: EntitySlot) -> bool {
        match self.visible {
            None => true,
            Some(bits) => bits.get(slot as usize).is_some_and(|b| *b),
        }
    }

    #[inline]
    fn shared_cache(&self) -> Option<&'a DeltaEncodingCache> {
        if self.cull {
            None
        } else {
            self.cache
        }
    }

    /// Write the whole update. On error the writer holds a partial packet
    /// that the caller must discard; nothing else has been touched.
    pub fn write_update(&self, writer: &mut BitWriter) -> Result<UpdateOutcome, BitBufError> {
        let start = writer.len_bits();
        let to = self.to;
        let from = self.from;

        writer.write_bit(from.is_some())?;
        writer.write_bits(to.tick() as u64, TICK_BITS)?;
        if let Some(from) = from {
            writer.write_bits(from.tick() as u64, TICK_BITS)?;
        }

        let mut outcome = UpdateOutcome {
            transmitted: BitVec::repeat(false, to.slot_count()),
            dormant: from.map(|f| f.dormant().clone()).unwrap_or_default(),
            ..Default::default()
        };

        let from_slots: Vec<EntitySlot> = from
            .map(|f| f.transmitted_slots().collect())
            .unwrap_or_default();
        let to_slots: Vec<EntitySlot> = to
            .valid_slots()
            .iter()
            .copied()
            .filter(|&slot| self.is_visible(slot))
            .collect();

        let mut slots = GapWriter::new();
        let mut leave_deletes: Vec<EntitySlot> = Vec::new();
        let (mut i, mut j) = (0, 0);

        loop {
            let (slot, in_from, in_to) = match (from_slots.get(i).copied(), to_slots.get(j).copied()) {
                (None, None) => break,
                (Some(f), None) => (f, true, false),
                (None, Some(t)) => (t, false, true),
                (Some(f), Some(t)) if f < t => (f, true, false),
                (Some(f), Some(t)) if t < f => (t, false, true),
                (Some(f), Some(_)) => (f, true, true),
            };
            if in_from {
                i += 1;
            }
            if in_to {
                j += 1;
            }

            let from_entity = from
                .filter(|_| in_from)
                .and_then(|f| f.snapshot().entity(slot));
            let to_entity = if in_to { to.entity(slot) } else { None };

            let update = match (from_entity, to_entity) {
                (None, None) => continue,
                (Some(old), None) => {
                    let delete = to.entity(slot).map_or(true, |now| !now.same_instance(old));
                    if delete {
                        outcome.dormant.remove(&slot);
                        leave_deletes.push(slot);
                    } else {
                        outcome.dormant.insert(slot, old.serial());
                    }
                    writer.write_bit(true)?;
                    slots.write(writer, slot as u64)?;
                    writer.write_bit(true)?;
                    writer.write_bit(delete)?;
                    EntityUpdate::LeaveView { delete }
                }
                (Some(old), Some(new)) if old.same_instance(new) => {
                    outcome.transmitted.set(slot as usize, true);
                    self.write_changed(writer, &mut slots, &mut outcome, old, new)?
                }
                // Absent from the baseline, or recreated with a new identity
                (_, Some(new)) => {
                    outcome.transmitted.set(slot as usize, true);
                    outcome.dormant.remove(&slot);
                    self.write_enter(writer, &mut slots, &mut outcome, new)?;
                    EntityUpdate::EnterView
                }
            };

            trace!(slot, ?update, "entity classified");
            match update {
                EntityUpdate::EnterView => outcome.stats.entered += 1,
                EntityUpdate::LeaveView { delete } => {
                    outcome.stats.left += 1;
                    if delete {
                        outcome.stats.deleted += 1;
                    }
                }
                EntityUpdate::Changed => outcome.stats.changed += 1,
                EntityUpdate::Unchanged => outcome.stats.unchanged += 1,
            }
            outcome.updates.push((slot, update));
        }
        writer.write_bit(false)?;

        if from.is_some() {
            self.write_deletions(writer, &mut outcome, &leave_deletes)?;
        }

        outcome.stats.bits = writer.len_bits() - start;
        Ok(outcome)
    }

    fn write_record_header(
        writer: &mut BitWriter,
        slots: &mut GapWriter,
        slot: EntitySlot,
        enter: bool,
    ) -> Result<(), BitBufError> {
        writer.write_bit(true)?;
        slots.write(writer, slot as u64)?;
        writer.write_bit(false)?;
        writer.write_bit(enter)?;
        Ok(())
    }

    fn write_enter(
        &self,
        writer: &mut BitWriter,
        slots: &mut GapWriter,
        outcome: &mut UpdateOutcome,
        entity: &PackedEntity,
    ) -> Result<(), BitBufError> {
        let slot = entity.slot();
        Self::write_record_header(writer, slots, slot, true)?;

        if let Some(cache) = self.shared_cache() {
            if let Some(hit) = cache.lookup(self.to.set(), self.to.tick(), slot, None) {
                outcome.stats.cache_hits += 1;
                writer.write_bitslice(hit.bits())?;
                return Ok(());
            }
            let mut body = BitWriter::unbounded();
            write_enter_body(&mut body, entity, &self.computer.calc_enter(entity))?;
            writer.write_bitslice(body.as_bitslice())?;
            outcome
                .cache_stores
                .push(CachedDelta::new(slot, None, body.into_bitvec()));
            return Ok(());
        }

        let mut props = self.computer.calc_enter(entity);
        if self.cull {
            props = RecipientProxyFilter::filter(
                &props,
                self.recipient,
                None,
                entity.visibility(),
                entity.class().flattened_property_count(),
            );
        }
        write_enter_body(writer, entity, &props)?;
        Ok(())
    }

    fn write_changed(
        &self,
        writer: &mut BitWriter,
        slots: &mut GapWriter,
        outcome: &mut UpdateOutcome,
        old: &PackedEntity,
        new: &PackedEntity,
    ) -> Result<EntityUpdate, BitBufError> {
        let slot = new.slot();
        let Some(from) = self.from else {
            return Ok(EntityUpdate::Unchanged);
        };
        let from_tick = from.tick();

        // Cached records are only valid for a baseline from the same timeline
        let cache = self
            .shared_cache()
            .filter(|_| from.snapshot().set() == self.to.set());

        if let Some(cache) = cache {
            if let Some(hit) = cache.lookup(self.to.set(), self.to.tick(), slot, Some(from_tick)) {
                outcome.stats.cache_hits += 1;
                if hit.is_known_empty() {
                    return Ok(EntityUpdate::Unchanged);
                }
                Self::write_record_header(writer, slots, slot, false)?;
                writer.write_bitslice(hit.bits())?;
                return Ok(EntityUpdate::Changed);
            }

            let (delta, _) = self.computer.calc_delta(Some((old, from_tick)), new);
            if delta.is_empty() {
                outcome
                    .cache_stores
                    .push(CachedDelta::known_empty(slot, Some(from_tick)));
                return Ok(EntityUpdate::Unchanged);
            }
            let mut body = BitWriter::unbounded();
            write_props(&mut body, new, &delta)?;
            Self::write_record_header(writer, slots, slot, false)?;
            writer.write_bitslice(body.as_bitslice())?;
            outcome
                .cache_stores
                .push(CachedDelta::new(slot, Some(from_tick), body.into_bitvec()));
            return Ok(EntityUpdate::Changed);
        }

        let (mut delta, _) = self.computer.calc_delta(Some((old, from_tick)), new);
        if self.cull {
            delta = RecipientProxyFilter::filter(
                &delta,
                self.recipient,
                Some(old.visibility()),
                new.visibility(),
                new.class().flattened_property_count(),
            );
        }
        if delta.is_empty() {
            return Ok(EntityUpdate::Unchanged);
        }
        Self::write_record_header(writer, slots, slot, false)?;
        write_props(writer, new, &delta)?;
        Ok(EntityUpdate::Changed)
    }

    /// Slots the walk never reported: dormant entities destroyed out of
    /// view and explicit deletes the consumer was not told about.
    fn write_deletions(
        &self,
        writer: &mut BitWriter,
        outcome: &mut UpdateOutcome,
        leave_deletes: &[EntitySlot],
    ) -> Result<(), BitBufError> {
        let to = self.to;
        let mut deletions: Vec<EntitySlot> = Vec::new();

        let transmitted = &outcome.transmitted;
        outcome.dormant.retain(|&slot, serial| {
            if transmitted.get(slot as usize).is_some_and(|b| *b) {
                return false;
            }
            match to.entity(slot) {
                Some(now) if now.serial() == *serial => true,
                _ => {
                    deletions.push(slot);
                    false
                }
            }
        });

        for &slot in to.explicit_deletes() {
            let transmitted = outcome.transmitted.get(slot as usize).is_some_and(|b| *b);
            if !transmitted && !leave_deletes.contains(&slot) {
                deletions.push(slot);
            }
        }

        deletions.sort_unstable();
        deletions.dedup();

        writer.write_varint(deletions.len() as u64)?;
        let mut gaps = GapWriter::new();
        for &slot in &deletions {
            gaps.write(writer, slot as u64)?;
        }

        outcome.stats.deletions = deletions.len();
        outcome.deletions = deletions;
        Ok(())
    }
}
