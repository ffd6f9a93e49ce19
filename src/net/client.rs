//! Per-consumer replication state
//!
//! A consumer has one acknowledged baseline frame and a bounded queue of
//! frames sent but not yet acknowledged. Every frame holds a reference on its
//! snapshot, so the timeline is retained back to the slowest consumer's
//! baseline and no further.

use std::collections::VecDeque;
use std::sync::Arc;

use bitvec::prelude::*;
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::metrics::ReplicationMetrics;
use crate::snapshot::manager::{Snapshot, SnapshotError, SnapshotHandle, SnapshotManager};
use crate::snapshot::packed_entity::RecipientId;
use crate::snapshot::{EntitySlot, Tick};

/// Consumer identifier, also its bit in visibility masks
pub type ClientId = RecipientId;

/// Slots that left view without being destroyed, with the serial they had
pub type DormantSlots = HashMap<EntitySlot, u32, FxBuildHasher>;

/// How a consumer uses updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Sees only properties its visibility masks admit
    Player,
    /// Uncensored fan-out; shares encoded deltas through the cache
    Relay,
}

impl ConsumerKind {
    #[inline]
    pub fn applies_proxy_culling(self) -> bool {
        matches!(self, ConsumerKind::Player)
    }
}

/// What one update told the consumer
#[derive(Debug, Clone)]
pub struct ClientFrame {
    snapshot: Arc<Snapshot>,
    /// Slots the consumer holds after applying the update
    transmitted: BitVec,
    dormant: DormantSlots,
}

impl ClientFrame {
    pub fn new(snapshot: Arc<Snapshot>, transmitted: BitVec, dormant: DormantSlots) -> Self {
        Self {
            snapshot,
            transmitted,
            dormant,
        }
    }

    #[inline]
    pub fn tick(&self) -> Tick {
        self.snapshot.tick()
    }

    #[inline]
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    #[inline]
    pub fn handle(&self) -> SnapshotHandle {
        self.snapshot.handle()
    }

    /// Transmitted slots, ascending
    pub fn transmitted_slots(&self) -> impl Iterator<Item = EntitySlot> + '_ {
        self.transmitted.iter_ones().map(|i| i as EntitySlot)
    }

    pub fn dormant(&self) -> &DormantSlots {
        &self.dormant
    }
}

/// One downstream consumer
#[derive(Debug)]
pub struct ReplicationClient {
    id: ClientId,
    kind: ConsumerKind,
    baseline: Option<ClientFrame>,
    /// Sent, unacknowledged, ascending by tick
    frames: VecDeque<ClientFrame>,
    /// Entity slots upstream visibility allows; `None` means every entity
    visible: Option<BitVec>,
    max_frames: usize,
}

impl ReplicationClient {
    pub fn new(id: ClientId, kind: ConsumerKind, max_frames: usize) -> Self {
        Self {
            id,
            kind,
            baseline: None,
            frames: VecDeque::with_capacity(max_frames.min(64)),
            visible: None,
            max_frames: max_frames.max(1),
        }
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    pub fn baseline(&self) -> Option<&ClientFrame> {
        self.baseline.as_ref()
    }

    /// Last acknowledged tick
    pub fn last_acknowledged(&self) -> Option<Tick> {
        self.baseline.as_ref().map(ClientFrame::tick)
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn pending_ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        self.frames.iter().map(ClientFrame::tick)
    }

    /// Replace the upstream visibility list; `None` makes everything visible
    pub fn set_visible_entities(&mut self, slots: Option<&[EntitySlot]>) {
        self.visible = slots.map(|slots| {
            let len = slots.iter().map(|&s| s as usize + 1).max().unwrap_or(0);
            let mut bits = BitVec::repeat(false, len);
            for &slot in slots {
                bits.set(slot as usize, true);
            }
            bits
        });
    }

    pub fn visible_entities(&self) -> Option<&BitSlice> {
        self.visible.as_deref()
    }

    #[inline]
    pub fn can_see(&self, slot: EntitySlot) -> bool {
        match &self.visible {
            None => true,
            Some(bits) => bits.get(slot as usize).is_some_and(|b| *b),
        }
    }

    /// Queue a sent frame. The frame's snapshot reference is owned by the
    /// client from here on.
    pub fn push_frame(
        &mut self,
        frame: ClientFrame,
        manager: &SnapshotManager,
        metrics: &ReplicationMetrics,
    ) -> Result<(), SnapshotError> {
        // Rebuilt update for the same tick replaces the previous one
        if let Some(pos) = self.frames.iter().position(|f| f.tick() == frame.tick()) {
            if let Some(old) = self.frames.remove(pos) {
                manager.release_snapshot(old.handle())?;
            }
        }

        while self.frames.len() >= self.max_frames {
            let Some(oldest) = self.frames.pop_front() else {
                break;
            };
            warn!(client = self.id, tick = oldest.tick(), "dropping unacknowledged frame");
            ReplicationMetrics::incr(&metrics.frames_dropped);
            manager.release_snapshot(oldest.handle())?;
        }

        let pos = self.frames.partition_point(|f| f.tick() < frame.tick());
        self.frames.insert(pos, frame);
        Ok(())
    }

    /// Apply an acknowledgement. Returns false for stale or unknown ticks.
    ///
    /// The baseline only moves forward; frames older than the acknowledged
    /// one are released with the previous baseline.
    pub fn acknowledge(
        &mut self,
        tick: Tick,
        manager: &SnapshotManager,
        metrics: &ReplicationMetrics,
    ) -> Result<bool, SnapshotError> {
        if self.last_acknowledged().is_some_and(|acked| tick <= acked) {
            debug!(client = self.id, tick, "stale acknowledgement");
            ReplicationMetrics::incr(&metrics.acks_stale);
            return Ok(false);
        }
        let Some(pos) = self.frames.iter().position(|f| f.tick() == tick) else {
            warn!(client = self.id, tick, "acknowledgement for a frame no longer held");
            ReplicationMetrics::incr(&metrics.acks_stale);
            return Ok(false);
        };

        for older in self.frames.drain(..pos) {
            manager.release_snapshot(older.handle())?;
        }
        let acked = self.frames.pop_front();
        if let Some(previous) = std::mem::replace(&mut self.baseline, acked) {
            manager.release_snapshot(previous.handle())?;
        }

        ReplicationMetrics::incr(&metrics.acks_accepted);
        Ok(true)
    }

    /// Forget the baseline so the next update is a full one
    pub fn reset_baseline(&mut self, manager: &SnapshotManager) -> Result<(), SnapshotError> {
        if let Some(previous) = self.baseline.take() {
            manager.release_snapshot(previous.handle())?;
        }
        Ok(())
    }

    /// Give back every snapshot reference held by this client
    pub fn release_all(&mut self, manager: &SnapshotManager) -> Result<(), SnapshotError> {
        self.reset_baseline(manager)?;
        for frame in self.frames.drain(..) {
            manager.release_snapshot(frame.handle())?;
        }
        Ok(())
    }
}
