//! Shared encoded deltas for uncensored relays
//!
//! Relays with the same baseline need byte-identical entity records. The
//! first relay to encode a record for `(slot, from_tick)` stores the bits;
//! the others splice them in verbatim. Entries are pure memoization scoped to
//! one target `(set, tick)`: moving to another target flushes everything, and
//! dropping an entry at any time only costs a recomputation.
//!
//! Only consumers that skip per-recipient proxy culling may use this cache.
//! Cached bits are the uncensored delta.

use std::sync::Arc;

use bitvec::prelude::*;
use hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use tracing::{debug, trace};

use crate::metrics::ReplicationMetrics;
use crate::snapshot::{EntitySlot, SnapshotSet, Tick};

/// Baseline side of a cache key; `None` is the no-baseline (EnterView) record
pub type FromTick = Option<Tick>;

/// Encoded record body for one entity and baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDelta {
    slot: EntitySlot,
    from_tick: FromTick,
    bits: BitVec<u8, Lsb0>,
}

impl CachedDelta {
    pub fn new(slot: EntitySlot, from_tick: FromTick, bits: BitVec<u8, Lsb0>) -> Self {
        Self { slot, from_tick, bits }
    }

    /// Provably unchanged since the baseline
    pub fn known_empty(slot: EntitySlot, from_tick: FromTick) -> Self {
        Self::new(slot, from_tick, BitVec::new())
    }

    #[inline]
    pub fn slot(&self) -> EntitySlot {
        self.slot
    }

    #[inline]
    pub fn from_tick(&self) -> FromTick {
        self.from_tick
    }

    #[inline]
    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    /// Zero-length entry: "no difference", not "not computed"
    #[inline]
    pub fn is_known_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn bits(&self) -> &BitSlice<u8, Lsb0> {
        &self.bits
    }
}

struct CacheInner {
    scope: Option<(SnapshotSet, Tick)>,
    entries: HashMap<(EntitySlot, FromTick), Arc<CachedDelta>, FxBuildHasher>,
}

/// Delta memo shared by all relay update builds of one tick
pub struct DeltaEncodingCache {
    inner: RwLock<CacheInner>,
    max_entries: usize,
    metrics: Arc<ReplicationMetrics>,
}

impl DeltaEncodingCache {
    pub fn new(max_entries: usize, metrics: Arc<ReplicationMetrics>) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                scope: None,
                entries: HashMap::with_capacity_and_hasher(max_entries.min(4096), FxBuildHasher),
            }),
            max_entries: max_entries.max(1),
            metrics,
        }
    }

    /// Point the cache at a new target snapshot; flushes on change.
    pub fn set_tick(&self, set: SnapshotSet, tick: Tick) {
        let mut inner = self.inner.write();
        if inner.scope == Some((set, tick)) {
            return;
        }
        if !inner.entries.is_empty() {
            ReplicationMetrics::incr(&self.metrics.cache_flushes);
        }
        trace!(set, tick, dropped = inner.entries.len(), "delta cache retargeted");
        inner.entries.clear();
        inner.scope = Some((set, tick));
    }

    /// Current target `(set, tick)`
    pub fn current(&self) -> Option<(SnapshotSet, Tick)> {
        self.inner.read().scope
    }

    /// Cached record for `slot` from `from_tick` into the target `(set, tick)`
    pub fn lookup(
        &self,
        set: SnapshotSet,
        tick: Tick,
        slot: EntitySlot,
        from_tick: FromTick,
    ) -> Option<Arc<CachedDelta>> {
        let inner = self.inner.read();
        let hit = if inner.scope == Some((set, tick)) {
            inner.entries.get(&(slot, from_tick)).cloned()
        } else {
            None
        };
        drop(inner);

        if hit.is_some() {
            ReplicationMetrics::incr(&self.metrics.cache_hits);
        } else {
            ReplicationMetrics::incr(&self.metrics.cache_misses);
        }
        hit
    }

    /// Remember a record. Ignored when the cache targets another snapshot.
    pub fn store(&self, set: SnapshotSet, tick: Tick, delta: CachedDelta) -> bool {
        let mut inner = self.inner.write();
        if inner.scope != Some((set, tick)) {
            return false;
        }
        if inner.entries.len() >= self.max_entries {
            debug!(entries = inner.entries.len(), "delta cache full, flushing");
            inner.entries.clear();
            ReplicationMetrics::incr(&self.metrics.cache_flushes);
        }
        inner
            .entries
            .insert((delta.slot, delta.from_tick), Arc::new(delta));
        ReplicationMetrics::incr(&self.metrics.cache_stores);
        true
    }

    pub fn flush(&self) {
        let mut inner = self.inner.write();
        if !inner.entries.is_empty() {
            ReplicationMetrics::incr(&self.metrics.cache_flushes);
        }
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
