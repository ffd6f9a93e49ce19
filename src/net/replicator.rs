//! Update building for every consumer of a snapshot timeline
//!
//! Per tick:
//! 1. `apply_acks` moves consumer baselines forward
//! 2. `prepare_tick` points the shared delta cache at the new snapshot
//! 3. `build_updates` encodes one packet per consumer
//!
//! A build that does not fit the packet limit leaves the consumer and the
//! cache exactly as they were.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::metrics::ReplicationMetrics;
use crate::net::ack_buffer::AckBuffer;
use crate::net::bitbuf::{BitBufError, BitWriter};
use crate::net::client::{ClientFrame, ClientId, ReplicationClient};
use crate::net::delta_cache::DeltaEncodingCache;
use crate::net::entity_writer::{ReplicationStateMachine, UpdateStats};
use crate::snapshot::manager::{Snapshot, SnapshotError, SnapshotManager};
use crate::snapshot::Tick;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicationError {
    #[error("update for tick {tick} does not fit in {limit_bytes} bytes")]
    DidNotFit { tick: Tick, limit_bytes: usize },
    #[error("encoding failed: {0}")]
    Encode(BitBufError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// One encoded packet
#[derive(Debug, Clone)]
pub struct BuiltUpdate {
    pub bytes: Vec<u8>,
    pub tick: Tick,
    /// Baseline tick for deltas; `None` for full updates
    pub from_tick: Option<Tick>,
    pub stats: UpdateStats,
}

impl BuiltUpdate {
    #[inline]
    pub fn is_delta(&self) -> bool {
        self.from_tick.is_some()
    }
}

pub struct Replicator {
    manager: Arc<SnapshotManager>,
    cache: DeltaEncodingCache,
    metrics: Arc<ReplicationMetrics>,
    config: ReplicationConfig,
}

impl Replicator {
    pub fn new(manager: Arc<SnapshotManager>, config: ReplicationConfig) -> Self {
        let metrics = Arc::clone(manager.metrics());
        info!(
            max_packet_bytes = config.max_packet_bytes,
            delta_cache = config.delta_cache_enabled,
            "replicator ready"
        );
        Self {
            cache: DeltaEncodingCache::new(config.delta_cache_max_entries, Arc::clone(&metrics)),
            manager,
            metrics,
            config,
        }
    }

    pub fn manager(&self) -> &Arc<SnapshotManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &DeltaEncodingCache {
        &self.cache
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Retarget the shared cache at `to`
    pub fn prepare_tick(&self, to: &Snapshot) {
        if self.config.delta_cache_enabled {
            self.cache.set_tick(to.set(), to.tick());
        }
    }

    fn map_encode(&self, tick: Tick, err: BitBufError) -> ReplicationError {
        match err {
            BitBufError::Overflow { .. } => {
                ReplicationMetrics::incr(&self.metrics.overflows);
                warn!(tick, limit = self.config.max_packet_bytes, "update did not fit");
                ReplicationError::DidNotFit {
                    tick,
                    limit_bytes: self.config.max_packet_bytes,
                }
            }
            other => ReplicationError::Encode(other),
        }
    }

    /// Encode the update taking `client` from its baseline to `to`.
    ///
    /// On success the client holds a new pending frame for `to`.
    pub fn build_update(
        &self,
        client: &mut ReplicationClient,
        to: &Arc<Snapshot>,
    ) -> Result<BuiltUpdate, ReplicationError> {
        let started = Instant::now();
        let cache = self.config.delta_cache_enabled.then_some(&self.cache);
        let from_tick = client.last_acknowledged();

        let mut writer = BitWriter::with_byte_limit(self.config.max_packet_bytes);
        let outcome = ReplicationStateMachine::new(to, &self.metrics)
            .from_frame(client.baseline())
            .for_recipient(client.id(), client.kind())
            .with_visibility(client.visible_entities())
            .with_cache(cache)
            .write_update(&mut writer)
            .map_err(|e| self.map_encode(to.tick(), e))?;

        // The packet fits: commit shared state
        for stored in outcome.cache_stores {
            self.cache.store(to.set(), to.tick(), stored);
        }
        self.manager.add_snapshot_reference(to.handle())?;
        let frame = ClientFrame::new(Arc::clone(to), outcome.transmitted, outcome.dormant);
        client.push_frame(frame, &self.manager, &self.metrics)?;

        let bytes = writer.into_bytes();
        if from_tick.is_some() {
            ReplicationMetrics::incr(&self.metrics.delta_updates_built);
        } else {
            ReplicationMetrics::incr(&self.metrics.full_updates_built);
        }
        self.metrics
            .bytes_built
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.metrics.record_build_time(started.elapsed());

        debug!(
            client = client.id(),
            tick = to.tick(),
            from = ?from_tick,
            bytes = bytes.len(),
            entered = outcome.stats.entered,
            changed = outcome.stats.changed,
            left = outcome.stats.left,
            "update built"
        );

        Ok(BuiltUpdate {
            bytes,
            tick: to.tick(),
            from_tick,
            stats: outcome.stats,
        })
    }

    /// Full uncensored update of `to` for an out-of-band consumer such as a
    /// recorder. No consumer state is touched.
    pub fn build_full_snapshot_update(&self, to: &Snapshot) -> Result<Vec<u8>, ReplicationError> {
        let mut writer = BitWriter::with_byte_limit(self.config.max_packet_bytes);
        ReplicationStateMachine::new(to, &self.metrics)
            .write_update(&mut writer)
            .map_err(|e| self.map_encode(to.tick(), e))?;
        ReplicationMetrics::incr(&self.metrics.full_updates_built);
        Ok(writer.into_bytes())
    }

    /// Build for every consumer; results are in `clients` order
    pub fn build_updates(
        &self,
        clients: &mut [ReplicationClient],
        to: &Arc<Snapshot>,
    ) -> Vec<Result<BuiltUpdate, ReplicationError>> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            clients
                .par_iter_mut()
                .map(|client| self.build_update(client, to))
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            clients
                .iter_mut()
                .map(|client| self.build_update(client, to))
                .collect()
        }
    }

    /// Record that `client` applied the update for `tick`
    pub fn acknowledge_received(
        &self,
        client: &mut ReplicationClient,
        tick: Tick,
    ) -> Result<bool, ReplicationError> {
        Ok(client.acknowledge(tick, &self.manager, &self.metrics)?)
    }

    /// Apply every queued acknowledgement. Returns how many were accepted.
    pub fn apply_acks(
        &self,
        clients: &mut [ReplicationClient],
        buffer: &AckBuffer,
    ) -> Result<usize, ReplicationError> {
        let mut accepted = 0;
        for ack in buffer.drain() {
            let Some(client) = clients.iter_mut().find(|c| c.id() == ack.client) else {
                debug!(client = ack.client, tick = ack.tick, "ack for unknown client");
                ReplicationMetrics::incr(&self.metrics.acks_stale);
                continue;
            };
            if self.acknowledge_received(client, ack.tick)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Release every snapshot `client` still references
    pub fn remove_client(&self, client: &mut ReplicationClient) -> Result<(), ReplicationError> {
        debug!(client = client.id(), "removing client");
        client.release_all(&self.manager)?;
        Ok(())
    }

    /// Consumer ids in `clients` whose baseline is older than `tick`
    pub fn lagging_clients(clients: &[ReplicationClient], tick: Tick) -> Vec<ClientId> {
        clients
            .iter()
            .filter(|c| c.last_acknowledged().map_or(true, |acked| acked < tick))
            .map(ReplicationClient::id)
            .collect()
    }
}
