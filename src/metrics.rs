//! Replication counters
//!
//! Counters and gauges for the snapshot timeline, delta computation, the
//! relay delta cache and update building. Rendered in Prometheus text format
//! or as JSON; serving them is left to whoever embeds the crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Rolling window used for build-time percentiles
const BUILD_HISTORY_SAMPLES: usize = 1000;

/// Metrics registry for the replication core
#[derive(Debug)]
pub struct ReplicationMetrics {
    // Snapshot timeline
    pub snapshots_created: AtomicU64,
    pub snapshots_live: AtomicU64,

    // Packed entities
    pub packed_entities_created: AtomicU64,
    pub packed_entities_reused: AtomicU64,
    pub packed_entities_live: AtomicU64,

    // Delta computation
    pub delta_computations: AtomicU64,
    pub delta_fast_path: AtomicU64,
    pub delta_slow_path: AtomicU64,
    pub delta_full: AtomicU64,
    pub indeterminate_fallbacks: AtomicU64,

    // Relay delta cache
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_stores: AtomicU64,
    pub cache_flushes: AtomicU64,

    // Updates
    pub delta_updates_built: AtomicU64,
    pub full_updates_built: AtomicU64,
    pub overflows: AtomicU64,
    pub bytes_built: AtomicU64,

    // Consumers
    pub acks_accepted: AtomicU64,
    pub acks_stale: AtomicU64,
    pub frames_dropped: AtomicU64,

    // Build timing (microseconds)
    pub build_time_us: AtomicU64,
    pub build_time_p95_us: AtomicU64,
    pub build_time_p99_us: AtomicU64,
    pub build_time_max_us: AtomicU64,

    start_time: Instant,

    // Rolling build times for percentile calculation
    build_history: RwLock<VecDeque<u64>>,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self {
            snapshots_created: AtomicU64::new(0),
            snapshots_live: AtomicU64::new(0),
            packed_entities_created: AtomicU64::new(0),
            packed_entities_reused: AtomicU64::new(0),
            packed_entities_live: AtomicU64::new(0),
            delta_computations: AtomicU64::new(0),
            delta_fast_path: AtomicU64::new(0),
            delta_slow_path: AtomicU64::new(0),
            delta_full: AtomicU64::new(0),
            indeterminate_fallbacks: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_stores: AtomicU64::new(0),
            cache_flushes: AtomicU64::new(0),
            delta_updates_built: AtomicU64::new(0),
            full_updates_built: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            bytes_built: AtomicU64::new(0),
            acks_accepted: AtomicU64::new(0),
            acks_stale: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            build_time_us: AtomicU64::new(0),
            build_time_p95_us: AtomicU64::new(0),
            build_time_p99_us: AtomicU64::new(0),
            build_time_max_us: AtomicU64::new(0),
            start_time: Instant::now(),
            build_history: RwLock::new(VecDeque::with_capacity(BUILD_HISTORY_SAMPLES)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Record how long one update took to build and refresh percentiles
    pub fn record_build_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.build_time_us.store(us, Ordering::Relaxed);

        let mut history = self.build_history.write();
        history.push_back(us);
        while history.len() > BUILD_HISTORY_SAMPLES {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.build_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.build_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.build_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Cache hit ratio in percent, 0 when the cache was never consulted
    pub fn cache_hit_percent(&self) -> u64 {
        let hits = Self::get(&self.cache_hits);
        let total = hits + Self::get(&self.cache_misses);
        if total == 0 {
            0
        } else {
            hits * 100 / total
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Timeline
        metric!("replication_snapshots_created_total", "Snapshots created", "counter",
            Self::get(&self.snapshots_created));
        metric!("replication_snapshots_live", "Snapshots currently held", "gauge",
            Self::get(&self.snapshots_live));
        metric!("replication_packed_entities_created_total", "Packed entities created", "counter",
            Self::get(&self.packed_entities_created));
        metric!("replication_packed_entities_reused_total", "Packed entities carried into a later snapshot", "counter",
            Self::get(&self.packed_entities_reused));
        metric!("replication_packed_entities_live", "Packed entities currently held", "gauge",
            Self::get(&self.packed_entities_live));

        // Deltas
        metric!("replication_delta_computations_total", "Delta computations", "counter",
            Self::get(&self.delta_computations));
        metric!("replication_delta_fast_path_total", "Deltas answered from change frames", "counter",
            Self::get(&self.delta_fast_path));
        metric!("replication_delta_slow_path_total", "Deltas answered by byte comparison", "counter",
            Self::get(&self.delta_slow_path));
        metric!("replication_delta_full_total", "Deltas without a baseline", "counter",
            Self::get(&self.delta_full));
        metric!("replication_indeterminate_fallbacks_total", "Change-frame queries across discontinuous history", "counter",
            Self::get(&self.indeterminate_fallbacks));

        // Cache
        metric!("replication_cache_hits_total", "Relay delta cache hits", "counter",
            Self::get(&self.cache_hits));
        metric!("replication_cache_misses_total", "Relay delta cache misses", "counter",
            Self::get(&self.cache_misses));
        metric!("replication_cache_stores_total", "Relay delta cache stores", "counter",
            Self::get(&self.cache_stores));
        metric!("replication_cache_flushes_total", "Relay delta cache flushes", "counter",
            Self::get(&self.cache_flushes));

        // Updates
        metric!("replication_delta_updates_total", "Delta updates built", "counter",
            Self::get(&self.delta_updates_built));
        metric!("replication_full_updates_total", "Full updates built", "counter",
            Self::get(&self.full_updates_built));
        metric!("replication_overflows_total", "Updates that did not fit the transport", "counter",
            Self::get(&self.overflows));
        metric!("replication_bytes_built_total", "Update bytes built", "counter",
            Self::get(&self.bytes_built));
        metric!("replication_acks_accepted_total", "Acknowledgements applied", "counter",
            Self::get(&self.acks_accepted));
        metric!("replication_acks_stale_total", "Acknowledgements ignored", "counter",
            Self::get(&self.acks_stale));
        metric!("replication_frames_dropped_total", "Unacknowledged frames dropped", "counter",
            Self::get(&self.frames_dropped));

        // Timing
        metric!("replication_build_time_microseconds", "Last update build time", "gauge",
            Self::get(&self.build_time_us));
        metric!("replication_build_time_p95_microseconds", "95th percentile build time", "gauge",
            Self::get(&self.build_time_p95_us));
        metric!("replication_build_time_p99_microseconds", "99th percentile build time", "gauge",
            Self::get(&self.build_time_p99_us));
        metric!("replication_build_time_max_microseconds", "Maximum build time", "gauge",
            Self::get(&self.build_time_max_us));
        metric!("replication_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "timeline": {{
    "snapshots_created": {},
    "snapshots_live": {},
    "packed_created": {},
    "packed_reused": {},
    "packed_live": {}
  }},
  "delta": {{
    "computations": {},
    "fast": {},
    "slow": {},
    "full": {},
    "indeterminate": {}
  }},
  "cache": {{
    "hits": {},
    "misses": {},
    "stores": {},
    "flushes": {},
    "hit_percent": {}
  }},
  "updates": {{
    "delta": {},
    "full": {},
    "overflows": {},
    "bytes": {},
    "acks_accepted": {},
    "acks_stale": {},
    "frames_dropped": {}
  }},
  "performance": {{
    "build_time_us": {},
    "build_time_p95_us": {},
    "build_time_p99_us": {},
    "build_time_max_us": {},
    "uptime_seconds": {}
  }}
}}"#,
            Self::get(&self.snapshots_created),
            Self::get(&self.snapshots_live),
            Self::get(&self.packed_entities_created),
            Self::get(&self.packed_entities_reused),
            Self::get(&self.packed_entities_live),
            Self::get(&self.delta_computations),
            Self::get(&self.delta_fast_path),
            Self::get(&self.delta_slow_path),
            Self::get(&self.delta_full),
            Self::get(&self.indeterminate_fallbacks),
            Self::get(&self.cache_hits),
            Self::get(&self.cache_misses),
            Self::get(&self.cache_stores),
            Self::get(&self.cache_flushes),
            self.cache_hit_percent(),
            Self::get(&self.delta_updates_built),
            Self::get(&self.full_updates_built),
            Self::get(&self.overflows),
            Self::get(&self.bytes_built),
            Self::get(&self.acks_accepted),
            Self::get(&self.acks_stale),
            Self::get(&self.frames_dropped),
            Self::get(&self.build_time_us),
            Self::get(&self.build_time_p95_us),
            Self::get(&self.build_time_p99_us),
            Self::get(&self.build_time_max_us),
            self.uptime_seconds(),
        )
    }
}

impl Default for ReplicationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
