use crate::constants::{cache, client, entity, wire};

/// Replication configuration
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Transport capacity for a single update packet
    pub max_packet_bytes: usize,
    /// Unacknowledged frames a consumer keeps before dropping the oldest
    pub max_client_frames: usize,
    /// Share encoded deltas between relays with the same baseline
    pub delta_cache_enabled: bool,
    /// Cached deltas held before the cache is flushed
    pub delta_cache_max_entries: usize,
    /// Entity slots per snapshot
    pub max_entity_slots: usize,
    /// Pending acknowledgements between connection threads and the replication loop
    pub ack_buffer_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_packet_bytes: wire::DEFAULT_MAX_PACKET_BYTES,
            max_client_frames: client::DEFAULT_MAX_CLIENT_FRAMES,
            delta_cache_enabled: true,
            delta_cache_max_entries: cache::DEFAULT_MAX_ENTRIES,
            max_entity_slots: 2048,
            ack_buffer_capacity: client::DEFAULT_ACK_BUFFER_CAPACITY,
        }
    }
}

/// Parse a bounded `usize` variable, warning and returning `None` when invalid
fn env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(parsed) if (min..=max).contains(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be {}-{}, using default", name, min, max);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

impl ReplicationConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(bytes) = env_usize("REPLICATION_MAX_PACKET_BYTES", 64, 1 << 24) {
            config.max_packet_bytes = bytes;
        }

        if let Some(frames) = env_usize("REPLICATION_MAX_CLIENT_FRAMES", 1, 4096) {
            config.max_client_frames = frames;
        }

        if let Ok(enabled) = std::env::var("REPLICATION_DELTA_CACHE") {
            match enabled.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.delta_cache_enabled = true,
                "0" | "false" | "no" | "off" => config.delta_cache_enabled = false,
                _ => tracing::warn!("Invalid REPLICATION_DELTA_CACHE '{}', using default", enabled),
            }
        }

        if let Some(entries) = env_usize("REPLICATION_DELTA_CACHE_ENTRIES", 1, 1 << 22) {
            config.delta_cache_max_entries = entries;
        }

        if let Some(slots) = env_usize("REPLICATION_MAX_ENTITY_SLOTS", 1, entity::MAX_ENTITY_SLOTS) {
            config.max_entity_slots = slots;
        }

        if let Some(capacity) = env_usize("REPLICATION_ACK_BUFFER", 1, 1 << 20) {
            config.ack_buffer_capacity = capacity;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.max_packet_bytes < 64 {
            return Err("max_packet_bytes must be at least 64".to_string());
        }
        if self.max_client_frames == 0 {
            return Err("max_client_frames must be at least 1".to_string());
        }
        if self.delta_cache_enabled && self.delta_cache_max_entries == 0 {
            return Err("delta_cache_max_entries must be at least 1 when the cache is enabled".to_string());
        }
        if self.max_entity_slots == 0 || self.max_entity_slots > entity::MAX_ENTITY_SLOTS {
            return Err(format!(
                "max_entity_slots must be 1-{}",
                entity::MAX_ENTITY_SLOTS
            ));
        }
        if self.ack_buffer_capacity == 0 {
            return Err("ack_buffer_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
