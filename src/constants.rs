/// Entity slot and identity limits
pub mod entity {
    /// Bits needed to address any entity slot
    pub const MAX_ENTITY_BITS: usize = 14;
    /// Hard upper bound on entity slots per snapshot
    pub const MAX_ENTITY_SLOTS: usize = 1 << MAX_ENTITY_BITS;
    /// Low bits of the instance serial number sent on EnterView
    pub const SERIAL_NUMBER_BITS: usize = 17;
    /// Upper bound on flattened properties per class
    pub const MAX_PROPERTIES: usize = 4096;
}

/// Change-frame indexing constants
pub mod change_frame {
    /// Properties summarized by one bucket maximum
    pub const BUCKET_SIZE: usize = 32;

    /// Number of buckets needed for `property_count` properties
    #[inline]
    pub const fn bucket_count(property_count: usize) -> usize {
        (property_count + BUCKET_SIZE - 1) / BUCKET_SIZE
    }
}

/// Snapshot timeline constants
pub mod snapshot {
    use crate::snapshot::SnapshotSet;

    /// The live simulation timeline
    pub const DEFAULT_SET: SnapshotSet = 0;
    /// Secondary timeline used for rewind/replay buffers
    pub const REWIND_SET: SnapshotSet = DEFAULT_SET + 1;
}

/// Wire and transport limits
pub mod wire {
    /// Default transport capacity for a single update packet
    pub const DEFAULT_MAX_PACKET_BYTES: usize = 16 * 1024;
    /// Bits used to carry a tick number
    pub const TICK_BITS: usize = 32;
    /// Longest varint accepted by the reader (u64 in 7-bit groups)
    pub const MAX_VARINT_GROUPS: usize = 10;
}

/// Consumer bookkeeping defaults
pub mod client {
    /// Unacknowledged frames retained per consumer
    pub const DEFAULT_MAX_CLIENT_FRAMES: usize = 128;
    /// Acknowledgements queued between connection threads and the replication loop
    pub const DEFAULT_ACK_BUFFER_CAPACITY: usize = 1024;
}

/// Delta cache defaults
pub mod cache {
    /// Entries held before the cache is flushed
    pub const DEFAULT_MAX_ENTRIES: usize = 16 * 1024;
}
