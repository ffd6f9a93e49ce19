//! Consumer-facing replication
//!
//! Delta computation, per-recipient culling, the shared encoding cache and
//! the per-consumer state machine that turns snapshots into packets.

pub mod ack_buffer;
pub mod bitbuf;
pub mod client;
pub mod delta;
pub mod delta_cache;
pub mod entity_writer;
pub mod proxy_filter;
pub mod reader;
pub mod replicator;

pub use ack_buffer::{AckBuffer, AckBufferError, AckMessage, AckSender};
pub use bitbuf::{BitBufError, BitReader, BitWriter};
pub use client::{ClientFrame, ClientId, ConsumerKind, ReplicationClient};
pub use delta::{DeltaComputer, DeltaPath, DeltaResult};
pub use delta_cache::{CachedDelta, DeltaEncodingCache};
pub use entity_writer::{EntityUpdate, ReplicationStateMachine, UpdateOutcome, UpdateStats};
pub use proxy_filter::RecipientProxyFilter;
pub use reader::{decode_update, ClientEntity, ClientEntityTable, DecodedUpdate, EntityEvent, ReadError};
pub use replicator::{BuiltUpdate, ReplicationError, Replicator};
