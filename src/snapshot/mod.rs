//! Snapshot timeline
//!
//! Everything produced on the simulation side: class descriptors, packed
//! entity blobs with their change history, per-class instance baselines,
//! and the reference-counted snapshot store.

pub mod baseline;
pub mod change_frame;
pub mod class;
pub mod manager;
pub mod packed_entity;
pub mod packer;

/// Simulation step number
pub type Tick = u32;

/// Identifies an independent timeline (live, rewind buffer, ...)
pub type SnapshotSet = u32;

/// Entity slot within a snapshot
pub type EntitySlot = u16;

pub use baseline::{BaselineEntry, BaselineUpdate, InstanceBaselines};
pub use change_frame::ChangeFrameList;
pub use class::{
    BincodeFieldCodec, ClassDescriptor, ClassId, ClassRegistry, CodecError, FieldCodec,
    PackedData, PropIndex, PropertyDescriptor, PropertyValue,
};
pub use manager::{
    NewPackedEntity, PackedEntityHandle, Snapshot, SnapshotEntry, SnapshotError,
    SnapshotHandle, SnapshotManager,
};
pub use packed_entity::{PackedEntity, ProxyGroup, RecipientId, VisibilityMask};
pub use packer::{EntityPacker, LiveEntity, PackError, PackOutcome, WorldSource};
