//! Snapshot Replication Library
//!
//! Server-side entity state replication: the simulation packs its entities
//! into reference-counted snapshots once per tick, and every consumer gets a
//! delta against the last snapshot it acknowledged.
//!
//! # Features
//!
//! - `parallel` - Build per-consumer updates on the rayon pool (enabled by default)

pub mod config;
pub mod constants;
pub mod metrics;
pub mod net;
pub mod snapshot;
pub mod util;
