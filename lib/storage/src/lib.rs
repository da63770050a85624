//! # StrataVec Storage
//!
//! Durable-state subsystems for the StrataVec vector search engine:
//!
//! - [`CdcStream`] - Change data capture ring with subscriber fan-out,
//!   cursor polling, and an optional binary append log
//! - [`SnapshotStore`] - Point-in-time vector set snapshots with whole-store
//!   serialization

pub mod cdc;
pub mod snapshot;

pub use cdc::{
    CdcCallback, CdcChange, CdcConfig, CdcCursor, CdcEvent, CdcEventKind, CdcStream, ALL_EVENTS,
};
pub use snapshot::{Snapshot, SnapshotInfo, SnapshotStore};
