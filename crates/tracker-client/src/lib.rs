//! Tracker client
//!
//! This crate provides the typed client used by storage nodes, the CLI and
//! the end-to-end tests.

pub mod tracker;

// Re-exports
pub use tracker::TrackerClient;
pub use tracker_proto::messages::{ClientInfo, ClientStatus, EntryInfo, EntryKind, HeartbeatResponse};
