//! Tracker
//!
//! The tracker keeps the file namespace durable through its edit log and
//! snapshots, tracks storage node liveness, and serves both over the
//! framed packet protocol.

pub mod fatal;
pub mod file_service;
pub mod handlers;
pub mod membership;
pub mod server;
pub mod trash;

pub use fatal::FatalSignal;
pub use file_service::TrackerFileService;
pub use membership::{ClientMembership, ClientRecord};
pub use server::TrackerServer;
pub use trash::TrashQueue;
