//! Tracker namespace
//!
//! The durability engine of the tracker:
//! - [`tree`]: the in-memory directory/file hierarchy
//! - [`store`]: the store interface and the logging decorator
//! - [`editlog`]: the double-buffered write-ahead log and its segments
//! - [`snapshot`]: atomic checkpoint images of the tree
//! - [`recovery`]: snapshot load plus log replay at startup

pub mod editlog;
pub mod recovery;
pub mod snapshot;
pub mod store;
pub mod tree;

pub use editlog::{EditLog, LogOp, LogRecord, LogStats};
pub use recovery::{Recovered, RecoveryCoordinator};
pub use snapshot::{SnapshotImage, SnapshotStore};
pub use store::{InMemoryMetadataStore, LoggingMetadataStore, MetadataStore};
pub use tree::{EntryInfo, EntryKind, NamespaceTree};
