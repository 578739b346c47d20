//! Configuration types for the tracker
//!
//! The configuration arrives already parsed; every section is defaulted so
//! a partial file (or no file at all) yields a working tracker.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the tracker
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Node identity and addresses
    pub node: NodeConfig,
    /// Edit log configuration
    pub edit_log: EditLogConfig,
    /// Snapshot (image) configuration
    pub snapshot: SnapshotConfig,
    /// Storage node membership configuration
    pub membership: MembershipConfig,
    /// Request dispatch configuration
    pub dispatcher: DispatcherConfig,
}

impl TrackerConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.node.listen.is_empty() {
            return Err(Error::configuration("node.listen must name at least one address"));
        }
        self.dispatcher.validate()?;
        if self.edit_log.flush_threshold_bytes == 0 {
            return Err(Error::configuration("edit_log.flush_threshold_bytes must be > 0"));
        }
        if self.membership.heartbeat_timeout_ms == 0 {
            return Err(Error::configuration("membership.heartbeat_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Directory holding edit log segments
    #[must_use]
    pub fn edit_log_dir(&self) -> PathBuf {
        self.node.base_dir.join("editlog")
    }

    /// Directory holding snapshot images
    #[must_use]
    pub fn image_dir(&self) -> PathBuf {
        self.node.base_dir.join("image")
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Addresses to accept storage node and client connections on
    pub listen: Vec<SocketAddr>,
    /// Base directory for edit log segments and snapshots
    pub base_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "tracker".to_string(),
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 5671))],
            base_dir: PathBuf::from("./tracker-data"),
        }
    }
}

/// Edit log (write-ahead log) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EditLogConfig {
    /// Active buffer size that triggers a flush
    pub flush_threshold_bytes: usize,
    /// Periodic flush timer (milliseconds)
    pub flush_interval_ms: u64,
    /// Roll to a new segment once the current one exceeds this size
    pub segment_max_bytes: u64,
    /// fsync the segment after every flush
    pub sync_on_flush: bool,
}

impl Default for EditLogConfig {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: 512 * 1024,    // 512 KiB
            flush_interval_ms: 1000,
            segment_max_bytes: 64 * 1024 * 1024, // 64 MiB
            sync_on_flush: true,
        }
    }
}

impl EditLogConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Snapshot configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Periodic checkpoint interval (seconds)
    pub interval_secs: u64,
    /// Number of snapshots kept on disk
    pub retention: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            retention: 2,
        }
    }
}

impl SnapshotConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Storage node membership configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// A node without a heartbeat for this long is marked DEAD
    pub heartbeat_timeout_ms: u64,
    /// How often the liveness scan runs
    pub liveness_scan_interval_ms: u64,
    /// How often the trash task runs
    pub trash_interval_ms: u64,
    /// How long DEAD records are kept before physical removal
    pub dead_retention_ms: u64,
    /// How long deleted paths wait before removal commands are issued
    pub trash_grace_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            liveness_scan_interval_ms: 5_000,
            trash_interval_ms: 60_000,
            dead_retention_ms: 10 * 60 * 1000,
            trash_grace_ms: 60_000,
        }
    }
}

impl MembershipConfig {
    #[must_use]
    pub const fn liveness_scan_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_scan_interval_ms)
    }

    #[must_use]
    pub const fn trash_interval(&self) -> Duration {
        Duration::from_millis(self.trash_interval_ms)
    }
}

/// What to do when the worker pool backlog is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backpressure {
    /// Fail the submission immediately with an overload error
    #[default]
    Reject,
    /// Wait for backlog space, failing with an overload error after the timeout
    Block { timeout_ms: u64 },
}

/// Request dispatch configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Workers that stay alive while idle
    pub core_workers: usize,
    /// Upper bound on concurrently running handlers
    pub max_workers: usize,
    /// Queued requests waiting for a worker
    pub backlog: usize,
    /// Idle time after which workers above the core count exit (milliseconds)
    pub keep_alive_ms: u64,
    /// Largest accepted packet body
    pub max_frame_bytes: usize,
    /// Policy applied when the backlog is full
    pub backpressure: Backpressure,
    /// Default `send_sync` timeout for clients (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            core_workers: 8,
            max_workers: 20,
            backlog: 8,
            keep_alive_ms: 60_000,
            max_frame_bytes: 16 * 1024 * 1024, // 16 MiB
            backpressure: Backpressure::Reject,
            request_timeout_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    /// Check worker pool bounds
    pub fn validate(&self) -> Result<()> {
        if self.core_workers == 0 {
            return Err(Error::configuration("dispatcher.core_workers must be > 0"));
        }
        if self.max_workers < self.core_workers {
            return Err(Error::configuration(
                "dispatcher.max_workers must be >= dispatcher.core_workers",
            ));
        }
        if self.backlog == 0 {
            return Err(Error::configuration("dispatcher.backlog must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.node.listen.len(), 1);
        assert_eq!(config.dispatcher.core_workers, 8);
        assert_eq!(config.dispatcher.backpressure, Backpressure::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: TrackerConfig = toml::from_str(
            r#"
            [node]
            listen = ["127.0.0.1:7000", "127.0.0.1:7001"]
            base_dir = "/tmp/tracker"

            [dispatcher]
            max_workers = 4
            core_workers = 2
            backpressure = { policy = "block", timeout_ms = 250 }
            "#,
        )
        .unwrap();

        assert_eq!(config.node.listen.len(), 2);
        assert_eq!(config.dispatcher.core_workers, 2);
        assert_eq!(
            config.dispatcher.backpressure,
            Backpressure::Block { timeout_ms: 250 }
        );
        // Untouched sections keep their defaults
        assert_eq!(config.edit_log.flush_interval_ms, 1000);
        assert_eq!(config.edit_log_dir(), PathBuf::from("/tmp/tracker/editlog"));
    }

    #[test]
    fn test_validate_rejects_bad_pool() {
        let mut config = TrackerConfig::default();
        config.dispatcher.max_workers = 1;
        config.dispatcher.core_workers = 2;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = TrackerConfig::default();
        config.node.listen.clear();
        assert!(config.validate().is_err());
    }
}
