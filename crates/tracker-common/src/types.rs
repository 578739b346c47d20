//! Core types shared by tracker components

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Attribute mapping attached to namespace entries and log records
pub type Attributes = BTreeMap<String, String>;

/// Transaction identifier assigned to every edit log record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl TxId {
    /// No record has been applied yet
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned to a registered storage node
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness state of a storage node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientState {
    /// Heartbeats arrive within the timeout
    Alive,
    /// Missed the heartbeat timeout; must re-register
    Dead,
}

impl ClientState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "ALIVE",
            Self::Dead => "DEAD",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Source of unique, strictly increasing identifiers
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Bits reserved for the per-millisecond sequence
const SEQUENCE_BITS: u32 = 12;

/// Timestamp-based id generator
///
/// Ids are `millis << 12 | sequence`. When the clock stalls or steps
/// backwards the generator keeps counting from the last issued id, so
/// ids never repeat and never decrease.
pub struct MonotonicIdGenerator {
    last: Mutex<u64>,
}

impl MonotonicIdGenerator {
    pub const fn new() -> Self {
        Self { last: Mutex::new(0) }
    }
}

impl Default for MonotonicIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for MonotonicIdGenerator {
    fn next_id(&self) -> u64 {
        let candidate = now_millis() << SEQUENCE_BITS;
        let mut last = self.last.lock();
        let id = candidate.max(*last + 1);
        *last = id;
        id
    }
}
