//! Error types for the tracker
//!
//! This module defines the common error types used throughout the system.
//! Variants are grouped by how the tracker reacts to them: protocol errors
//! close the offending connection, validation errors become negative
//! responses, durability and recovery errors stop the process.

use thiserror::Error;

/// Common result type for tracker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the tracker
#[derive(Debug, Error)]
pub enum Error {
    // Protocol errors
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {size} bytes, max {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown packet type: {0}")]
    UnknownPacketType(i32),

    // Validation errors
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path already exists: {0}")]
    PathExists(String),

    #[error("parent directory not found: {0}")]
    ParentNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("unknown client: {0}")]
    UnknownClient(u64),

    #[error("client already registered: {0}")]
    DuplicateClient(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Durability errors
    #[error("edit log write failed: {0}")]
    LogWrite(String),

    #[error("edit log is failed and no longer accepts records")]
    LogFailed,

    #[error("snapshot write failed: {0}")]
    SnapshotWrite(String),

    // Recovery errors
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("missing edit log segment: expected a record with txid {expected}")]
    MissingSegment { expected: u64 },

    #[error("corrupt edit log segment: {0}")]
    CorruptSegment(String),

    #[error("replay diverged: {0}")]
    ReplayDiverged(String),

    // Transport errors
    #[error("request timeout")]
    Timeout,

    #[error("server overloaded")]
    Overloaded,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("shutting down")]
    ShuttingDown,

    /// Error reported by the remote side that has no local counterpart
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    // Generic errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a malformed frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the caller may retry the operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Overloaded | Self::ConnectionFailed(_) | Self::ConnectionClosed
        )
    }

    /// Check if this error must stop the process instead of being served around
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LogWrite(_)
                | Self::LogFailed
                | Self::SnapshotWrite(_)
                | Self::CorruptSnapshot(_)
                | Self::MissingSegment { .. }
                | Self::CorruptSegment(_)
                | Self::ReplayDiverged(_)
        )
    }

    /// Check if this is a protocol error that poisons the connection
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::FrameTooLarge { .. } | Self::UnknownPacketType(_)
        )
    }

    /// Check if this is a validation error answered with a negative result
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_)
                | Self::PathNotFound(_)
                | Self::PathExists(_)
                | Self::ParentNotFound(_)
                | Self::NotADirectory(_)
                | Self::IsADirectory(_)
                | Self::UnknownClient(_)
                | Self::DuplicateClient(_)
                | Self::InvalidRegistration(_)
                | Self::InvalidRequest(_)
        )
    }

    /// Stable error code carried in ERROR packets
    #[must_use]
    pub fn wire_code(&self) -> u32 {
        match self {
            // 1xx protocol
            Self::MalformedFrame(_) => 100,
            Self::FrameTooLarge { .. } => 101,
            Self::UnknownPacketType(_) => 102,

            // 2xx validation
            Self::InvalidPath(_) => 200,
            Self::PathNotFound(_) => 201,
            Self::PathExists(_) => 202,
            Self::ParentNotFound(_) => 203,
            Self::NotADirectory(_) => 204,
            Self::IsADirectory(_) => 205,
            Self::UnknownClient(_) => 206,
            Self::DuplicateClient(_) => 207,
            Self::InvalidRegistration(_) => 208,
            Self::InvalidRequest(_) => 209,

            // 3xx durability
            Self::LogWrite(_) => 300,
            Self::LogFailed => 301,
            Self::SnapshotWrite(_) => 302,

            // 4xx recovery
            Self::CorruptSnapshot(_) => 400,
            Self::MissingSegment { .. } => 401,
            Self::CorruptSegment(_) => 402,
            Self::ReplayDiverged(_) => 403,

            // 5xx transport
            Self::Timeout => 500,
            Self::Overloaded => 501,
            Self::ConnectionFailed(_) => 502,
            Self::ConnectionClosed => 503,
            Self::ShuttingDown => 504,
            Self::Remote { code, .. } => *code,

            // 9xx generic
            Self::Io(_) => 900,
            Self::Serialization(_) => 901,
            Self::Deserialization(_) => 902,
            Self::Configuration(_) => 903,
            Self::Internal(_) => 999,
        }
    }

    /// Rebuild an error received in an ERROR packet
    ///
    /// Codes without payload map back to their variant so that
    /// `is_retryable` keeps working across the wire; everything else is
    /// kept as [`Error::Remote`].
    #[must_use]
    pub fn from_wire(code: u32, message: impl Into<String>) -> Self {
        match code {
            301 => Self::LogFailed,
            500 => Self::Timeout,
            501 => Self::Overloaded,
            503 => Self::ConnectionClosed,
            504 => Self::ShuttingDown,
            _ => Self::Remote {
                code,
                message: message.into(),
            },
        }
    }
}
