//! Protobuf message bodies
//!
//! Written with `prost` derives directly; the field tags are the wire
//! contract and must not be reused.

use std::collections::HashMap;

// ---- Membership ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterResponse {
    #[prost(uint64, tag = "1")]
    pub client_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(uint64, tag = "1")]
    pub client_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Work queued for this storage node since its last heartbeat
    #[prost(message, repeated, tag = "2")]
    pub commands: Vec<RemoveFileCommand>,
}

/// Ask a storage node to drop the content of a deleted file
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct RemoveFileCommand {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClientStatus {
    Alive = 0,
    Dead = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientInfo {
    #[prost(uint64, tag = "1")]
    pub client_id: u64,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(uint32, tag = "3")]
    pub port: u32,
    #[prost(enumeration = "ClientStatus", tag = "4")]
    pub status: i32,
    #[prost(uint64, tag = "5")]
    pub registered_at_ms: u64,
    #[prost(uint64, tag = "6")]
    pub last_heartbeat_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientListResponse {
    #[prost(message, repeated, tag = "1")]
    pub clients: Vec<ClientInfo>,
}

// ---- Namespace ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MkdirRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(map = "string, string", tag = "2")]
    pub attrs: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateFileRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(map = "string, string", tag = "2")]
    pub attrs: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteFileRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

/// Outcome of a namespace mutation; `false` means "nothing changed"
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutationResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EntryKind {
    Directory = 0,
    File = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryInfo {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(enumeration = "EntryKind", tag = "2")]
    pub kind: i32,
    #[prost(map = "string, string", tag = "3")]
    pub attrs: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatResponse {
    #[prost(message, optional, tag = "1")]
    pub entry: Option<EntryInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<EntryInfo>,
}

// ---- Errors ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Empty body for requests that carry no arguments
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}
