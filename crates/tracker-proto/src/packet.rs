//! Packet and packet type definitions

use crate::messages::ErrorResponse;
use bytes::Bytes;
use prost::Message;
use std::fmt;
use tracker_common::{Error, Result};

/// Packet type tag
///
/// The type space is open: handlers can be registered for any value, the
/// constants below are the types the tracker itself understands.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketType(pub i32);

impl PacketType {
    /// Generic acknowledgement / successful response
    pub const RESPONSE: Self = Self(1);
    /// Failed request; body is an [`ErrorResponse`]
    pub const ERROR: Self = Self(2);

    // Membership
    pub const CLIENT_REGISTER: Self = Self(10);
    pub const CLIENT_HEART_BEAT: Self = Self(11);
    pub const CLIENT_LIST: Self = Self(12);

    // Namespace
    pub const MKDIR: Self = Self(20);
    pub const CREATE_FILE: Self = Self(21);
    pub const DELETE_FILE: Self = Self(22);
    pub const STAT: Self = Self(23);
    pub const LIST: Self = Self(24);

    /// Responses complete a pending request instead of being dispatched
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.0 == Self::RESPONSE.0 || self.0 == Self::ERROR.0
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            1 => "RESPONSE",
            2 => "ERROR",
            10 => "CLIENT_REGISTER",
            11 => "CLIENT_HEART_BEAT",
            12 => "CLIENT_LIST",
            20 => "MKDIR",
            21 => "CREATE_FILE",
            22 => "DELETE_FILE",
            23 => "STAT",
            24 => "LIST",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One framed protocol unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Correlation token; a response carries the id of its request
    pub request_id: u64,
    pub body: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, request_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            request_id,
            body: body.into(),
        }
    }

    /// Build a request packet with a protobuf body
    pub fn request<M: Message>(packet_type: PacketType, request_id: u64, message: &M) -> Self {
        Self::new(packet_type, request_id, message.encode_to_vec())
    }

    /// Build a successful response to `request_id`
    pub fn response<M: Message>(request_id: u64, message: &M) -> Self {
        Self::new(PacketType::RESPONSE, request_id, message.encode_to_vec())
    }

    /// Build an empty acknowledgement to `request_id`
    #[must_use]
    pub const fn ack(request_id: u64) -> Self {
        Self {
            packet_type: PacketType::RESPONSE,
            request_id,
            body: Bytes::new(),
        }
    }

    /// Build an ERROR response to `request_id`
    #[must_use]
    pub fn error(request_id: u64, err: &Error) -> Self {
        let body = ErrorResponse {
            code: err.wire_code(),
            message: err.to_string(),
        };
        Self::new(PacketType::ERROR, request_id, body.encode_to_vec())
    }

    /// Decode the body as protobuf message `M`
    pub fn decode_body<M: Message + Default>(&self) -> Result<M> {
        M::decode(self.body.as_ref()).map_err(|e| {
            Error::Deserialization(format!("{} body: {}", self.packet_type, e))
        })
    }

    /// Turn a response packet into the decoded message or the remote error
    pub fn into_result<M: Message + Default>(self) -> Result<M> {
        match self.packet_type {
            PacketType::RESPONSE => self.decode_body(),
            PacketType::ERROR => {
                let err: ErrorResponse = self.decode_body()?;
                Err(Error::from_wire(err.code, err.message))
            }
            other => Err(Error::malformed(format!(
                "expected a response packet, got {other}"
            ))),
        }
    }
}
