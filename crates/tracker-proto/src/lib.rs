//! Tracker Protocol - packet framing and message definitions
//!
//! Every exchange between a storage node (or admin client) and the tracker
//! is a framed [`Packet`]. The packet header names the body type and a
//! correlation id; bodies are protobuf messages from [`messages`].

pub mod codec;
pub mod messages;
pub mod packet;

pub use codec::{FrameReader, HEADER_LEN, PacketCodec};
pub use packet::{Packet, PacketType};
