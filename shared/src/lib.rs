//! Wire types shared by the position-sync server and client.
//!
//! Every value that crosses the network is one of the types below, encoded
//! with [`codec::encode`] and read back with [`codec::decode`].

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod codec;

pub use codec::CodecError;

/// Port both transport bindings listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 4242;

/// Largest datagram (and largest encoded value) the protocol accepts.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Opaque identity of one connected client, valid for the lifetime of its
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type tag of an envelope.
///
/// Kept numeric on the wire so that a tag this build does not know still
/// decodes and can be reported as an unknown type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgType(pub u32);

impl MsgType {
    pub const POSITION: MsgType = MsgType(1);
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MsgType::POSITION => write!(f, "position"),
            MsgType(other) => write!(f, "unknown({})", other),
        }
    }
}

/// Wire envelope: sender identity, type tag and an encoded payload whose
/// shape depends on `msg_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    pub from: ClientId,
    pub msg_type: MsgType,
    pub payload: Vec<u8>,
}

impl Msg {
    /// Builds a position envelope from `from`.
    pub fn position(from: ClientId, position: Position) -> Result<Self, CodecError> {
        Ok(Self {
            from,
            msg_type: MsgType::POSITION,
            payload: codec::encode(&position)?,
        })
    }

    /// Decodes the payload of a position envelope.
    pub fn decode_position(&self) -> Result<Position, CodecError> {
        codec::decode(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}
