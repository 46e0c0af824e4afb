//! Per-connection state and inbound message classification.
//!
//! Every connection moves `Connected -> Reading -> Closed`. Bad input never
//! ends a connection: malformed envelopes and unknown types are reported and
//! skipped, and only a transport closure moves it to `Closed`.

use log::{debug, info, warn};
use shared::{codec, ClientId, CodecError, Msg, MsgType, Position};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reading,
    Closed,
}

/// What one inbound frame turned out to be.
#[derive(Debug)]
pub enum Inbound {
    Position { msg: Msg, position: Position },
    Unknown(Msg),
    Malformed(CodecError),
}

/// Decodes `bytes` as an envelope and sorts it by type.
pub fn classify(bytes: &[u8]) -> Inbound {
    let msg: Msg = match codec::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => return Inbound::Malformed(e),
    };

    match msg.msg_type {
        MsgType::POSITION => match msg.decode_position() {
            Ok(position) => Inbound::Position { msg, position },
            Err(e) => Inbound::Malformed(e),
        },
        _ => Inbound::Unknown(msg),
    }
}

/// Tracks one connection through its states.
#[derive(Debug)]
pub struct Connection {
    id: ClientId,
    peer_addr: SocketAddr,
    state: ConnectionState,
    updates: u64,
    rejected: u64,
}

impl Connection {
    pub fn new(id: ClientId, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            state: ConnectionState::Connected,
            updates: 0,
            rejected: 0,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn start_reading(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Reading;
            info!("New connection from {}, ID: {}", self.peer_addr, self.id);
        }
    }

    /// Classifies an inbound frame, logging and counting anything that is not
    /// a usable position update. Updates sent under another client's identity
    /// are rejected.
    pub fn accept(&mut self, bytes: &[u8]) -> Option<(Msg, Position)> {
        if self.state != ConnectionState::Reading {
            return None;
        }

        match classify(bytes) {
            Inbound::Position { msg, .. } if msg.from != self.id => {
                self.rejected += 1;
                warn!(
                    "Client {} sent an update claiming to be {}, dropping it",
                    self.id, msg.from
                );
                None
            }
            Inbound::Position { msg, position } => {
                self.updates += 1;
                debug!("Client {} at {:?}", msg.from, position);
                Some((msg, position))
            }
            Inbound::Unknown(msg) => {
                self.rejected += 1;
                warn!(
                    "Unknown message type {} from client {}",
                    msg.msg_type, self.id
                );
                None
            }
            Inbound::Malformed(e) => {
                self.rejected += 1;
                warn!("Dropping malformed message from client {}: {}", self.id, e);
                None
            }
        }
    }

    /// Moves to `Closed`. Returns false if the connection was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }

        self.state = ConnectionState::Closed;
        info!("Connection closed: {}, ID: {}", self.peer_addr, self.id);
        true
    }
}
