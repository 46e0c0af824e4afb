//! # Position Sync Client
//!
//! Networking core for a client of the position-sync server. A front-end
//! (renderer, game loop, bot) hands it the local position and reads back
//! the latest known position of every peer; everything network-related
//! happens on background tasks.
//!
//! ## Module Organization
//!
//! - `peers`: latest position per peer, safe to read from a render loop
//! - `udp`: identity over a control stream, positions over datagrams
//! - `ws`: identity and positions over one websocket
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Connection, Transport};
//! use shared::Position;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::connect(Transport::Udp, "127.0.0.1:4242").await?;
//!
//!     connection.send_position(Position::new(10, 20)).await?;
//!     for (peer, position) in connection.peers() {
//!         println!("{} is at ({}, {})", peer, position.x, position.y);
//!     }
//!
//!     connection.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod peers;
pub mod udp;
pub mod ws;

use clap::ValueEnum;
use peers::PeerTable;
use shared::{ClientId, CodecError, Position};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use udp::UdpClient;
use ws::WsClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("server closed the connection before sending an identity")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Control stream plus datagrams
    Udp,
    /// Single websocket
    Ws,
}

/// A connected client of either transport.
pub enum Connection {
    Udp(UdpClient),
    Ws(WsClient),
}

impl Connection {
    pub async fn connect(transport: Transport, server: &str) -> Result<Self, ClientError> {
        Ok(match transport {
            Transport::Udp => Connection::Udp(UdpClient::connect(server).await?),
            Transport::Ws => Connection::Ws(WsClient::connect(server).await?),
        })
    }

    pub fn id(&self) -> ClientId {
        match self {
            Connection::Udp(client) => client.id(),
            Connection::Ws(client) => client.id(),
        }
    }

    pub async fn send_position(&self, position: Position) -> Result<(), ClientError> {
        match self {
            Connection::Udp(client) => client.send_position(position).await,
            Connection::Ws(client) => client.send_position(position).await,
        }
    }

    pub fn peer_table(&self) -> &Arc<PeerTable> {
        match self {
            Connection::Udp(client) => client.peers(),
            Connection::Ws(client) => client.peers(),
        }
    }

    /// Latest position of every peer heard from.
    pub fn peers(&self) -> HashMap<ClientId, Position> {
        self.peer_table().snapshot()
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Connection::Udp(client) => client.is_connected(),
            Connection::Ws(client) => client.is_connected(),
        }
    }

    pub async fn shutdown(self) {
        match self {
            Connection::Udp(client) => client.shutdown(),
            Connection::Ws(client) => client.shutdown().await,
        }
    }
}
