//! # Position Sync Server
//!
//! Relays position updates between connected clients. Every client receives
//! the positions of every other client; the server keeps no world state of
//! its own beyond who is connected and how to reach them.
//!
//! ## Transports
//!
//! ### Stream + datagram (`udp`)
//! A TCP connection is used only for the identity handshake and to notice
//! when the client leaves. Positions travel as UDP datagrams to the same port.
//! The server learns each client's datagram return address from the first
//! datagram it sends.
//!
//! ### Duplex channel (`ws`)
//! One websocket per client carries the handshake and all position traffic.
//! Outbound traffic goes through a bounded per-client queue drained by a
//! dedicated writer task.
//!
//! ## Module Organization
//!
//! - `registry`: connected clients behind one read-write lock, with a one-way
//!   shutdown gate
//! - `handshake`: identity minting, registration and delivery of the identity
//! - `endpoint`: binding identities to datagram return addresses
//! - `dispatch`: best-effort fan-out of an update to every other client
//! - `lifecycle`: per-connection state and inbound classification
//! - `udp` / `ws`: the two transport bindings
//! - `config`: bind address, transport choice and delivery limits
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(&ServerConfig::default()).await?;
//!     let shutdown = server.shutdown_handle();
//!
//!     let running = tokio::spawn(server.run());
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Closes the registry for good and drops every connection.
//!     shutdown.shutdown().await;
//!     running.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod handshake;
pub mod lifecycle;
pub mod registry;
pub mod udp;
pub mod ws;

use crate::config::{ServerConfig, Transport};
use crate::registry::ClientRegistry;
use crate::udp::UdpServer;
use crate::ws::WsServer;
use log::info;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Stops a running server.
///
/// Shutdown closes the registry gate first, so no connection accepted while
/// the listeners wind down can register, then drops every live client.
#[derive(Clone)]
pub struct ShutdownHandle {
    registry: Arc<ClientRegistry>,
    signal: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub(crate) fn new(registry: Arc<ClientRegistry>) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                registry,
                signal: Arc::new(tx),
            },
            rx,
        )
    }

    /// Returns the number of clients that were disconnected.
    pub async fn shutdown(&self) -> usize {
        let closed = self.registry.begin_shutdown().await;
        self.signal.send_replace(true);
        info!("Shutdown started, {} clients disconnected", closed);
        closed
    }
}

/// Resolves once shutdown has been requested or every handle is gone.
pub(crate) async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// A bound server of either transport.
pub enum Server {
    Udp(UdpServer),
    Ws(WsServer),
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        Ok(match config.transport {
            Transport::Udp => Server::Udp(UdpServer::bind(config).await?),
            Transport::Ws => Server::Ws(WsServer::bind(config).await?),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Server::Udp(server) => server.local_addr(),
            Server::Ws(server) => server.local_addr(),
        }
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        match self {
            Server::Udp(server) => server.registry(),
            Server::Ws(server) => server.registry(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        match self {
            Server::Udp(server) => server.shutdown_handle(),
            Server::Ws(server) => server.shutdown_handle(),
        }
    }

    /// Serves until [`ShutdownHandle::shutdown`] is called.
    pub async fn run(self) {
        match self {
            Server::Udp(server) => server.run().await,
            Server::Ws(server) => server.run().await,
        }
    }
}
