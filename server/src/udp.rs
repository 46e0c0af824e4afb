//! Stream + datagram transport.
//!
//! A TCP listener performs the identity handshake and afterwards only watches
//! for the peer going away. Position traffic arrives on a UDP socket bound to
//! the same port; one task reads every datagram and spawns a short fan-out
//! task per position update.

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::endpoint::{learn_address, Learned};
use crate::handshake::{admit, send_identity};
use crate::lifecycle::{classify, Connection, Inbound};
use crate::registry::{Client, ClientRegistry, CloseSignal, TransportHandle};
use crate::{shutdown_requested, ShutdownHandle};
use log::{debug, error, info, warn};
use shared::MAX_PACKET_SIZE;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

pub struct UdpServer {
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl UdpServer {
    /// Binds the stream listener, then a datagram socket on the same port.
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.socket_addr_string()).await?;
        let local_addr = listener.local_addr()?;
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        info!("Server listening on {} (tcp + udp)", local_addr);

        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Arc::new(Dispatcher::datagram(
            Arc::clone(&registry),
            Arc::clone(&socket),
            config.send_timeout,
        ));
        let (shutdown, shutdown_rx) = ShutdownHandle::new(Arc::clone(&registry));

        Ok(Self {
            listener,
            socket,
            registry,
            dispatcher,
            shutdown,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections and reads datagrams until shutdown.
    pub async fn run(self) {
        let datagrams = tokio::spawn(read_datagrams(
            Arc::clone(&self.socket),
            Arc::clone(&self.registry),
            Arc::clone(&self.dispatcher),
            self.shutdown_rx.clone(),
        ));

        let shutdown = shutdown_requested(self.shutdown_rx.clone());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(handle_stream(Arc::clone(&self.registry), stream, peer_addr));
                    }
                    Err(e) => {
                        error!("Accept conn: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        if let Err(e) = datagrams.await {
            error!("Datagram task panicked: {}", e);
        }
        info!("Server stopped");
    }
}

/// Handshake and disconnect watch for one control connection.
async fn handle_stream<S>(registry: Arc<ClientRegistry>, mut stream: S, peer_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (handle, mut close) = TransportHandle::new(peer_addr);

    let id = match admit(&registry, |id| Client::datagram(id, handle)).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing connection from {}: {}", peer_addr, e);
            return;
        }
    };

    let mut conn = Connection::new(id, peer_addr);
    if let Err(e) = send_identity(&mut stream, id).await {
        error!("Write client ID to {}: {}", peer_addr, e);
        conn.close();
        registry.unregister(id).await;
        return;
    }

    conn.start_reading();
    discard_until_closed(&mut stream, &mut close, id).await;

    conn.close();
    // Datagram updates are counted in the registry entry, not the connection.
    if let Some(info) = registry.find(id).await {
        debug!("Client {} sent {} updates", id, info.updates);
    }
    registry.unregister(id).await;
}

/// Reads and drops control-stream bytes until the peer leaves or the
/// registry closes the connection.
async fn discard_until_closed<R>(stream: &mut R, close: &mut CloseSignal, id: shared::ClientId)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = close.closed() => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) => return,
                Ok(n) => debug!("Discarding {} control bytes from client {}", n, id),
                Err(e) => {
                    debug!("Control connection of client {} failed: {}", id, e);
                    return;
                }
            },
        }
    }
}

/// Single read loop shared by every client's datagrams.
async fn read_datagrams(
    socket: Arc<UdpSocket>,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; MAX_PACKET_SIZE];
    let shutdown = shutdown_requested(shutdown_rx);
    tokio::pin!(shutdown);

    loop {
        let (len, addr) = tokio::select! {
            _ = &mut shutdown => return,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    error!("Read UDP: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        if len == 0 {
            continue;
        }

        let (msg, position) = match classify(&buffer[..len]) {
            Inbound::Position { msg, position } => (msg, position),
            Inbound::Unknown(msg) => {
                warn!("Unknown message type {} from {}", msg.msg_type, addr);
                continue;
            }
            Inbound::Malformed(e) => {
                warn!("Dropping malformed datagram from {}: {}", addr, e);
                continue;
            }
        };

        if learn_address(&registry, msg.from, addr).await == Learned::UnknownClient {
            warn!("Client not found: {} (claimed ID {})", addr, msg.from);
            continue;
        }
        registry.record_update(msg.from).await;
        debug!("Client {} at {:?}", msg.from, position);

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher.dispatch(&msg).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{codec, ClientId};
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_identity_write_failure_unregisters() {
        let registry = Arc::new(ClientRegistry::new());
        let stream = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
            .build();

        handle_stream(Arc::clone(&registry), stream, peer()).await;

        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stream_registers_until_peer_leaves() {
        let registry = Arc::new(ClientRegistry::new());
        let (server_side, mut client_side) = tokio::io::duplex(64);
        let task = tokio::spawn(handle_stream(Arc::clone(&registry), server_side, peer()));

        let mut buf = [0u8; 8];
        client_side.read_exact(&mut buf).await.unwrap();
        let id: ClientId = codec::decode(&buf).unwrap();
        assert!(registry.find(id).await.is_some());

        // Later control bytes are read and ignored.
        client_side.write_all(b"ping").await.unwrap();
        drop(client_side);

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_closes_stream_task() {
        let registry = Arc::new(ClientRegistry::new());
        let (server_side, mut client_side) = tokio::io::duplex(64);
        let task = tokio::spawn(handle_stream(Arc::clone(&registry), server_side, peer()));

        let mut buf = [0u8; 8];
        client_side.read_exact(&mut buf).await.unwrap();
        let id: ClientId = codec::decode(&buf).unwrap();

        assert!(registry.unregister(id).await);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let mut rest = Vec::new();
        assert_eq!(client_side.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
