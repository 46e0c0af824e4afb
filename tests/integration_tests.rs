//! Integration tests for the position-sync server and client.
//!
//! These tests run real servers on loopback sockets and talk to them the way
//! clients do.

use futures::{SinkExt, StreamExt};
use server::config::{ServerConfig, Transport};
use server::registry::ClientRegistry;
use server::{Server, ShutdownHandle};
use shared::{codec, ClientId, Msg, MsgType, Position};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const QUIET: Duration = Duration::from_millis(200);
const PATIENCE: Duration = Duration::from_secs(2);

struct Running {
    addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

async fn start(transport: Transport) -> Running {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        transport,
        ..ServerConfig::default()
    };

    let server = Server::bind(&config).await.expect("Failed to bind server");
    Running {
        addr: server.local_addr().unwrap(),
        registry: server.registry(),
        shutdown: server.shutdown_handle(),
        task: tokio::spawn(server.run()),
    }
}

/// Polls `check` until it holds, failing the test after a while.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while !check().await {
        assert!(started.elapsed() < PATIENCE, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn position_msg(from: ClientId, x: i64, y: i64) -> Vec<u8> {
    codec::encode(&Msg::position(from, Position::new(x, y)).unwrap()).unwrap()
}

/// STREAM + DATAGRAM TRANSPORT
mod udp_tests {
    use super::*;

    struct RawClient {
        id: ClientId,
        control: TcpStream,
        socket: UdpSocket,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            let mut control = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 8];
            control.read_exact(&mut buf).await.unwrap();
            let id: ClientId = codec::decode(&buf).unwrap();

            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.connect(addr).await.unwrap();

            Self {
                id,
                control,
                socket,
            }
        }

        async fn send(&self, x: i64, y: i64) {
            self.socket
                .send(&position_msg(self.id, x, y))
                .await
                .unwrap();
        }

        async fn recv(&self, wait: Duration) -> Option<Msg> {
            let mut buf = [0u8; shared::MAX_PACKET_SIZE];
            match timeout(wait, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => Some(codec::decode(&buf[..n]).unwrap()),
                _ => None,
            }
        }

        async fn drain(&self) {
            while self.recv(QUIET).await.is_some() {}
        }
    }

    /// Connects clients and waits until the server knows all their addresses.
    async fn bound_clients(running: &Running, count: usize) -> Vec<RawClient> {
        let mut clients = Vec::new();
        for _ in 0..count {
            clients.push(RawClient::connect(running.addr).await);
        }

        for client in &clients {
            client.send(0, 0).await;
        }

        for client in &clients {
            let registry = Arc::clone(&running.registry);
            let id = client.id;
            eventually("address learning", || {
                let registry = Arc::clone(&registry);
                async move {
                    registry
                        .find(id)
                        .await
                        .is_some_and(|info| info.learned_addr.is_some())
                }
            })
            .await;
        }

        for client in &clients {
            client.drain().await;
        }
        clients
    }

    #[tokio::test]
    async fn three_client_scenario() {
        let running = start(Transport::Udp).await;
        let mut clients = bound_clients(&running, 3).await;
        let c = clients.pop().unwrap();
        let b = clients.pop().unwrap();
        let a = clients.pop().unwrap();

        a.send(5, 5).await;

        for peer in [&b, &c] {
            let msg = peer.recv(PATIENCE).await.expect("peer missed the update");
            assert_eq!(msg.from, a.id);
            assert_eq!(msg.msg_type, MsgType::POSITION);
            assert_eq!(msg.decode_position().unwrap(), Position::new(5, 5));
            assert!(peer.recv(QUIET).await.is_none(), "update delivered twice");
        }
        assert!(a.recv(QUIET).await.is_none(), "sender got its own update");

        let b_id = b.id;
        drop(b);
        let registry = Arc::clone(&running.registry);
        eventually("B to be unregistered", || {
            let registry = Arc::clone(&registry);
            async move { registry.find(b_id).await.is_none() }
        })
        .await;

        c.send(1, 2).await;

        let msg = a.recv(PATIENCE).await.expect("A missed C's update");
        assert_eq!(msg.from, c.id);
        assert_eq!(msg.decode_position().unwrap(), Position::new(1, 2));
        assert!(a.recv(QUIET).await.is_none());
        assert!(c.recv(QUIET).await.is_none());
        assert_eq!(running.registry.len().await, 2);
    }

    #[tokio::test]
    async fn address_stays_bound() {
        let running = start(Transport::Udp).await;
        let mut clients = bound_clients(&running, 2).await;
        let b = clients.pop().unwrap();
        let a = clients.pop().unwrap();
        let bound = running.registry.find(a.id).await.unwrap().learned_addr;

        // Same identity from a different source address.
        let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        impostor
            .send_to(&position_msg(a.id, 3, 3), running.addr)
            .await
            .unwrap();

        let msg = b.recv(PATIENCE).await.unwrap();
        assert_eq!(msg.from, a.id);
        assert_eq!(running.registry.find(a.id).await.unwrap().learned_addr, bound);

        // B's updates still go to A's original address.
        b.send(4, 4).await;
        assert_eq!(a.recv(PATIENCE).await.unwrap().from, b.id);

        let mut buf = [0u8; 64];
        assert!(timeout(QUIET, impostor.recv_from(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn malformed_datagrams_are_skipped() {
        let running = start(Transport::Udp).await;
        let mut clients = bound_clients(&running, 2).await;
        let b = clients.pop().unwrap();
        let a = clients.pop().unwrap();

        a.socket.send(b"definitely not an envelope").await.unwrap();
        a.socket.send(&[0xFF; 3]).await.unwrap();
        let unknown = Msg {
            from: a.id,
            msg_type: MsgType(77),
            payload: Vec::new(),
        };
        a.socket
            .send(&codec::encode(&unknown).unwrap())
            .await
            .unwrap();
        a.send(8, 9).await;

        let msg = b.recv(PATIENCE).await.unwrap();
        assert_eq!(msg.decode_position().unwrap(), Position::new(8, 9));
        assert!(b.recv(QUIET).await.is_none());
    }

    #[tokio::test]
    async fn datagram_from_unknown_identity_is_dropped() {
        let running = start(Transport::Udp).await;
        let mut clients = bound_clients(&running, 1).await;
        let a = clients.pop().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger
            .send_to(&position_msg(ClientId(a.id.0.wrapping_add(1)), 1, 1), running.addr)
            .await
            .unwrap();

        assert!(a.recv(QUIET).await.is_none());
        assert_eq!(running.registry.len().await, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_refuses_new_ones() {
        let mut running = start(Transport::Udp).await;
        let mut a = RawClient::connect(running.addr).await;

        assert_eq!(running.shutdown.shutdown().await, 1);

        let mut buf = [0u8; 8];
        let read = timeout(PATIENCE, a.control.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        timeout(PATIENCE, &mut running.task).await.unwrap().unwrap();
        assert!(TcpStream::connect(running.addr).await.is_err());
        assert!(running.registry.is_empty().await);
    }
}

/// DUPLEX WEBSOCKET TRANSPORT
mod ws_tests {
    use super::*;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct RawClient {
        id: ClientId,
        socket: Socket,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
                .await
                .unwrap();

            let id = match socket.next().await {
                Some(Ok(Message::Binary(data))) => codec::decode::<ClientId>(&data).unwrap(),
                other => panic!("Expected identity message, got {:?}", other),
            };

            Self { id, socket }
        }

        async fn send(&mut self, x: i64, y: i64) {
            let bytes = position_msg(self.id, x, y);
            self.socket.send(Message::Binary(bytes)).await.unwrap();
        }

        async fn recv(&mut self, wait: Duration) -> Option<Msg> {
            let next = async {
                loop {
                    match self.socket.next().await {
                        Some(Ok(Message::Binary(data))) => {
                            return Some(codec::decode::<Msg>(&data).unwrap())
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                        Some(Ok(_)) => continue,
                    }
                }
            };
            timeout(wait, next).await.ok().flatten()
        }
    }

    async fn connected_clients(running: &Running, count: usize) -> Vec<RawClient> {
        let mut clients = Vec::new();
        for _ in 0..count {
            clients.push(RawClient::connect(running.addr).await);
        }
        clients
    }

    #[tokio::test]
    async fn three_client_scenario() {
        let running = start(Transport::Ws).await;
        let mut clients = connected_clients(&running, 3).await;
        let mut c = clients.pop().unwrap();
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();
        assert_eq!(running.registry.len().await, 3);

        a.send(5, 5).await;

        for peer in [&mut b, &mut c] {
            let msg = peer.recv(PATIENCE).await.expect("peer missed the update");
            assert_eq!(msg.from, a.id);
            assert_eq!(msg.decode_position().unwrap(), Position::new(5, 5));
            assert!(peer.recv(QUIET).await.is_none(), "update delivered twice");
        }
        assert!(a.recv(QUIET).await.is_none(), "sender got its own update");

        b.socket.close(None).await.unwrap();
        let registry = Arc::clone(&running.registry);
        eventually("B to be unregistered", || {
            let registry = Arc::clone(&registry);
            async move { registry.len().await == 2 }
        })
        .await;

        c.send(1, 2).await;

        let msg = a.recv(PATIENCE).await.expect("A missed C's update");
        assert_eq!(msg.from, c.id);
        assert_eq!(msg.decode_position().unwrap(), Position::new(1, 2));
        assert!(a.recv(QUIET).await.is_none());
        assert!(c.recv(QUIET).await.is_none());
    }

    #[tokio::test]
    async fn updates_arrive_in_order() {
        let running = start(Transport::Ws).await;
        let mut clients = connected_clients(&running, 2).await;
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();

        for x in 0..20 {
            a.send(x, 0).await;
        }

        for x in 0..20 {
            let msg = b.recv(PATIENCE).await.unwrap();
            assert_eq!(msg.decode_position().unwrap(), Position::new(x, 0));
        }
    }

    #[tokio::test]
    async fn malformed_messages_are_skipped() {
        let running = start(Transport::Ws).await;
        let mut clients = connected_clients(&running, 2).await;
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();

        a.socket
            .send(Message::Binary(b"garbage".to_vec()))
            .await
            .unwrap();
        a.socket
            .send(Message::Text("hello".to_string()))
            .await
            .unwrap();
        a.send(6, 7).await;

        let msg = b.recv(PATIENCE).await.unwrap();
        assert_eq!(msg.decode_position().unwrap(), Position::new(6, 7));
        assert!(running.registry.find(a.id).await.is_some());
    }

    #[tokio::test]
    async fn spoofed_sender_is_dropped() {
        let running = start(Transport::Ws).await;
        let mut clients = connected_clients(&running, 2).await;
        let mut b = clients.pop().unwrap();
        let mut a = clients.pop().unwrap();

        // A claims to be B, which would echo B's own update back to it.
        let spoofed = position_msg(b.id, 1, 1);
        a.socket.send(Message::Binary(spoofed)).await.unwrap();

        assert!(b.recv(QUIET).await.is_none());
        assert!(a.recv(QUIET).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_refuses_new_ones() {
        let mut running = start(Transport::Ws).await;
        let mut a = RawClient::connect(running.addr).await;

        assert_eq!(running.shutdown.shutdown().await, 1);
        assert!(a.recv(PATIENCE).await.is_none());

        timeout(PATIENCE, &mut running.task).await.unwrap().unwrap();
        assert!(tokio_tungstenite::connect_async(format!("ws://{}/", running.addr))
            .await
            .is_err());
        assert!(running.registry.is_empty().await);
    }
}

/// CLIENT LIBRARY AGAINST A LIVE SERVER
mod client_tests {
    use super::*;
    use client::Connection;

    async fn peers_see_each_other(transport: Transport, client_transport: client::Transport) {
        let running = start(transport).await;
        let server = running.addr.to_string();

        let first = Connection::connect(client_transport, &server).await.unwrap();
        let second = Connection::connect(client_transport, &server).await.unwrap();
        assert_ne!(first.id(), second.id());

        let started = tokio::time::Instant::now();
        loop {
            first.send_position(Position::new(10, 20)).await.unwrap();
            second.send_position(Position::new(30, 40)).await.unwrap();
            sleep(Duration::from_millis(20)).await;

            let seen_by_first = first.peers().get(&second.id()).copied();
            let seen_by_second = second.peers().get(&first.id()).copied();
            if seen_by_first == Some(Position::new(30, 40))
                && seen_by_second == Some(Position::new(10, 20))
            {
                break;
            }
            assert!(started.elapsed() < PATIENCE, "peers never saw each other");
        }

        assert_eq!(first.peers().len(), 1);
        assert!(!first.peers().contains_key(&first.id()));

        second.shutdown().await;
        let registry = Arc::clone(&running.registry);
        eventually("second client to leave", || {
            let registry = Arc::clone(&registry);
            async move { registry.len().await == 1 }
        })
        .await;

        running.shutdown.shutdown().await;
        eventually("first client to notice shutdown", || {
            let connected = first.is_connected();
            async move { !connected }
        })
        .await;
    }

    #[tokio::test]
    async fn udp_clients_exchange_positions() {
        peers_see_each_other(Transport::Udp, client::Transport::Udp).await;
    }

    #[tokio::test]
    async fn ws_clients_exchange_positions() {
        peers_see_each_other(Transport::Ws, client::Transport::Ws).await;
    }
}
