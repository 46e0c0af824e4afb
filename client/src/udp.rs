//! Client side of the stream + datagram transport.

use crate::peers::PeerTable;
use crate::ClientError;
use log::{debug, error, info, warn};
use shared::{codec, ClientId, Msg, Position, MAX_PACKET_SIZE};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;

const ID_LEN: usize = std::mem::size_of::<u64>();

pub struct UdpClient {
    id: ClientId,
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    connected: Arc<AtomicBool>,
    control: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl UdpClient {
    /// Opens the control stream to `server`, reads the assigned identity,
    /// then opens a datagram socket to the same address.
    pub async fn connect(server: &str) -> Result<Self, ClientError> {
        let mut control = TcpStream::connect(server).await?;
        let server_addr = control.peer_addr()?;

        let id = read_identity(&mut control).await?;
        info!("My ID: {}", id);

        let local = if server_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        socket.connect(server_addr).await?;
        info!("UDP: {}", socket.local_addr()?);

        let peers = Arc::new(PeerTable::new());
        let connected = Arc::new(AtomicBool::new(true));

        let control = tokio::spawn(watch_control(control, Arc::clone(&connected)));
        let reader = tokio::spawn(read_datagrams(
            Arc::clone(&socket),
            Arc::clone(&peers),
            id,
        ));

        Ok(Self {
            id,
            socket,
            peers,
            connected,
            control,
            reader,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// False once the server has closed the control stream.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn send_position(&self, position: Position) -> Result<(), ClientError> {
        let bytes = codec::encode(&Msg::position(self.id, position)?)?;
        self.socket.send(&bytes).await?;
        Ok(())
    }

    /// Stops the background tasks, closing both sockets.
    pub fn shutdown(self) {
        self.reader.abort();
        self.control.abort();
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// Reads the fixed-width identity the server writes first on the control
/// stream, however the bytes are split across reads.
async fn read_identity<R>(control: &mut R) -> Result<ClientId, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; ID_LEN];
    match control.read_exact(&mut buf).await {
        Ok(_) => Ok(codec::decode(&buf)?),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ClientError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Holds the control stream open, draining it until the server closes it.
async fn watch_control<R>(mut control: R, connected: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];

    loop {
        match control.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => debug!("Read TCP: {} bytes", n),
            Err(e) => {
                warn!("Read TCP: {}", e);
                break;
            }
        }
    }

    info!("Server closed the control connection");
    connected.store(false, Ordering::Relaxed);
}

async fn read_datagrams(socket: Arc<UdpSocket>, peers: Arc<PeerTable>, id: ClientId) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                peers.apply(&buf[..n], id);
            }
            Err(e) => {
                // Typically an ICMP port-unreachable surfaced on a connected socket.
                error!("Read UDP: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
