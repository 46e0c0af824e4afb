//! Client side of the duplex websocket transport.

use crate::peers::PeerTable;
use crate::ClientError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{codec, ClientId, Msg, Position};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsClient {
    id: ClientId,
    sink: Mutex<SplitSink<Socket, Message>>,
    peers: Arc<PeerTable>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsClient {
    /// Connects to `server` (`host:port`) and waits for the assigned identity.
    pub async fn connect(server: &str) -> Result<Self, ClientError> {
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/", server)).await?;

        let id = loop {
            match socket.next().await {
                Some(Ok(Message::Binary(data))) => break codec::decode::<ClientId>(&data)?,
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        info!("My ID: {}", id);

        let (sink, source) = socket.split();
        let peers = Arc::new(PeerTable::new());
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_messages(
            source,
            Arc::clone(&peers),
            Arc::clone(&connected),
            id,
        ));

        Ok(Self {
            id,
            sink: Mutex::new(sink),
            peers,
            connected,
            reader,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn send_position(&self, position: Position) -> Result<(), ClientError> {
        let bytes = codec::encode(&Msg::position(self.id, position)?)?;
        self.sink.lock().await.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Sends a close frame and stops the reader.
    pub async fn shutdown(self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("Close WS connection: {}", e);
        }
        self.reader.abort();
        self.connected.store(false, Ordering::Relaxed);
    }
}

async fn read_messages(
    mut source: SplitStream<Socket>,
    peers: Arc<PeerTable>,
    connected: Arc<AtomicBool>,
    id: ClientId,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                peers.apply(&data, id);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Read WS: {}", e);
                break;
            }
        }
    }

    info!("Server closed the connection");
    connected.store(false, Ordering::Relaxed);
}
