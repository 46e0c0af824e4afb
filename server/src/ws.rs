//! Duplex websocket transport.
//!
//! Each connection gets a bounded outbound queue drained by its own writer
//! task. The first binary message on a connection is the client's identity;
//! every later message in either direction is one encoded envelope.

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::handshake::{admit, send_identity_message};
use crate::lifecycle::Connection;
use crate::registry::{Client, ClientRegistry, CloseSignal, Frame, TransportHandle};
use crate::{shutdown_requested, ShutdownHandle};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use shared::ClientId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};

pub struct WsServer {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    queue_capacity: usize,
    send_timeout: Duration,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl WsServer {
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.socket_addr_string()).await?;
        info!("Server listening on {} (websocket)", listener.local_addr()?);

        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Arc::new(Dispatcher::queued(Arc::clone(&registry)));
        let (shutdown, shutdown_rx) = ShutdownHandle::new(Arc::clone(&registry));

        Ok(Self {
            listener,
            registry,
            dispatcher,
            queue_capacity: config.queue_capacity(),
            send_timeout: config.send_timeout,
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

    /// Accepts websocket connections until shutdown.
    pub async fn run(self) {
        let shutdown = shutdown_requested(self.shutdown_rx.clone());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let session = Session {
                            registry: Arc::clone(&self.registry),
                            dispatcher: Arc::clone(&self.dispatcher),
                            queue_capacity: self.queue_capacity,
                            send_timeout: self.send_timeout,
                        };
                        tokio::spawn(session.run(stream, peer_addr));
                    }
                    Err(e) => {
                        error!("Accept conn: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        info!("Server stopped");
    }
}

/// Everything one connection task needs from the server.
struct Session {
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    queue_capacity: usize,
    send_timeout: Duration,
}

impl Session {
    async fn run(self, stream: TcpStream, peer_addr: SocketAddr) {
        let socket = match tokio_tungstenite::accept_async(stream).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Websocket handshake with {} failed: {}", peer_addr, e);
                return;
            }
        };
        let (sink, source) = socket.split();
        self.serve(sink, source, peer_addr).await;
    }

    /// Runs an upgraded connection from handshake to deregistration.
    async fn serve<Si, St>(self, mut sink: Si, mut source: St, peer_addr: SocketAddr)
    where
        Si: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
        St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let (handle, mut close) = TransportHandle::new(peer_addr);
        let (queue, outbound) = mpsc::channel(self.queue_capacity);

        let id = match admit(&self.registry, |id| Client::queued(id, handle, queue)).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Refusing connection from {}: {}", peer_addr, e);
                let _ = sink.close().await;
                return;
            }
        };

        let mut conn = Connection::new(id, peer_addr);

        // The identity goes out before the writer starts so nothing queued by
        // the dispatcher in the meantime can overtake it.
        if let Err(e) = send_identity_message(&mut sink, id).await {
            error!("Write client ID to {}: {}", peer_addr, e);
            conn.close();
            self.registry.unregister(id).await;
            return;
        }

        let mut writer = tokio::spawn(write_outbound(id, sink, outbound));

        conn.start_reading();
        self.read_messages(&mut conn, &mut source, &mut close).await;
        conn.close();
        debug!(
            "Client {} sent {} updates, {} rejected",
            id,
            conn.updates(),
            conn.rejected()
        );

        // Dropping the entry drops the queue sender, which ends the writer.
        self.registry.unregister(id).await;
        if timeout(self.send_timeout, &mut writer).await.is_err() {
            debug!("Writer of client {} still busy, aborting it", id);
            writer.abort();
        }
    }

    async fn read_messages<S>(&self, conn: &mut Connection, source: &mut S, close: &mut CloseSignal)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = close.closed() => return,
                frame = source.next() => frame,
            };

            match frame {
                None | Some(Ok(Message::Close(_))) => return,
                Some(Err(e)) => {
                    debug!("Read WS from client {}: {}", conn.id(), e);
                    return;
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some((msg, _)) = conn.accept(&data) {
                        self.dispatcher.dispatch(&msg).await;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("Ignoring text message from client {}", conn.id());
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Drains one client's outbound queue onto its websocket, in push order.
async fn write_outbound<S>(id: ClientId, mut sink: S, mut outbound: mpsc::Receiver<Frame>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
            error!("Write to client {}: {}", id, e);
            return;
        }
    }

    let _ = sink.close().await;
}
