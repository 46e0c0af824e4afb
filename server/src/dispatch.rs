//! Fan-out of position updates to every other registered client.
//!
//! An envelope is encoded once. The target list is copied out of the registry
//! under its read lock, and delivery happens after the lock is released, so a
//! slow peer never holds up registration or lookups. Delivery is best-effort:
//! each failure is logged and the remaining targets are still served.

use crate::registry::{ClientRegistry, Frame, Outbound};
use log::{debug, error, warn};
use shared::{codec, ClientId, Msg};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Datagram targets with no learned address yet.
    pub skipped: usize,
    /// Queue targets whose queue was full; the update was dropped.
    pub dropped: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.skipped + self.dropped + self.failed
    }
}

enum Target {
    Datagram(ClientId, Option<SocketAddr>),
    Queue(ClientId, mpsc::Sender<Frame>),
}

pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    socket: Option<Arc<UdpSocket>>,
    send_timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher for the duplex transport, where every target has a queue.
    pub fn queued(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            socket: None,
            send_timeout: Duration::ZERO,
        }
    }

    /// Dispatcher for the datagram transport, sending through `socket` and
    /// giving each target at most `send_timeout`.
    pub fn datagram(
        registry: Arc<ClientRegistry>,
        socket: Arc<UdpSocket>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            socket: Some(socket),
            send_timeout,
        }
    }

    /// Delivers `msg` to every registered client except `msg.from`.
    pub async fn dispatch(&self, msg: &Msg) -> DispatchReport {
        let mut report = DispatchReport::default();

        let frame: Frame = match codec::encode(msg) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                error!("Encode message from client {}: {}", msg.from, e);
                return report;
            }
        };

        let mut targets = Vec::new();
        self.registry
            .for_each_except(msg.from, |client| {
                targets.push(match client.outbound() {
                    Outbound::Datagram => Target::Datagram(client.id, client.learned_addr()),
                    Outbound::Queue(queue) => Target::Queue(client.id, queue.clone()),
                })
            })
            .await;

        for target in targets {
            match target {
                Target::Datagram(_, None) => report.skipped += 1,
                Target::Datagram(id, Some(addr)) => {
                    if self.send_datagram(id, &frame, addr).await {
                        report.delivered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Target::Queue(id, queue) => match queue.try_send(Arc::clone(&frame)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue of client {} is full, dropping update", id);
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Client {} is closing, skipping update", id);
                        report.failed += 1;
                    }
                },
            }
        }

        debug!(
            "Dispatched update from client {}: {} delivered, {} skipped, {} dropped, {} failed",
            msg.from, report.delivered, report.skipped, report.dropped, report.failed
        );
        report
    }

    async fn send_datagram(&self, id: ClientId, frame: &[u8], addr: SocketAddr) -> bool {
        let Some(socket) = &self.socket else {
            error!("No datagram socket to reach client {} at {}", id, addr);
            return false;
        };

        match timeout(self.send_timeout, socket.send_to(frame, addr)).await {
            Ok(Ok(n)) if n == frame.len() => true,
            Ok(Ok(n)) => {
                error!(
                    "Short write to client {} at {}: {} of {} bytes",
                    id,
                    addr,
                    n,
                    frame.len()
                );
                false
            }
            Ok(Err(e)) => {
                error!("Write to client {} at {}: {}", id, addr, e);
                false
            }
            Err(_) => {
                warn!("Write to client {} at {} timed out", id, addr);
                false
            }
        }
    }
}
