//! Registry of connected clients.
//!
//! The registry is the only shared mutable structure on the server. It maps
//! each [`ClientId`] to the [`Client`] entry that owns the connection's
//! transport handle and outbound path. All access goes through one read-write
//! lock: lookups and iteration take the read side, mutation the write side.
//!
//! Entries are owned by the registry. Dropping an entry (on [`unregister`] or
//! [`begin_shutdown`]) drops its [`TransportHandle`], which wakes the
//! connection's read loop so it can release the socket.
//!
//! [`unregister`]: ClientRegistry::unregister
//! [`begin_shutdown`]: ClientRegistry::begin_shutdown

use log::info;
use shared::ClientId;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Encoded envelope shared between every outbound queue it is pushed to.
pub type Frame = Arc<[u8]>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client id {0} is already registered")]
    IdCollision(ClientId),
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// A registration that was refused, handed back so the caller can retry
/// with a different identity or release it.
pub struct Rejected {
    pub reason: RegistryError,
    pub client: Client,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .field("client", &self.client.id)
            .finish()
    }
}

/// Owning side of a connection's close signal.
///
/// Held inside the registry entry. Dropping it resolves the matching
/// [`CloseSignal`] held by the connection's read loop.
#[derive(Debug)]
pub struct TransportHandle {
    peer_addr: SocketAddr,
    _close: oneshot::Sender<()>,
}

/// Read-loop side of a [`TransportHandle`].
#[derive(Debug)]
pub struct CloseSignal {
    rx: oneshot::Receiver<()>,
}

impl TransportHandle {
    pub fn new(peer_addr: SocketAddr) -> (Self, CloseSignal) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                peer_addr,
                _close: tx,
            },
            CloseSignal { rx },
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl CloseSignal {
    /// Resolves once the owning handle has been dropped.
    ///
    /// Must not be awaited again after it has resolved.
    pub async fn closed(&mut self) {
        let _ = (&mut self.rx).await;
    }
}

/// How the dispatcher reaches a client.
#[derive(Debug)]
pub enum Outbound {
    /// Unicast datagram to the client's learned address.
    Datagram,
    /// Bounded queue drained by the client's writer task.
    Queue(mpsc::Sender<Frame>),
}

/// One registry entry.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    handle: TransportHandle,
    pub(crate) learned_addr: Option<SocketAddr>,
    outbound: Outbound,
    updates: AtomicU64,
}

impl Client {
    /// Entry for the stream + datagram transport. The return address is
    /// learned later from the client's first datagram.
    pub fn datagram(id: ClientId, handle: TransportHandle) -> Self {
        Self::new(id, handle, Outbound::Datagram)
    }

    /// Entry for the duplex transport, reached through `queue`.
    pub fn queued(id: ClientId, handle: TransportHandle, queue: mpsc::Sender<Frame>) -> Self {
        Self::new(id, handle, Outbound::Queue(queue))
    }

    fn new(id: ClientId, handle: TransportHandle, outbound: Outbound) -> Self {
        Self {
            id,
            handle,
            learned_addr: None,
            outbound,
            updates: AtomicU64::new(0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn learned_addr(&self) -> Option<SocketAddr> {
        self.learned_addr
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            peer_addr: self.peer_addr(),
            learned_addr: self.learned_addr,
            updates: self.updates(),
        }
    }
}

/// Point-in-time copy of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer_addr: SocketAddr,
    pub learned_addr: Option<SocketAddr>,
    pub updates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Accepting,
    Draining,
}

#[derive(Debug)]
struct Inner {
    clients: HashMap<ClientId, Client>,
    gate: Gate,
}

/// Connected clients indexed by identity, behind a single read-write lock.
#[derive(Debug)]
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                gate: Gate::Accepting,
            }),
        }
    }

    /// Inserts `client`.
    ///
    /// Fails with [`RegistryError::IdCollision`] if the identity is already
    /// taken, and with [`RegistryError::ShuttingDown`] once
    /// [`begin_shutdown`](Self::begin_shutdown) has run. The client is
    /// handed back in both cases.
    pub async fn register(&self, client: Client) -> Result<(), Rejected> {
        let mut inner = self.inner.write().await;

        if inner.gate == Gate::Draining {
            return Err(Rejected {
                reason: RegistryError::ShuttingDown,
                client,
            });
        }

        if inner.clients.contains_key(&client.id) {
            return Err(Rejected {
                reason: RegistryError::IdCollision(client.id),
                client,
            });
        }

        info!(
            "Client {} registered from {}",
            client.id,
            client.peer_addr()
        );
        inner.clients.insert(client.id, client);
        Ok(())
    }

    /// Removes the entry for `id`, closing its transport handle.
    ///
    /// Returns false if the client was already gone, so calling it twice is
    /// harmless.
    pub async fn unregister(&self, id: ClientId) -> bool {
        let removed = self.inner.write().await.clients.remove(&id);

        match removed {
            Some(client) => {
                info!(
                    "Client {} unregistered ({} updates from {})",
                    client.id,
                    client.updates(),
                    client.peer_addr()
                );
                true
            }
            None => false,
        }
    }

    pub async fn find(&self, id: ClientId) -> Option<ClientInfo> {
        self.inner.read().await.clients.get(&id).map(Client::info)
    }

    /// Calls `f` for every entry other than `id` while holding the read lock.
    ///
    /// `f` must not block; callers that need to do I/O collect what they need
    /// here and act after the call returns.
    pub async fn for_each_except<F>(&self, id: ClientId, mut f: F)
    where
        F: FnMut(&Client),
    {
        let inner = self.inner.read().await;
        for client in inner.clients.values().filter(|client| client.id != id) {
            f(client);
        }
    }

    /// Runs `f` on the entry for `id` under the write lock.
    pub(crate) async fn with_client_mut<R>(
        &self,
        id: ClientId,
        f: impl FnOnce(&mut Client) -> R,
    ) -> Option<R> {
        self.inner.write().await.clients.get_mut(&id).map(f)
    }

    /// Runs `f` on the entry for `id` under the read lock.
    pub(crate) async fn with_client<R>(
        &self,
        id: ClientId,
        f: impl FnOnce(&Client) -> R,
    ) -> Option<R> {
        self.inner.read().await.clients.get(&id).map(f)
    }

    /// Bumps the observability counter of `id`, returning the new count.
    pub async fn record_update(&self, id: ClientId) -> Option<u64> {
        self.with_client(id, |client| {
            client.updates.fetch_add(1, Ordering::Relaxed) + 1
        })
        .await
    }

    /// Closes the gate for good and drops every entry.
    ///
    /// Every later [`register`](Self::register) fails with
    /// [`RegistryError::ShuttingDown`]. Returns the number of clients that
    /// were still connected.
    pub async fn begin_shutdown(&self) -> usize {
        let drained: Vec<Client> = {
            let mut inner = self.inner.write().await;
            inner.gate = Gate::Draining;
            inner.clients.drain().map(|(_, client)| client).collect()
        };

        if !drained.is_empty() {
            info!("Closing {} client connections", drained.len());
        }
        drained.len()
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.read().await.gate == Gate::Draining
    }

    pub async fn ids(&self) -> Vec<ClientId> {
        self.inner.read().await.clients.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.clients.is_empty()
    }
}
