//! Identity handshake.
//!
//! A new connection gets a random identity, is registered, and then receives
//! that identity as the first payload on the connection.

use crate::registry::{Client, ClientRegistry, RegistryError, Rejected};
use futures::{Sink, SinkExt};
use log::warn;
use shared::{codec, ClientId, CodecError};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{self, Message};

/// Fresh identities tried before giving up on a colliding connection.
pub const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("write identity: {0}")]
    Io(#[from] std::io::Error),
    #[error("write identity: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

pub fn mint_id() -> ClientId {
    ClientId(rand::random())
}

/// Registers the client built by `build` under a freshly minted identity.
pub async fn admit(
    registry: &ClientRegistry,
    build: impl FnOnce(ClientId) -> Client,
) -> Result<ClientId, RegistryError> {
    admit_with(registry, mint_id, build).await
}

/// [`admit`] with an explicit identity source.
///
/// Draws a new identity from `mint` after each collision, up to
/// [`MAX_ID_ATTEMPTS`] times in total.
pub async fn admit_with(
    registry: &ClientRegistry,
    mut mint: impl FnMut() -> ClientId,
    build: impl FnOnce(ClientId) -> Client,
) -> Result<ClientId, RegistryError> {
    let mut client = build(mint());
    let mut attempts = 1;

    loop {
        let id = client.id;
        match registry.register(client).await {
            Ok(()) => return Ok(id),
            Err(Rejected {
                reason: RegistryError::IdCollision(taken),
                client: rejected,
            }) if attempts < MAX_ID_ATTEMPTS => {
                warn!("Client id {} already taken, minting another", taken);
                client = rejected;
                client.id = mint();
                attempts += 1;
            }
            Err(rejected) => return Err(rejected.reason),
        }
    }
}

/// Writes `id` as the first payload of a stream connection.
pub async fn send_identity<W>(writer: &mut W, id: ClientId) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec::encode(&id)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Sends `id` as the first binary message of a duplex channel.
pub async fn send_identity_message<S>(sink: &mut S, id: ClientId) -> Result<(), HandshakeError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let bytes = codec::encode(&id)?;
    sink.send(Message::Binary(bytes)).await?;
    Ok(())
}
