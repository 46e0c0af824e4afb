//! Return-address learning for the datagram transport.
//!
//! Clients never announce their datagram source address. The first datagram
//! seen for an identity binds that identity to the sender address for as long
//! as the registration lives; later datagrams from elsewhere do not rebind it.

use crate::registry::ClientRegistry;
use log::{debug, info};
use shared::ClientId;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// The observed address is now bound to the identity.
    Bound,
    /// An address was already bound; it is returned unchanged.
    AlreadyBound(SocketAddr),
    /// No client is registered under the identity.
    UnknownClient,
}

/// Binds `observed` to `id` unless an address is already bound.
pub async fn learn_address(registry: &ClientRegistry, id: ClientId, observed: SocketAddr) -> Learned {
    // Most datagrams come from clients that are already bound.
    match registry.with_client(id, |client| client.learned_addr).await {
        None => return Learned::UnknownClient,
        Some(Some(bound)) => return Learned::AlreadyBound(bound),
        Some(None) => {}
    }

    let learned = registry
        .with_client_mut(id, |client| match client.learned_addr {
            Some(bound) => Learned::AlreadyBound(bound),
            None => {
                client.learned_addr = Some(observed);
                Learned::Bound
            }
        })
        .await
        .unwrap_or(Learned::UnknownClient);

    match learned {
        Learned::Bound => info!("Client {} bound to datagram address {}", id, observed),
        Learned::AlreadyBound(bound) if bound != observed => debug!(
            "Client {} sent from {} but stays bound to {}",
            id, observed, bound
        ),
        _ => {}
    }

    learned
}
