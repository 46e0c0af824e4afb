//! Latest known position of every peer.
//!
//! Written by the network reader task, read by whatever draws the peers.
//! Lookups are synchronous so a render loop can call them every frame.

use log::{debug, warn};
use shared::{codec, ClientId, Msg, MsgType, Position};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct PeerTable {
    positions: RwLock<HashMap<ClientId, Position>>,
    updates: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one relayed envelope. Returns the peer it moved, if any.
    ///
    /// Malformed envelopes, unknown types and echoes of `own_id` are logged
    /// and ignored.
    pub fn apply(&self, bytes: &[u8], own_id: ClientId) -> Option<ClientId> {
        let msg: Msg = match codec::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Decode: {}", e);
                return None;
            }
        };

        if msg.msg_type != MsgType::POSITION {
            warn!("Unknown message type: {}", msg.msg_type);
            return None;
        }

        if msg.from == own_id {
            debug!("Ignoring echo of our own position");
            return None;
        }

        let position = match msg.decode_position() {
            Ok(position) => position,
            Err(e) => {
                warn!("Decode position from {}: {}", msg.from, e);
                return None;
            }
        };

        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg.from, position);
        self.updates.fetch_add(1, Ordering::Relaxed);
        Some(msg.from)
    }

    /// Copy of every peer's latest position.
    pub fn snapshot(&self) -> HashMap<ClientId, Position> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, id: ClientId) -> Option<Position> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total updates applied since the last call, resetting the count.
    pub fn take_update_count(&self) -> u64 {
        self.updates.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_bytes(from: u64, x: i64, y: i64) -> Vec<u8> {
        codec::encode(&Msg::position(ClientId(from), Position::new(x, y)).unwrap()).unwrap()
    }

    #[test]
    fn test_apply_updates_peer() {
        let table = PeerTable::new();

        assert_eq!(table.apply(&position_bytes(2, 1, 1), ClientId(1)), Some(ClientId(2)));
        assert_eq!(table.apply(&position_bytes(2, 5, 6), ClientId(1)), Some(ClientId(2)));

        assert_eq!(table.get(ClientId(2)), Some(Position::new(5, 6)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.take_update_count(), 2);
        assert_eq!(table.take_update_count(), 0);
    }

    #[test]
    fn test_ignores_own_echo() {
        let table = PeerTable::new();

        assert_eq!(table.apply(&position_bytes(1, 1, 1), ClientId(1)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ignores_garbage_and_unknown_types() {
        let table = PeerTable::new();
        let unknown = Msg {
            from: ClientId(3),
            msg_type: MsgType(42),
            payload: Vec::new(),
        };

        assert_eq!(table.apply(b"\x01\x02", ClientId(1)), None);
        assert_eq!(table.apply(&codec::encode(&unknown).unwrap(), ClientId(1)), None);
        assert!(table.is_empty());

        // Still usable afterwards.
        table.apply(&position_bytes(3, 7, 7), ClientId(1));
        assert_eq!(table.snapshot().get(&ClientId(3)), Some(&Position::new(7, 7)));
    }
}
