//! Server configuration.

use clap::ValueEnum;
use shared::DEFAULT_PORT;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Reliable stream for the identity handshake, datagrams for positions
    Udp,
    /// One websocket channel for handshake and positions
    Ws,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub host: String,
    /// Port shared by the stream and datagram listeners.
    pub port: u16,
    pub transport: Transport,
    /// Capacity of each client's outbound queue (websocket transport).
    pub queue_capacity: usize,
    /// Deadline for a single delivery to one client.
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            transport: Transport::Udp,
            queue_capacity: 64,
            send_timeout: Duration::from_millis(50),
        }
    }
}

impl ServerConfig {
    /// `host:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Queue capacity clamped to at least one slot.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4242);
        assert_eq!(config.transport, Transport::Udp);
        assert_eq!(config.socket_addr_string(), "0.0.0.0:4242");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let config = ServerConfig {
            queue_capacity: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.queue_capacity(), 1);
    }

    #[test]
    fn test_transport_from_str() {
        assert_eq!(Transport::from_str("udp", true), Ok(Transport::Udp));
        assert_eq!(Transport::from_str("WS", true), Ok(Transport::Ws));
        assert!(Transport::from_str("tcp", true).is_err());
    }
}
