use async_trait::async_trait;

use super::messages::{PeerMessage, PeerRequest};
use super::PeerError;

/// Opens connections to peers of one chain.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn PeerLink>, PeerError>;
}

/// One established connection.
#[async_trait]
pub trait PeerLink: Send {
    fn address(&self) -> &str;

    /// Exchanges versions; returns the height the peer announces.
    async fn handshake(&mut self, our_height: u32) -> Result<u32, PeerError>;

    async fn send(&mut self, request: PeerRequest) -> Result<(), PeerError>;

    /// Next message from the peer. Cancel-safe: dropping the future before it
    /// completes loses no message.
    async fn receive(&mut self) -> Result<PeerMessage, PeerError>;
}
