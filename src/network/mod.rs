//! Peer networking for one chain: semantic messages, the transport seam,
//! the peer pool and the async worker driving synchronization.

pub mod connector;
pub mod memory;
pub mod messages;
pub mod peer_set;
pub mod worker;

use thiserror::Error;

use crate::core::errors::WalletError;

pub use connector::{PeerConnector, PeerLink};
pub use messages::{InventoryItem, PeerMessage, PeerRequest};
pub use peer_set::{Misbehavior, PeerRecord, PeerSet, PeerState, PublishOutcome};
pub use worker::{RelayEvent, SyncHandle, SyncWorker, WorkerCommand};

/// Transport failures. Recovered locally by replacing the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("Connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("Peer {0} closed the connection")]
    Closed(String),

    #[error("Peer {0} timed out")]
    Timeout(String),

    #[error("Send to {0} failed: {1}")]
    Send(String, String),

    #[error("Handshake with {0} failed: {1}")]
    Handshake(String, String),
}

impl From<PeerError> for WalletError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Timeout(_) => WalletError::TimeoutError(err.to_string()),
            _ => WalletError::NetworkError(err.to_string()),
        }
    }
}
