//! Peer messages at the semantic level. Byte framing belongs to the
//! `PeerLink` implementation.

use serde::{Deserialize, Serialize};

use crate::blockchain::address::ProgramHash;
use crate::blockchain::spv::{BlockHeader, MerkleProof};
use crate::blockchain::transaction::Transaction;
use crate::crypto::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryItem {
    Transaction(Hash256),
    Block(Hash256),
}

impl InventoryItem {
    pub fn hash(&self) -> &Hash256 {
        match self {
            InventoryItem::Transaction(h) | InventoryItem::Block(h) => h,
        }
    }
}

/// What a remote peer sends us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// New transactions or blocks the peer knows about.
    Inventory(Vec<InventoryItem>),
    Headers(Vec<BlockHeader>),
    /// Filtered block: header plus proof for the transactions matching our filter.
    MerkleBlock {
        header: BlockHeader,
        proof: MerkleProof,
        matched: Vec<Hash256>,
    },
    Transaction(Transaction),
    /// The peer refused a transaction we published.
    Reject { txid: Hash256, reason: String },
    Pong { nonce: u64 },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Inventory(_) => "inv",
            PeerMessage::Headers(_) => "headers",
            PeerMessage::MerkleBlock { .. } => "merkleblock",
            PeerMessage::Transaction(_) => "tx",
            PeerMessage::Reject { .. } => "reject",
            PeerMessage::Pong { .. } => "pong",
        }
    }
}

/// What we ask of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Headers following the first locator hash the peer recognizes.
    GetHeaders { locator: Vec<Hash256>, limit: usize },
    /// Blocks are answered as merkle blocks filtered by the loaded filter.
    GetData(Vec<InventoryItem>),
    /// Addresses whose transactions the peer should relay to us.
    FilterLoad { program_hashes: Vec<ProgramHash> },
    Publish(Transaction),
    Ping { nonce: u64 },
}

impl PeerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::GetHeaders { .. } => "getheaders",
            PeerRequest::GetData(_) => "getdata",
            PeerRequest::FilterLoad { .. } => "filterload",
            PeerRequest::Publish(_) => "publish",
            PeerRequest::Ping { .. } => "ping",
        }
    }
}
