//! In-process peers backed by channels: a simulated node serving a header
//! chain, filtered merkle blocks and a mempool. Used for local networks and
//! tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::connector::{PeerConnector, PeerLink};
use super::messages::{InventoryItem, PeerMessage, PeerRequest};
use super::PeerError;
use crate::blockchain::address::ProgramHash;
use crate::blockchain::spv::merkle::merkle_root;
use crate::blockchain::spv::{BlockHeader, MerkleProof};
use crate::blockchain::transaction::Transaction;
use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

struct NodeState {
    headers: Vec<BlockHeader>,
    blocks: HashMap<Hash256, Vec<Transaction>>,
    mempool: HashMap<Hash256, Transaction>,
    reject_reason: Option<String>,
    corrupt_proofs: bool,
    answer_pings: bool,
    received: Vec<PeerRequest>,
    links: Vec<mpsc::UnboundedSender<PeerMessage>>,
}

/// A simulated remote node. Clones share state.
#[derive(Clone)]
pub struct MemoryNode {
    state: Arc<Mutex<NodeState>>,
}

impl MemoryNode {
    /// Node whose chain starts at `genesis` (height 0).
    pub fn new(genesis: BlockHeader) -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState {
                headers: vec![genesis],
                blocks: HashMap::new(),
                mempool: HashMap::new(),
                reject_reason: None,
                corrupt_proofs: false,
                answer_pings: true,
                received: Vec::new(),
                links: Vec::new(),
            })),
        }
    }

    pub fn height(&self) -> u32 {
        self.state.lock().headers.len().saturating_sub(1) as u32
    }

    pub fn tip(&self) -> Option<BlockHeader> {
        self.state.lock().headers.last().cloned()
    }

    /// Mines a block with `transactions` on the tip and announces it. Reuses
    /// the tip's bits, so chains must stay inside one retarget period.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<BlockHeader, WalletError> {
        let parent = self
            .tip()
            .ok_or_else(|| WalletError::InternalError("Node has no headers".to_string()))?;
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        let mut header = BlockHeader {
            version: 1,
            previous_hash: parent.hash(),
            merkle_root: if txids.is_empty() { Hash256::hash(&parent.hash().0) } else { merkle_root(&txids) },
            timestamp: parent.timestamp + 60,
            bits: parent.bits,
            nonce: 0,
        };
        header.mine()?;
        self.push_block(header.clone(), transactions);
        Ok(header)
    }

    /// Appends an externally built block and announces it.
    pub fn push_block(&self, header: BlockHeader, transactions: Vec<Transaction>) {
        let hash = header.hash();
        let mut st = self.state.lock();
        for tx in &transactions {
            st.mempool.remove(&tx.txid());
        }
        st.headers.push(header);
        st.blocks.insert(hash, transactions);
        st.links.retain(|link| link.send(PeerMessage::Inventory(vec![InventoryItem::Block(hash)])).is_ok());
    }

    /// Drops every block above `height`, so a competing branch can be mined.
    pub fn truncate(&self, height: u32) {
        self.state.lock().headers.truncate(height as usize + 1);
    }

    pub fn set_reject(&self, reason: Option<&str>) {
        self.state.lock().reject_reason = reason.map(str::to_string);
    }

    pub fn set_corrupt_proofs(&self, corrupt: bool) {
        self.state.lock().corrupt_proofs = corrupt;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.lock().answer_pings = answer;
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> bool {
        self.state.lock().mempool.contains_key(txid)
    }

    pub fn received(&self) -> Vec<PeerRequest> {
        self.state.lock().received.clone()
    }

    fn serve(&self, request: PeerRequest, filter: &mut Vec<ProgramHash>, reply: &mpsc::UnboundedSender<PeerMessage>) {
        let mut st = self.state.lock();
        st.received.push(request.clone());
        let mut out = Vec::new();
        match request {
            PeerRequest::GetHeaders { locator, limit } => {
                let start = locator
                    .iter()
                    .find_map(|h| st.headers.iter().position(|x| x.hash() == *h))
                    .map_or(1, |i| i + 1);
                let headers: Vec<BlockHeader> = st.headers.iter().skip(start).take(limit).cloned().collect();
                out.push(PeerMessage::Headers(headers));
            }
            PeerRequest::GetData(items) => {
                for item in items {
                    match item {
                        InventoryItem::Block(hash) => {
                            let Some(header) = st.headers.iter().find(|h| h.hash() == hash).cloned() else {
                                continue;
                            };
                            let txs = st.blocks.get(&hash).cloned().unwrap_or_default();
                            out.extend(filtered_block(&header, &txs, filter, st.corrupt_proofs));
                        }
                        InventoryItem::Transaction(txid) => {
                            if let Some(tx) = st.mempool.get(&txid) {
                                out.push(PeerMessage::Transaction(tx.clone()));
                            }
                        }
                    }
                }
            }
            PeerRequest::FilterLoad { program_hashes } => *filter = program_hashes,
            PeerRequest::Publish(tx) => {
                let txid = tx.txid();
                match st.reject_reason.clone() {
                    Some(reason) => out.push(PeerMessage::Reject { txid, reason }),
                    None => {
                        st.mempool.insert(txid, tx);
                        out.push(PeerMessage::Inventory(vec![InventoryItem::Transaction(txid)]));
                    }
                }
            }
            PeerRequest::Ping { nonce } => {
                if st.answer_pings {
                    out.push(PeerMessage::Pong { nonce });
                }
            }
        }
        drop(st);
        for message in out {
            let _ = reply.send(message);
        }
    }
}

fn matches_filter(tx: &Transaction, filter: &[ProgramHash]) -> bool {
    tx.outputs.iter().any(|o| filter.contains(&o.program_hash))
        || tx.programs.iter().any(|p| p.program_hash().map_or(false, |h| filter.contains(&h)))
}

fn filtered_block(header: &BlockHeader, txs: &[Transaction], filter: &[ProgramHash], corrupt: bool) -> Vec<PeerMessage> {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    let flags: Vec<bool> = txs.iter().map(|tx| matches_filter(tx, filter)).collect();
    let mut proof = if txids.is_empty() {
        MerkleProof { total_transactions: 1, hashes: vec![header.merkle_root], flags: vec![0] }
    } else {
        MerkleProof::build(&txids, &flags)
    };
    if corrupt {
        if let Some(first) = proof.hashes.first_mut() {
            *first = Hash256::hash(b"corrupt");
        }
    }
    let matched: Vec<Hash256> = txids.iter().zip(&flags).filter(|(_, m)| **m).map(|(h, _)| *h).collect();

    let mut out = vec![PeerMessage::MerkleBlock { header: header.clone(), proof, matched }];
    out.extend(txs.iter().zip(&flags).filter(|(_, m)| **m).map(|(tx, _)| PeerMessage::Transaction(tx.clone())));
    out
}

/// Connector resolving addresses to in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    nodes: Arc<Mutex<HashMap<String, MemoryNode>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: &str, node: MemoryNode) {
        self.nodes.lock().insert(address.to_string(), node);
    }

    pub fn remove_node(&self, address: &str) {
        self.nodes.lock().remove(address);
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn PeerLink>, PeerError> {
        let node = self
            .nodes
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| PeerError::Connect(address.to_string(), "no such node".to_string()))?;
        let (reply, inbox) = mpsc::unbounded_channel();
        node.state.lock().links.push(reply.clone());
        debug!("memory link to {} opened", address);
        Ok(Box::new(MemoryLink { address: address.to_string(), node, reply, inbox, filter: Vec::new() }))
    }
}

struct MemoryLink {
    address: String,
    node: MemoryNode,
    reply: mpsc::UnboundedSender<PeerMessage>,
    inbox: mpsc::UnboundedReceiver<PeerMessage>,
    filter: Vec<ProgramHash>,
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn handshake(&mut self, _our_height: u32) -> Result<u32, PeerError> {
        Ok(self.node.height())
    }

    async fn send(&mut self, request: PeerRequest) -> Result<(), PeerError> {
        self.node.serve(request, &mut self.filter, &self.reply);
        Ok(())
    }

    async fn receive(&mut self) -> Result<PeerMessage, PeerError> {
        self.inbox.recv().await.ok_or_else(|| PeerError::Closed(self.address.clone()))
    }
}
