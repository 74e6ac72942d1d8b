//! Async synchronization worker for one chain.
//!
//! Each connected peer runs in its own task and only forwards what it reads;
//! all verification happens here, one message at a time, so the header index
//! sees a single writer. The worker stops when its cancellation token fires.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connector::PeerConnector;
use super::messages::{InventoryItem, PeerMessage, PeerRequest};
use super::peer_set::{Misbehavior, PeerSet, PeerState, PublishOutcome};
use super::PeerError;
use crate::blockchain::address::ProgramHash;
use crate::blockchain::spv::{BlockHeader, ChainSyncEngine, HeaderOutcome};
use crate::blockchain::transaction::Transaction;
use crate::core::config::SyncConfig;
use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

/// Delivered to the wallet side of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A transaction matching the filter, from a block or the mempool.
    Transaction(Transaction),
    /// Final result of a publish: accepted by a peer, or rejected by all.
    PublishResult { txid: Hash256, result: Result<(), String> },
}

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Publish(Transaction),
    LoadFilter(Vec<ProgramHash>),
}

/// Caller side of a running worker.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    token: CancellationToken,
}

impl SyncHandle {
    pub fn publish(&self, tx: Transaction) -> Result<(), WalletError> {
        self.send(WorkerCommand::Publish(tx))
    }

    pub fn load_filter(&self, program_hashes: Vec<ProgramHash>) -> Result<(), WalletError> {
        self.send(WorkerCommand::LoadFilter(program_hashes))
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    fn send(&self, command: WorkerCommand) -> Result<(), WalletError> {
        self.commands
            .send(command)
            .map_err(|_| WalletError::NetworkError("Sync worker has stopped".to_string()))
    }
}

#[derive(Debug)]
enum PeerInbound {
    Handshaking,
    Ready { height: u32 },
    Message(PeerMessage),
    ConnectFailed(PeerError),
    Closed(Option<PeerError>),
}

struct PeerChannel {
    requests: mpsc::UnboundedSender<PeerRequest>,
    token: CancellationToken,
}

pub struct SyncWorker {
    engine: Arc<ChainSyncEngine>,
    peers: Arc<Mutex<PeerSet>>,
    connector: Arc<dyn PeerConnector>,
    config: SyncConfig,
    filter: Vec<ProgramHash>,
    relay: mpsc::UnboundedSender<RelayEvent>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    // keeps `commands` open while no handle is alive
    _commands_tx: mpsc::UnboundedSender<WorkerCommand>,
    token: CancellationToken,
    inbound_tx: mpsc::UnboundedSender<(String, PeerInbound)>,
    inbound_rx: mpsc::UnboundedReceiver<(String, PeerInbound)>,
    links: HashMap<String, PeerChannel>,
    outbox: HashMap<Hash256, Transaction>,
    /// Headers accepted whose merkle block has not arrived yet, in request order.
    awaiting_blocks: Vec<Hash256>,
    download_peer: Option<String>,
    next_nonce: u64,
    tick: Duration,
}

impl SyncWorker {
    pub fn new(
        engine: Arc<ChainSyncEngine>,
        peers: PeerSet,
        connector: Arc<dyn PeerConnector>,
        config: SyncConfig,
        filter: Vec<ProgramHash>,
        relay: mpsc::UnboundedSender<RelayEvent>,
    ) -> (Self, SyncHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = SyncHandle { commands: commands_tx.clone(), token: token.clone() };
        let tick = Duration::from_secs((config.ping_timeout_secs / 3).max(1));
        let worker = Self {
            engine,
            peers: Arc::new(Mutex::new(peers)),
            connector,
            config,
            filter,
            relay,
            commands,
            _commands_tx: commands_tx,
            token,
            inbound_tx,
            inbound_rx,
            links: HashMap::new(),
            outbox: HashMap::new(),
            awaiting_blocks: Vec::new(),
            download_peer: None,
            next_nonce: rand::random(),
            tick,
        };
        (worker, handle)
    }

    /// Maintenance period: pool refill, pings and timeout checks.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Shared view of the peer pool.
    pub fn peers(&self) -> Arc<Mutex<PeerSet>> {
        Arc::clone(&self.peers)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("{}: sync worker started", self.engine.chain_id());
        self.engine.start();
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some((address, inbound)) = self.inbound_rx.recv() => {
                    self.on_inbound(&address, inbound);
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command);
                }
                _ = ticker.tick() => {
                    self.maintain();
                }
            }
        }

        for link in self.links.values() {
            link.token.cancel();
        }
        self.engine.stop(None);
        info!("{}: sync worker stopped", self.engine.chain_id());
    }

    fn on_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Publish(tx) => {
                let txid = tx.txid();
                let targets = self.peers.lock().publish(txid);
                info!("{}: publishing {} to {} peers", self.engine.chain_id(), txid, targets.len());
                for address in &targets {
                    self.send(address, PeerRequest::Publish(tx.clone()));
                }
                self.outbox.insert(txid, tx);
            }
            WorkerCommand::LoadFilter(program_hashes) => {
                self.filter = program_hashes;
                let ready = self.peers.lock().ready_peers();
                for address in &ready {
                    self.send(address, PeerRequest::FilterLoad { program_hashes: self.filter.clone() });
                }
            }
        }
    }

    fn on_inbound(&mut self, address: &str, inbound: PeerInbound) {
        let now = Instant::now();
        match inbound {
            PeerInbound::Handshaking => self.peers.lock().mark_handshaking(address),
            PeerInbound::Ready { height } => {
                self.peers.lock().mark_ready(address, height);
                self.engine.note_peer_height(height);
                self.engine.start();
                self.send(address, PeerRequest::FilterLoad { program_hashes: self.filter.clone() });
                let pending: Vec<Transaction> = self.outbox.values().cloned().collect();
                for tx in pending {
                    self.peers.lock().add_publish_target(&tx.txid(), address);
                    self.send(address, PeerRequest::Publish(tx));
                }
                self.choose_download_peer();
            }
            PeerInbound::Message(message) => {
                let ready = self.peers.lock().peer(address).map(|p| p.state) == Some(PeerState::Ready);
                if ready {
                    self.on_message(address, message, now);
                } else {
                    debug!("{}: dropping {} from {}", self.engine.chain_id(), message.kind(), address);
                }
            }
            PeerInbound::ConnectFailed(err) => {
                debug!("{}: {}", self.engine.chain_id(), err);
                self.links.remove(address);
                let settled = self.peers.lock().connect_failed(address, now);
                self.settle(settled);
            }
            PeerInbound::Closed(err) => {
                match err {
                    Some(e) => info!("{}: peer {} disconnected: {}", self.engine.chain_id(), address, e),
                    None => debug!("{}: peer {} disconnected", self.engine.chain_id(), address),
                }
                self.links.remove(address);
                let settled = self.peers.lock().mark_disconnected(address);
                self.settle(settled);
                if self.download_peer.as_deref() == Some(address) {
                    self.download_peer = None;
                    self.choose_download_peer();
                }
            }
        }
    }

    fn on_message(&mut self, address: &str, message: PeerMessage, now: Instant) {
        match message {
            PeerMessage::Headers(headers) => self.on_headers(address, headers, now),
            PeerMessage::MerkleBlock { header, proof, matched } => {
                let hash = header.hash();
                if !self.peers.lock().take_requested_block(address, &hash) {
                    self.misbehaved(address, Misbehavior::UnrequestedBlock, &format!("unrequested block {}", hash), now);
                    return;
                }
                match self.engine.accept_merkle_block(&header, &proof, &matched) {
                    Ok(_) => self.awaiting_blocks.retain(|h| *h != hash),
                    Err(e) => self.on_chain_error(address, e, now),
                }
            }
            PeerMessage::Transaction(tx) => {
                let txid = tx.txid();
                if self.outbox.contains_key(&txid) {
                    let outcome = self.peers.lock().acknowledge(address, &txid);
                    if let Some(outcome) = outcome {
                        self.settle(vec![(txid, outcome)]);
                    }
                }
                let _ = self.relay.send(RelayEvent::Transaction(tx));
            }
            PeerMessage::Inventory(items) => {
                let fresh = self.peers.lock().note_inventory(address, &items);
                for item in &items {
                    if let InventoryItem::Transaction(txid) = item {
                        if self.outbox.contains_key(txid) {
                            let outcome = self.peers.lock().acknowledge(address, txid);
                            if let Some(outcome) = outcome {
                                self.settle(vec![(*txid, outcome)]);
                            }
                        }
                    }
                }
                let wanted: Vec<InventoryItem> = fresh
                    .iter()
                    .filter(|i| matches!(i, InventoryItem::Transaction(h) if !self.outbox.contains_key(h)))
                    .copied()
                    .collect();
                if !wanted.is_empty() {
                    self.send(address, PeerRequest::GetData(wanted));
                }
                if fresh.iter().any(|i| matches!(i, InventoryItem::Block(_))) {
                    self.request_headers(address);
                }
            }
            PeerMessage::Reject { txid, reason } => {
                let outcome = self.peers.lock().reject(address, &txid, &reason);
                if let Some(outcome) = outcome {
                    self.settle(vec![(txid, outcome)]);
                }
            }
            PeerMessage::Pong { nonce } => {
                if !self.peers.lock().record_pong(address, nonce) {
                    self.misbehaved(address, Misbehavior::UnexpectedMessage, "unsolicited pong", now);
                }
            }
        }
    }

    fn on_headers(&mut self, address: &str, headers: Vec<BlockHeader>, now: Instant) {
        let mut blocks = Vec::new();
        for header in &headers {
            match self.engine.accept_header(header) {
                Ok(HeaderOutcome::Duplicate) => {}
                Ok(_) => blocks.push(header.hash()),
                Err(e) => {
                    self.on_chain_error(address, e, now);
                    break;
                }
            }
        }

        if let Some(last) = headers.last().and_then(|h| self.engine.header(&h.hash())) {
            self.peers.lock().note_height(address, last.height);
            self.engine.note_peer_height(last.height);
        }
        if !blocks.is_empty() {
            self.awaiting_blocks.extend(blocks.iter().copied());
            self.request_blocks(address, blocks);
        }
        if headers.len() >= self.config.header_batch && self.links.contains_key(address) {
            self.request_headers(address);
        }
    }

    /// Peer misbehavior disconnects the peer; a refused deep reorg is also
    /// reported to the wallet through the engine.
    fn on_chain_error(&mut self, address: &str, err: WalletError, now: Instant) {
        if err.recommends_rescan() {
            warn!("{}: {} from {}; rescan recommended", self.engine.chain_id(), err, address);
            self.engine.stop(Some(err.to_string()));
            self.engine.start();
            self.disconnect(address);
            return;
        }
        if err.is_peer_misbehavior() {
            let reason = match err {
                WalletError::InvalidMerkleProof(_) => Misbehavior::InvalidMerkleProof,
                _ => Misbehavior::InvalidHeader,
            };
            self.misbehaved(address, reason, &err.to_string(), now);
            return;
        }
        warn!("{}: processing data from {} failed: {}", self.engine.chain_id(), address, err);
    }

    fn misbehaved(&mut self, address: &str, reason: Misbehavior, detail: &str, now: Instant) {
        warn!("{}: peer {} misbehaved: {}", self.engine.chain_id(), address, detail);
        if self.peers.lock().punish(address, reason, now) {
            self.disconnect(address);
        }
    }

    fn disconnect(&mut self, address: &str) {
        if let Some(link) = self.links.get(address) {
            link.token.cancel();
        }
        if self.download_peer.as_deref() == Some(address) {
            self.download_peer = None;
        }
    }

    fn settle(&mut self, settled: Vec<(Hash256, PublishOutcome)>) {
        for (txid, outcome) in settled {
            self.outbox.remove(&txid);
            let result = match outcome {
                PublishOutcome::Accepted => Ok(()),
                PublishOutcome::Rejected(reason) => Err(reason),
            };
            let _ = self.relay.send(RelayEvent::PublishResult { txid, result });
        }
    }

    /// Picks the highest ready peer to download from and re-requests any
    /// blocks the previous download peer left unanswered.
    fn choose_download_peer(&mut self) {
        if self.download_peer.is_some() {
            return;
        }
        let Some((address, height)) = self.peers.lock().best_peer() else {
            return;
        };
        debug!("{}: downloading from {} (height {})", self.engine.chain_id(), address, height);
        self.download_peer = Some(address.clone());
        if !self.awaiting_blocks.is_empty() {
            self.request_blocks(&address, self.awaiting_blocks.clone());
        }
        self.request_headers(&address);
    }

    fn request_headers(&mut self, address: &str) {
        let locator = self.engine.locator();
        self.send(address, PeerRequest::GetHeaders { locator, limit: self.config.header_batch });
    }

    fn request_blocks(&mut self, address: &str, blocks: Vec<Hash256>) {
        self.peers.lock().request_blocks(address, &blocks);
        self.send(address, PeerRequest::GetData(blocks.into_iter().map(InventoryItem::Block).collect()));
    }

    fn maintain(&mut self) {
        let now = Instant::now();
        let timed_out = self.peers.lock().timed_out(now);
        for address in timed_out {
            self.misbehaved(&address, Misbehavior::PingTimeout, "ping timeout", now);
        }

        let due = self.peers.lock().due_for_ping();
        for address in due {
            let nonce = self.next_nonce;
            self.next_nonce = self.next_nonce.wrapping_add(1);
            self.peers.lock().record_ping(&address, nonce, now);
            self.send(&address, PeerRequest::Ping { nonce });
        }

        let candidates = self.peers.lock().next_candidates(now);
        for address in candidates {
            self.connect(address);
        }
        self.choose_download_peer();
    }

    fn connect(&mut self, address: String) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let token = self.token.child_token();
        self.links.insert(address.clone(), PeerChannel { requests, token: token.clone() });
        tokio::spawn(drive_peer(
            Arc::clone(&self.connector),
            address,
            self.engine.tip_height(),
            Duration::from_secs(self.config.ping_timeout_secs),
            requests_rx,
            self.inbound_tx.clone(),
            token,
        ));
    }

    fn send(&self, address: &str, request: PeerRequest) {
        if let Some(link) = self.links.get(address) {
            let kind = request.kind();
            if link.requests.send(request).is_err() {
                debug!("{}: {} to {} dropped, link closed", self.engine.chain_id(), kind, address);
            }
        }
    }
}

/// Connects, handshakes and then shuttles messages for one peer until the
/// link fails or the token fires.
async fn drive_peer(
    connector: Arc<dyn PeerConnector>,
    address: String,
    our_height: u32,
    handshake_timeout: Duration,
    requests: mpsc::UnboundedReceiver<PeerRequest>,
    inbound: mpsc::UnboundedSender<(String, PeerInbound)>,
    token: CancellationToken,
) {
    let mut ready = false;
    let result = run_link(
        connector.as_ref(),
        &address,
        our_height,
        handshake_timeout,
        requests,
        &inbound,
        &token,
        &mut ready,
    )
    .await;

    let event = match (ready, result) {
        (false, Err(e)) => PeerInbound::ConnectFailed(e),
        (false, Ok(())) => PeerInbound::ConnectFailed(PeerError::Closed(address.clone())),
        (true, result) => PeerInbound::Closed(result.err()),
    };
    let _ = inbound.send((address, event));
}

#[allow(clippy::too_many_arguments)]
async fn run_link(
    connector: &dyn PeerConnector,
    address: &str,
    our_height: u32,
    handshake_timeout: Duration,
    mut requests: mpsc::UnboundedReceiver<PeerRequest>,
    inbound: &mpsc::UnboundedSender<(String, PeerInbound)>,
    token: &CancellationToken,
    ready: &mut bool,
) -> Result<(), PeerError> {
    let mut link = time::timeout(handshake_timeout, connector.connect(address))
        .await
        .map_err(|_| PeerError::Timeout(address.to_string()))??;
    let _ = inbound.send((address.to_string(), PeerInbound::Handshaking));
    let height = time::timeout(handshake_timeout, link.handshake(our_height))
        .await
        .map_err(|_| PeerError::Timeout(address.to_string()))??;
    *ready = true;
    let _ = inbound.send((address.to_string(), PeerInbound::Ready { height }));

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            request = requests.recv() => match request {
                Some(request) => link.send(request).await?,
                None => return Ok(()),
            },
            message = link.receive() => {
                if inbound.send((address.to_string(), PeerInbound::Message(message?))).is_err() {
                    return Ok(());
                }
            }
        }
    }
}
