//! Per-chain peer pool: connection states, misbehavior scoring with
//! reconnection backoff, inventory bookkeeping and publish tracking.
//!
//! Pure state; the sync worker owns the sockets and feeds this with what
//! happens on them, passing the current time explicitly.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::messages::InventoryItem;
use crate::core::config::SyncConfig;
use crate::crypto::hash::Hash256;

/// Upper bound on remembered inventory hashes, per peer and overall.
const MAX_KNOWN_INVENTORY: usize = 50_000;
/// Longest wait before retrying an address that failed to connect.
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Misbehaving,
}

/// Reasons a peer gets penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehavior {
    InvalidMerkleProof,
    InvalidHeader,
    UnrequestedBlock,
    PingTimeout,
    /// Minor protocol noise; only drops the peer once it accumulates.
    UnexpectedMessage,
}

impl Misbehavior {
    fn penalty(self, threshold: u32) -> u32 {
        match self {
            Misbehavior::UnexpectedMessage => (threshold / 10).max(1),
            _ => threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: String,
    pub state: PeerState,
    pub misbehavior_score: u32,
    pub last_seen_height: u32,
    /// Outstanding ping nonce and when it was sent.
    pub last_ping: Option<(u64, Instant)>,
    /// Not reconnected before this instant.
    pub retry_after: Option<Instant>,
    connect_failures: u32,
    known_inventory: HashSet<Hash256>,
    requested_blocks: HashSet<Hash256>,
}

impl PeerRecord {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: PeerState::Disconnected,
            misbehavior_score: 0,
            last_seen_height: 0,
            last_ping: None,
            retry_after: None,
            connect_failures: 0,
            known_inventory: HashSet::new(),
            requested_blocks: HashSet::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, PeerState::Connecting | PeerState::Handshaking | PeerState::Ready)
    }

    fn is_eligible(&self, now: Instant) -> bool {
        matches!(self.state, PeerState::Disconnected | PeerState::Misbehaving)
            && self.retry_after.map_or(true, |t| now >= t)
    }
}

/// Final answer for a published transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Default)]
struct PendingPublish {
    awaiting: HashSet<String>,
    rejections: Vec<(String, String)>,
}

impl PendingPublish {
    fn outcome_if_exhausted(&self) -> Option<PublishOutcome> {
        if !self.awaiting.is_empty() || self.rejections.is_empty() {
            return None;
        }
        let reasons: Vec<String> = self.rejections.iter().map(|(a, r)| format!("{}: {}", a, r)).collect();
        Some(PublishOutcome::Rejected(reasons.join("; ")))
    }
}

pub struct PeerSet {
    chain_id: String,
    config: SyncConfig,
    peers: HashMap<String, PeerRecord>,
    seen_inventory: HashSet<Hash256>,
    publishes: HashMap<Hash256, PendingPublish>,
}

impl PeerSet {
    pub fn new(chain_id: &str, config: SyncConfig, addresses: &[String]) -> Self {
        let mut set = Self {
            chain_id: chain_id.to_string(),
            config,
            peers: HashMap::new(),
            seen_inventory: HashSet::new(),
            publishes: HashMap::new(),
        };
        for address in addresses {
            set.add_address(address);
        }
        set
    }

    pub fn add_address(&mut self, address: &str) {
        self.peers.entry(address.to_string()).or_insert_with(|| PeerRecord::new(address));
    }

    pub fn peer(&self, address: &str) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    pub fn ready_peers(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Ready)
            .map(|p| p.address.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_active()).count()
    }

    /// Ready peer announcing the greatest height.
    pub fn best_peer(&self) -> Option<(String, u32)> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Ready)
            .max_by(|a, b| a.last_seen_height.cmp(&b.last_seen_height).then(b.address.cmp(&a.address)))
            .map(|p| (p.address.clone(), p.last_seen_height))
    }

    /// Addresses to dial so the pool reaches its target size. They move to
    /// `Connecting`. Well-behaved addresses are preferred.
    pub fn next_candidates(&mut self, now: Instant) -> Vec<String> {
        let wanted = self.config.max_peers.saturating_sub(self.active_count());
        if wanted == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<&PeerRecord> = self.peers.values().filter(|p| p.is_eligible(now)).collect();
        candidates.sort_by(|a, b| {
            a.misbehavior_score
                .cmp(&b.misbehavior_score)
                .then(a.connect_failures.cmp(&b.connect_failures))
                .then(b.last_seen_height.cmp(&a.last_seen_height))
                .then(a.address.cmp(&b.address))
        });
        let chosen: Vec<String> = candidates.iter().take(wanted).map(|p| p.address.clone()).collect();
        for address in &chosen {
            if let Some(peer) = self.peers.get_mut(address) {
                if peer.state == PeerState::Misbehaving {
                    // served its ban
                    peer.misbehavior_score = 0;
                }
                peer.state = PeerState::Connecting;
            }
        }
        chosen
    }

    pub fn mark_handshaking(&mut self, address: &str) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.state = PeerState::Handshaking;
        }
    }

    pub fn mark_ready(&mut self, address: &str, height: u32) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.state = PeerState::Ready;
            peer.last_seen_height = height;
            peer.connect_failures = 0;
            peer.retry_after = None;
            info!("{}: peer {} ready at height {}", self.chain_id, address, height);
        }
    }

    pub fn note_height(&mut self, address: &str, height: u32) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.last_seen_height = peer.last_seen_height.max(height);
        }
    }

    /// A dial or handshake failed; retry later with doubling delay.
    pub fn connect_failed(&mut self, address: &str, now: Instant) -> Vec<(Hash256, PublishOutcome)> {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.connect_failures = peer.connect_failures.saturating_add(1);
            let delay = Duration::from_secs(1u64 << peer.connect_failures.min(16)).min(MAX_CONNECT_BACKOFF);
            peer.retry_after = Some(now + delay);
            debug!("{}: connect to {} failed, retry in {:?}", self.chain_id, address, delay);
        }
        self.mark_disconnected(address)
    }

    /// The connection is gone. Returns publishes that this settles: a
    /// transaction every remaining target already rejected.
    pub fn mark_disconnected(&mut self, address: &str) -> Vec<(Hash256, PublishOutcome)> {
        if let Some(peer) = self.peers.get_mut(address) {
            if peer.state != PeerState::Misbehaving {
                peer.state = PeerState::Disconnected;
            }
            peer.last_ping = None;
            peer.requested_blocks.clear();
            peer.known_inventory.clear();
        }

        let mut settled = Vec::new();
        for (txid, pending) in self.publishes.iter_mut() {
            if pending.awaiting.remove(address) {
                if let Some(outcome) = pending.outcome_if_exhausted() {
                    settled.push((*txid, outcome));
                }
            }
        }
        for (txid, _) in &settled {
            self.publishes.remove(txid);
        }
        settled
    }

    /// Penalizes a peer. Returns true when the peer must be disconnected; it
    /// is then kept out of the pool for the configured backoff.
    pub fn punish(&mut self, address: &str, reason: Misbehavior, now: Instant) -> bool {
        let threshold = self.config.misbehavior_threshold;
        let backoff = Duration::from_secs(self.config.misbehavior_backoff_secs);
        let Some(peer) = self.peers.get_mut(address) else {
            return false;
        };
        peer.misbehavior_score = peer.misbehavior_score.saturating_add(reason.penalty(threshold));
        if peer.misbehavior_score < threshold {
            debug!("{}: peer {} score {} after {:?}", self.chain_id, address, peer.misbehavior_score, reason);
            return false;
        }
        warn!(
            "{}: peer {} misbehaving ({:?}), banned for {:?}",
            self.chain_id, address, reason, backoff
        );
        peer.state = PeerState::Misbehaving;
        peer.retry_after = Some(now + backoff);
        true
    }

    pub fn record_ping(&mut self, address: &str, nonce: u64, now: Instant) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.last_ping = Some((nonce, now));
        }
    }

    /// Clears the outstanding ping when the nonce matches.
    pub fn record_pong(&mut self, address: &str, nonce: u64) -> bool {
        match self.peers.get_mut(address) {
            Some(peer) if matches!(peer.last_ping, Some((n, _)) if n == nonce) => {
                peer.last_ping = None;
                true
            }
            _ => false,
        }
    }

    /// Ready peers with no outstanding ping.
    pub fn due_for_ping(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Ready && p.last_ping.is_none())
            .map(|p| p.address.clone())
            .collect()
    }

    /// Ready peers whose ping went unanswered past the timeout.
    pub fn timed_out(&self, now: Instant) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.ping_timeout_secs);
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Ready)
            .filter(|p| matches!(p.last_ping, Some((_, sent)) if now.saturating_duration_since(sent) > timeout))
            .map(|p| p.address.clone())
            .collect()
    }

    /// Records an announcement and returns the items nobody announced before.
    pub fn note_inventory(&mut self, address: &str, items: &[InventoryItem]) -> Vec<InventoryItem> {
        if self.seen_inventory.len() > MAX_KNOWN_INVENTORY {
            self.seen_inventory.clear();
        }
        let Some(peer) = self.peers.get_mut(address) else {
            return Vec::new();
        };
        if peer.known_inventory.len() > MAX_KNOWN_INVENTORY {
            peer.known_inventory.clear();
        }
        let mut fresh = Vec::new();
        for item in items {
            peer.known_inventory.insert(*item.hash());
            if self.seen_inventory.insert(*item.hash()) {
                fresh.push(*item);
            }
        }
        fresh
    }

    pub fn request_blocks(&mut self, address: &str, hashes: &[Hash256]) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.requested_blocks.extend(hashes.iter().copied());
        }
    }

    /// Consumes an outstanding block request; false for an unrequested block.
    pub fn take_requested_block(&mut self, address: &str, hash: &Hash256) -> bool {
        self.peers.get_mut(address).map_or(false, |p| p.requested_blocks.remove(hash))
    }

    pub fn outstanding_blocks(&self, address: &str) -> usize {
        self.peers.get(address).map_or(0, |p| p.requested_blocks.len())
    }

    /// Starts tracking a publish and returns the ready peers to send it to.
    pub fn publish(&mut self, txid: Hash256) -> Vec<String> {
        let targets = self.ready_peers();
        let pending = self.publishes.entry(txid).or_default();
        pending.awaiting.extend(targets.iter().cloned());
        targets
    }

    /// Also sends an outstanding publish to a newly ready peer.
    pub fn add_publish_target(&mut self, txid: &Hash256, address: &str) {
        if let Some(pending) = self.publishes.get_mut(txid) {
            pending.awaiting.insert(address.to_string());
        }
    }

    pub fn pending_publishes(&self) -> Vec<Hash256> {
        self.publishes.keys().copied().collect()
    }

    /// A peer relayed the transaction back or acknowledged it.
    pub fn acknowledge(&mut self, address: &str, txid: &Hash256) -> Option<PublishOutcome> {
        self.publishes.remove(txid)?;
        info!("{}: transaction {} accepted by {}", self.chain_id, txid, address);
        Some(PublishOutcome::Accepted)
    }

    /// A peer refused the transaction. Settles once no target is left.
    pub fn reject(&mut self, address: &str, txid: &Hash256, reason: &str) -> Option<PublishOutcome> {
        let pending = self.publishes.get_mut(txid)?;
        pending.awaiting.remove(address);
        pending.rejections.push((address.to_string(), reason.to_string()));
        warn!("{}: transaction {} rejected by {}: {}", self.chain_id, txid, address, reason);
        let outcome = pending.outcome_if_exhausted();
        if outcome.is_some() {
            self.publishes.remove(txid);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{}:20866", i + 1)).collect()
    }

    fn set(n: usize) -> PeerSet {
        PeerSet::new("ELA", SyncConfig::default(), &addresses(n))
    }

    fn ready_all(set: &mut PeerSet, now: Instant) -> Vec<String> {
        let chosen = set.next_candidates(now);
        for (i, a) in chosen.iter().enumerate() {
            set.mark_handshaking(a);
            set.mark_ready(a, 100 + i as u32);
        }
        chosen
    }

    #[test]
    fn test_pool_is_bounded() {
        let mut peers = set(5);
        let now = Instant::now();
        let chosen = peers.next_candidates(now);
        assert_eq!(chosen.len(), 3);
        assert_eq!(peers.active_count(), 3);
        assert!(peers.next_candidates(now).is_empty());
    }

    #[test]
    fn test_state_progression_and_best_peer() {
        let mut peers = set(3);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        assert_eq!(peers.ready_peers().len(), 3);
        let (best, height) = peers.best_peer().unwrap();
        assert_eq!(height, 102);
        assert_eq!(best, chosen[2]);
    }

    #[test]
    fn test_invalid_proof_drops_and_backs_off() {
        let mut peers = set(4);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        let bad = chosen[0].clone();

        assert!(peers.punish(&bad, Misbehavior::InvalidMerkleProof, now));
        assert_eq!(peers.peer(&bad).unwrap().state, PeerState::Misbehaving);
        peers.mark_disconnected(&bad);
        assert_eq!(peers.peer(&bad).unwrap().state, PeerState::Misbehaving);

        // the spare address replaces it; the banned one stays out
        let replacement = peers.next_candidates(now);
        assert_eq!(replacement, vec!["10.0.0.4:20866".to_string()]);
        assert!(!peers.peers[&bad].is_eligible(now + Duration::from_secs(1)));
        assert!(peers.peers[&bad].is_eligible(now + Duration::from_secs(601)));
    }

    #[test]
    fn test_minor_noise_accumulates() {
        let mut peers = set(1);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        for _ in 0..9 {
            assert!(!peers.punish(&chosen[0], Misbehavior::UnexpectedMessage, now));
        }
        assert!(peers.punish(&chosen[0], Misbehavior::UnexpectedMessage, now));
    }

    #[test]
    fn test_ping_timeout_detection() {
        let mut peers = set(1);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        peers.record_ping(&chosen[0], 7, now);
        assert!(peers.timed_out(now + Duration::from_secs(10)).is_empty());
        assert_eq!(peers.timed_out(now + Duration::from_secs(31)), chosen);

        assert!(!peers.record_pong(&chosen[0], 8));
        assert!(peers.record_pong(&chosen[0], 7));
        assert!(peers.timed_out(now + Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn test_connect_failure_backoff_doubles() {
        let mut peers = set(1);
        let now = Instant::now();
        let a = peers.next_candidates(now).remove(0);
        peers.connect_failed(&a, now);
        assert!(peers.next_candidates(now + Duration::from_millis(500)).is_empty());
        let again = peers.next_candidates(now + Duration::from_secs(2));
        assert_eq!(again, vec![a.clone()]);
        peers.connect_failed(&a, now);
        assert!(peers.next_candidates(now + Duration::from_secs(3)).is_empty());
        assert_eq!(peers.next_candidates(now + Duration::from_secs(4)).len(), 1);
    }

    #[test]
    fn test_inventory_deduplicated_across_peers() {
        let mut peers = set(2);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        let item = InventoryItem::Transaction(Hash256::hash(b"tx"));
        assert_eq!(peers.note_inventory(&chosen[0], &[item]), vec![item]);
        assert!(peers.note_inventory(&chosen[1], &[item]).is_empty());
    }

    #[test]
    fn test_unrequested_block_detected() {
        let mut peers = set(1);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        let block = Hash256::hash(b"block");
        assert!(!peers.take_requested_block(&chosen[0], &block));
        peers.request_blocks(&chosen[0], &[block]);
        assert_eq!(peers.outstanding_blocks(&chosen[0]), 1);
        assert!(peers.take_requested_block(&chosen[0], &block));
        assert!(!peers.take_requested_block(&chosen[0], &block));
    }

    #[test]
    fn test_publish_accepted_by_any_peer() {
        let mut peers = set(2);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        let txid = Hash256::hash(b"tx");
        assert_eq!(peers.publish(txid).len(), 2);
        assert_eq!(peers.reject(&chosen[0], &txid, "low fee"), None);
        assert_eq!(peers.acknowledge(&chosen[1], &txid), Some(PublishOutcome::Accepted));
        assert!(peers.pending_publishes().is_empty());
    }

    #[test]
    fn test_publish_rejected_by_all_peers() {
        let mut peers = set(2);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        let txid = Hash256::hash(b"tx");
        peers.publish(txid);
        assert_eq!(peers.reject(&chosen[0], &txid, "double spend"), None);
        // the other target disappears: every remaining target has rejected
        let settled = peers.mark_disconnected(&chosen[1]);
        assert_eq!(settled.len(), 1);
        assert!(matches!(&settled[0].1, PublishOutcome::Rejected(r) if r.contains("double spend")));
    }

    #[test]
    fn test_publish_waits_for_a_peer() {
        let mut peers = set(1);
        let txid = Hash256::hash(b"tx");
        assert!(peers.publish(txid).is_empty());
        assert_eq!(peers.pending_publishes(), vec![txid]);
        let now = Instant::now();
        let chosen = ready_all(&mut peers, now);
        peers.add_publish_target(&txid, &chosen[0]);
        assert!(matches!(peers.reject(&chosen[0], &txid, "bad"), Some(PublishOutcome::Rejected(_))));
    }
}
