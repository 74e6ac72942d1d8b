//! Verified header chain for one blockchain.
//!
//! Every mutation is planned against the current state first and then applied
//! in one step under the writer lock, so a rejected header or merkle block
//! leaves the index untouched. Events for an applied step are delivered to
//! subscribers, in order, before the next step is admitted.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::header::{is_retarget_height, retarget, BlockHeader, HeaderRecord};
use super::merkle::MerkleProof;
use super::u256::U256;
use crate::core::config::{ChainParams, Checkpoint};
use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
}

/// Notifications emitted to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SyncStarted,
    SyncStopped { error: Option<String> },
    HeaderAdded { hash: Hash256, height: u32, timestamp: u32 },
    HeaderRemoved { hash: Hash256, height: u32 },
    TransactionConfirmed { txid: Hash256, height: u32, timestamp: u32 },
    TransactionUnconfirmed { txid: Hash256 },
    HeightIncreased { height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOutcome {
    /// Header extended the current tip.
    Extended { height: u32 },
    /// Header completed a heavier branch that replaced the tip.
    Reorganized { fork_height: u32, removed: usize, added: usize },
    /// Header stored on a branch with no more work than the tip.
    SideBranch { height: u32 },
    Duplicate,
}

pub type SyncHandler = Box<dyn Fn(&SyncEvent) + Send + Sync>;

struct EngineState {
    sync_state: SyncState,
    headers: HashMap<Hash256, HeaderRecord>,
    /// Accepted chain, `main_chain[i]` at height `base_height + i`.
    main_chain: Vec<Hash256>,
    base_height: u32,
    /// Matched transactions of every block a proof was received for.
    block_txs: HashMap<Hash256, Vec<Hash256>>,
    /// Transactions confirmed on the accepted chain, by confirming block.
    confirmed_in: HashMap<Hash256, Hash256>,
    best_peer_height: u32,
}

impl EngineState {
    fn tip(&self) -> Option<&HeaderRecord> {
        self.main_chain.last().and_then(|h| self.headers.get(h))
    }

    fn tip_height(&self) -> u32 {
        self.base_height + self.main_chain.len().saturating_sub(1) as u32
    }

    fn is_on_main_chain(&self, record: &HeaderRecord) -> bool {
        record
            .height
            .checked_sub(self.base_height)
            .and_then(|i| self.main_chain.get(i as usize))
            == Some(&record.hash)
    }

    /// Ancestor of `from` (inclusive) at `height` along `from`'s own branch.
    fn ancestor(&self, from: &HeaderRecord, height: u32) -> Option<&HeaderRecord> {
        let mut current = self.headers.get(&from.hash)?;
        while current.height > height {
            if self.is_on_main_chain(current) {
                let idx = height.checked_sub(self.base_height)?;
                return self.main_chain.get(idx as usize).and_then(|h| self.headers.get(h));
            }
            current = self.headers.get(&current.previous_hash)?;
        }
        (current.height == height).then_some(current)
    }
}

enum HeaderPlan {
    Duplicate,
    Extend(HeaderRecord),
    Side(HeaderRecord),
    Reorg { record: HeaderRecord, fork_height: u32, branch: Vec<Hash256> },
}

pub struct ChainSyncEngine {
    params: ChainParams,
    state: RwLock<EngineState>,
    subscribers: RwLock<Vec<SyncHandler>>,
    writer: Mutex<()>,
}

impl ChainSyncEngine {
    /// Engine anchored at the checkpoint appropriate for `earliest_time`.
    pub fn new(params: ChainParams, earliest_time: u32) -> Result<Self, WalletError> {
        let checkpoint = params.start_checkpoint(earliest_time).cloned().ok_or_else(|| {
            WalletError::ConfigError(format!("{}: no checkpoint to start syncing from", params.chain_id))
        })?;
        Self::from_checkpoint(params, &checkpoint)
    }

    pub fn from_checkpoint(params: ChainParams, checkpoint: &Checkpoint) -> Result<Self, WalletError> {
        params.check_checkpoint_alignment(checkpoint)?;
        let hash = checkpoint.hash;
        let target = U256::from_compact(checkpoint.bits).ok_or_else(|| {
            WalletError::ConfigError(format!("{}: bad checkpoint bits", params.chain_id))
        })?;
        let base = HeaderRecord {
            hash,
            previous_hash: Hash256::ZERO,
            height: checkpoint.height,
            timestamp: checkpoint.timestamp,
            merkle_root: Hash256::ZERO,
            bits: checkpoint.bits,
            chain_work: U256::work_for_target(&target),
        };
        Ok(Self::with_base(params, base))
    }

    /// Engine anchored at a full genesis header (height 0).
    pub fn from_genesis(params: ChainParams, genesis: &BlockHeader) -> Result<Self, WalletError> {
        genesis.check_proof_of_work(params.pow_limit_bits)?;
        let base = HeaderRecord::from_header(genesis, 0, &U256::ZERO);
        Ok(Self::with_base(params, base))
    }

    fn with_base(params: ChainParams, base: HeaderRecord) -> Self {
        info!("{}: header chain anchored at height {} ({})", params.chain_id, base.height, base.hash);
        let mut headers = HashMap::new();
        let base_hash = base.hash;
        let base_height = base.height;
        headers.insert(base_hash, base);
        Self {
            params,
            state: RwLock::new(EngineState {
                sync_state: SyncState::Idle,
                headers,
                main_chain: vec![base_hash],
                base_height,
                block_txs: HashMap::new(),
                confirmed_in: HashMap::new(),
                best_peer_height: base_height,
            }),
            subscribers: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.params.chain_id
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Registers a handler. Handlers run on the writer's thread and must not
    /// feed headers back into this engine.
    pub fn subscribe(&self, handler: impl Fn(&SyncEvent) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(handler));
    }

    pub fn state(&self) -> SyncState {
        self.state.read().sync_state
    }

    pub fn tip(&self) -> Option<HeaderRecord> {
        self.state.read().tip().cloned()
    }

    pub fn tip_height(&self) -> u32 {
        self.state.read().tip_height()
    }

    pub fn base_height(&self) -> u32 {
        self.state.read().base_height
    }

    pub fn header(&self, hash: &Hash256) -> Option<HeaderRecord> {
        self.state.read().headers.get(hash).cloned()
    }

    pub fn header_at(&self, height: u32) -> Option<HeaderRecord> {
        let st = self.state.read();
        let idx = height.checked_sub(st.base_height)? as usize;
        st.main_chain.get(idx).and_then(|h| st.headers.get(h)).cloned()
    }

    pub fn is_on_main_chain(&self, hash: &Hash256) -> bool {
        let st = self.state.read();
        st.headers.get(hash).map(|r| st.is_on_main_chain(r)).unwrap_or(false)
    }

    /// Height of the accepted block confirming `txid`.
    pub fn transaction_height(&self, txid: &Hash256) -> Option<(u32, u32)> {
        let st = self.state.read();
        let block = st.confirmed_in.get(txid)?;
        st.headers.get(block).map(|r| (r.height, r.timestamp))
    }

    /// Fraction of the best announced peer height reached, in [0, 1].
    pub fn progress(&self) -> f64 {
        let st = self.state.read();
        let tip = st.tip_height();
        if st.best_peer_height <= st.base_height || tip >= st.best_peer_height {
            return 1.0;
        }
        (tip - st.base_height) as f64 / (st.best_peer_height - st.base_height) as f64
    }

    /// Hashes from the tip back, sparser with depth, for header requests.
    pub fn locator(&self) -> Vec<Hash256> {
        let st = self.state.read();
        let mut out = Vec::new();
        let mut step = 1usize;
        let mut idx = st.main_chain.len() as isize - 1;
        while idx >= 0 {
            out.push(st.main_chain[idx as usize]);
            if out.len() >= 10 {
                step *= 2;
            }
            idx -= step as isize;
        }
        if out.last() != st.main_chain.first() {
            if let Some(first) = st.main_chain.first() {
                out.push(*first);
            }
        }
        out
    }

    /// Marks the engine as syncing.
    pub fn start(&self) {
        let _writer = self.writer.lock();
        let started = {
            let mut st = self.state.write();
            let was = st.sync_state;
            st.sync_state = if st.tip_height() >= st.best_peer_height && st.best_peer_height > st.base_height {
                SyncState::Synced
            } else {
                SyncState::Syncing
            };
            was == SyncState::Idle
        };
        if started {
            info!("{}: sync started", self.params.chain_id);
            self.notify(&[SyncEvent::SyncStarted]);
        }
    }

    pub fn stop(&self, error: Option<String>) {
        let _writer = self.writer.lock();
        let was_running = {
            let mut st = self.state.write();
            let was = st.sync_state != SyncState::Idle;
            st.sync_state = SyncState::Idle;
            was
        };
        if was_running {
            match &error {
                Some(e) => warn!("{}: sync stopped: {}", self.params.chain_id, e),
                None => info!("{}: sync stopped", self.params.chain_id),
            }
            self.notify(&[SyncEvent::SyncStopped { error }]);
        }
    }

    /// Records a peer's announced height; falling behind re-enters `Syncing`.
    pub fn note_peer_height(&self, height: u32) {
        let _writer = self.writer.lock();
        let resumed = {
            let mut st = self.state.write();
            st.best_peer_height = st.best_peer_height.max(height);
            if st.sync_state == SyncState::Synced && height > st.tip_height() {
                st.sync_state = SyncState::Syncing;
                true
            } else {
                false
            }
        };
        if resumed {
            debug!("{}: peer at {} is ahead, resyncing", self.params.chain_id, height);
            self.notify(&[SyncEvent::SyncStarted]);
        }
    }

    pub fn accept_header(&self, header: &BlockHeader) -> Result<HeaderOutcome, WalletError> {
        let _writer = self.writer.lock();
        let (outcome, events) = {
            let mut st = self.state.write();
            let plan = self.plan_header(&st, header)?;
            self.apply_header(&mut st, plan)
        };
        self.notify(&events);
        Ok(outcome)
    }

    /// Verifies `proof` against `header` and records `matched` as confirmed
    /// by it. Unknown headers are accepted first, after the proof checks out.
    pub fn accept_merkle_block(
        &self,
        header: &BlockHeader,
        proof: &MerkleProof,
        matched: &[Hash256],
    ) -> Result<HeaderOutcome, WalletError> {
        proof.verify(&header.merkle_root, matched)?;

        let _writer = self.writer.lock();
        let (outcome, events) = {
            let mut st = self.state.write();
            let hash = header.hash();
            let plan = self.plan_header(&st, header)?;
            let already_known = matches!(plan, HeaderPlan::Duplicate);

            let known = st.block_txs.entry(hash).or_default();
            let mut fresh = Vec::new();
            for txid in matched {
                if !known.contains(txid) {
                    known.push(*txid);
                    fresh.push(*txid);
                }
            }

            // new headers confirm their transactions while being applied
            let (outcome, mut events) = self.apply_header(&mut st, plan);
            if already_known {
                if let Some(record) = st.headers.get(&hash).filter(|r| st.is_on_main_chain(r)).cloned() {
                    for txid in fresh {
                        st.confirmed_in.insert(txid, hash);
                        events.push(SyncEvent::TransactionConfirmed {
                            txid,
                            height: record.height,
                            timestamp: record.timestamp,
                        });
                    }
                }
            }
            (outcome, events)
        };
        self.notify(&events);
        Ok(outcome)
    }

    fn plan_header(&self, st: &EngineState, header: &BlockHeader) -> Result<HeaderPlan, WalletError> {
        let hash = header.hash();
        if st.headers.contains_key(&hash) {
            return Ok(HeaderPlan::Duplicate);
        }
        let parent = st.headers.get(&header.previous_hash).ok_or_else(|| {
            WalletError::DiscontinuousChain(format!("Parent {} of {} is unknown", header.previous_hash, hash))
        })?;
        let height = parent.height + 1;

        header.check_proof_of_work(self.params.pow_limit_bits)?;
        self.check_difficulty(st, parent, header, height)?;

        let record = HeaderRecord::from_header(header, height, &parent.chain_work);
        let tip = st
            .tip()
            .ok_or_else(|| WalletError::InternalError("Header index has no tip".to_string()))?;

        self.check_checkpoint(&hash, height)?;
        if parent.hash == tip.hash {
            return Ok(HeaderPlan::Extend(record));
        }
        if record.chain_work <= tip.chain_work {
            return Ok(HeaderPlan::Side(record));
        }

        // heavier branch: collect it back to the accepted chain
        let mut branch = vec![record.hash];
        let mut cursor = parent;
        while !st.is_on_main_chain(cursor) {
            self.check_checkpoint(&cursor.hash, cursor.height)?;
            branch.push(cursor.hash);
            cursor = st.headers.get(&cursor.previous_hash).ok_or_else(|| {
                WalletError::DiscontinuousChain(format!("Branch of {} does not reach the accepted chain", hash))
            })?;
        }
        let fork_height = cursor.height;
        let floor = self.params.checkpoint_floor(st.tip_height()).max(st.base_height);
        if fork_height < floor {
            return Err(WalletError::ReorgTooDeep(format!(
                "Branch forks at {} below checkpoint {}",
                fork_height, floor
            )));
        }
        branch.reverse();
        Ok(HeaderPlan::Reorg { record, fork_height, branch })
    }

    fn check_checkpoint(&self, hash: &Hash256, height: u32) -> Result<(), WalletError> {
        match self.params.checkpoint_at(height) {
            Some(cp) if cp.hash != *hash => Err(WalletError::DiscontinuousChain(format!(
                "Header {} at height {} contradicts checkpoint {}",
                hash, height, cp.hash
            ))),
            _ => Ok(()),
        }
    }

    fn check_difficulty(
        &self,
        st: &EngineState,
        parent: &HeaderRecord,
        header: &BlockHeader,
        height: u32,
    ) -> Result<(), WalletError> {
        if !is_retarget_height(&self.params, height) {
            if header.bits != parent.bits {
                return Err(WalletError::InvalidProofOfWork(format!(
                    "Bits {:#010x} at {} differ from previous {:#010x} inside a retarget interval",
                    header.bits, height, parent.bits
                )));
            }
            return Ok(());
        }

        // anchors sit on retarget boundaries, so the first header of the
        // closing period is always indexed
        let first = height
            .checked_sub(self.params.retarget_interval)
            .and_then(|first_height| st.ancestor(parent, first_height))
            .ok_or_else(|| {
                WalletError::InvalidProofOfWork(format!(
                    "Retarget at {} cannot be checked: period start is not indexed",
                    height
                ))
            })?;
        let expected = retarget(&self.params, parent, first.timestamp);
        if header.bits != expected {
            return Err(WalletError::InvalidProofOfWork(format!(
                "Bits {:#010x} at {} do not match retarget {:#010x}",
                header.bits, height, expected
            )));
        }
        Ok(())
    }

    fn apply_header(&self, st: &mut EngineState, plan: HeaderPlan) -> (HeaderOutcome, Vec<SyncEvent>) {
        let mut events = Vec::new();
        let outcome = match plan {
            HeaderPlan::Duplicate => HeaderOutcome::Duplicate,
            HeaderPlan::Side(record) => {
                debug!("{}: side-branch header {} at {}", self.params.chain_id, record.hash, record.height);
                let height = record.height;
                st.headers.insert(record.hash, record);
                HeaderOutcome::SideBranch { height }
            }
            HeaderPlan::Extend(record) => {
                let height = record.height;
                let hash = record.hash;
                let timestamp = record.timestamp;
                events.push(SyncEvent::HeaderAdded { hash, height, timestamp });
                st.headers.insert(hash, record);
                st.main_chain.push(hash);
                for txid in st.block_txs.get(&hash).cloned().unwrap_or_default() {
                    st.confirmed_in.insert(txid, hash);
                    events.push(SyncEvent::TransactionConfirmed { txid, height, timestamp });
                }
                events.push(SyncEvent::HeightIncreased { height });
                HeaderOutcome::Extended { height }
            }
            HeaderPlan::Reorg { record, fork_height, branch } => {
                let old_height = st.tip_height();
                st.headers.insert(record.hash, record);

                let new_txs: HashSet<Hash256> = branch
                    .iter()
                    .filter_map(|h| st.block_txs.get(h))
                    .flatten()
                    .copied()
                    .collect();

                let keep = (fork_height - st.base_height + 1) as usize;
                let removed: Vec<Hash256> = st.main_chain.split_off(keep);
                for hash in removed.iter().rev() {
                    let height = st.headers.get(hash).map(|r| r.height).unwrap_or_default();
                    if let Some(txs) = st.block_txs.get(hash) {
                        for txid in txs {
                            if !new_txs.contains(txid) {
                                events.push(SyncEvent::TransactionUnconfirmed { txid: *txid });
                            }
                        }
                    }
                    for txid in st.block_txs.get(hash).cloned().unwrap_or_default() {
                        st.confirmed_in.remove(&txid);
                    }
                    events.push(SyncEvent::HeaderRemoved { hash: *hash, height });
                }

                for hash in &branch {
                    let (height, timestamp) = st
                        .headers
                        .get(hash)
                        .map(|r| (r.height, r.timestamp))
                        .unwrap_or_default();
                    st.main_chain.push(*hash);
                    events.push(SyncEvent::HeaderAdded { hash: *hash, height, timestamp });
                    for txid in st.block_txs.get(hash).cloned().unwrap_or_default() {
                        st.confirmed_in.insert(txid, *hash);
                        events.push(SyncEvent::TransactionConfirmed { txid, height, timestamp });
                    }
                }

                let new_height = st.tip_height();
                if new_height > old_height {
                    events.push(SyncEvent::HeightIncreased { height: new_height });
                }
                warn!(
                    "{}: reorganized at fork height {}, {} headers removed, {} added",
                    self.params.chain_id,
                    fork_height,
                    removed.len(),
                    branch.len()
                );
                HeaderOutcome::Reorganized { fork_height, removed: removed.len(), added: branch.len() }
            }
        };

        if st.sync_state == SyncState::Syncing && st.tip_height() >= st.best_peer_height {
            st.sync_state = SyncState::Synced;
            info!("{}: synced at height {}", self.params.chain_id, st.tip_height());
            events.push(SyncEvent::SyncStopped { error: None });
        }
        (outcome, events)
    }

    fn notify(&self, events: &[SyncEvent]) {
        if events.is_empty() {
            return;
        }
        let subscribers = self.subscribers.read();
        for event in events {
            for handler in subscribers.iter() {
                handler(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::spv::merkle::merkle_root;
    use crate::core::config::ChainKind;
    use std::sync::Arc;

    fn params() -> ChainParams {
        ChainParams::regtest("T", ChainKind::Main)
    }

    fn genesis() -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            previous_hash: Hash256::ZERO,
            merkle_root: Hash256::hash(b"genesis"),
            timestamp: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        };
        header.mine().unwrap();
        header
    }

    fn child(parent: &BlockHeader, salt: u8, txids: &[Hash256]) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            previous_hash: parent.hash(),
            merkle_root: if txids.is_empty() { Hash256::hash(&[salt]) } else { merkle_root(txids) },
            timestamp: parent.timestamp + 60,
            bits: parent.bits,
            nonce: 0,
        };
        header.mine().unwrap();
        header
    }

    /// Child of `parent` carrying the bits the engine expects at its height.
    /// The period start must be on the accepted chain.
    fn next(engine: &ChainSyncEngine, parent: &BlockHeader, salt: u8, txids: &[Hash256], spacing: u32) -> BlockHeader {
        let params = engine.params();
        let record = engine.header(&parent.hash()).unwrap();
        let height = record.height + 1;
        let bits = if is_retarget_height(params, height) {
            let first = engine.header_at(height - params.retarget_interval).unwrap();
            retarget(params, &record, first.timestamp)
        } else {
            record.bits
        };
        let mut header = BlockHeader {
            version: 1,
            previous_hash: parent.hash(),
            merkle_root: if txids.is_empty() { Hash256::hash(&[salt, height as u8]) } else { merkle_root(txids) },
            timestamp: parent.timestamp + spacing,
            bits,
            nonce: 0,
        };
        header.mine().unwrap();
        header
    }

    fn grow(engine: &ChainSyncEngine, from: &BlockHeader, salt: u8, count: usize, spacing: u32) -> Vec<BlockHeader> {
        let mut out: Vec<BlockHeader> = Vec::new();
        for _ in 0..count {
            let parent = out.last().unwrap_or(from).clone();
            let header = next(engine, &parent, salt, &[], spacing);
            engine.accept_header(&header).unwrap();
            out.push(header);
        }
        out
    }

    fn accept_block(engine: &ChainSyncEngine, header: &BlockHeader, txid: Hash256) -> HeaderOutcome {
        engine
            .accept_merkle_block(header, &MerkleProof::build(&[txid], &[true]), &[txid])
            .unwrap()
    }

    fn recorder(engine: &ChainSyncEngine) -> Arc<Mutex<Vec<SyncEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        engine.subscribe(move |e| sink.lock().push(e.clone()));
        log
    }

    #[test]
    fn test_extend_chain() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let log = recorder(&engine);
        let h1 = child(&g, 1, &[]);
        assert_eq!(engine.accept_header(&h1).unwrap(), HeaderOutcome::Extended { height: 1 });
        assert_eq!(engine.accept_header(&h1).unwrap(), HeaderOutcome::Duplicate);
        assert_eq!(engine.tip_height(), 1);
        assert_eq!(
            *log.lock(),
            vec![
                SyncEvent::HeaderAdded { hash: h1.hash(), height: 1, timestamp: h1.timestamp },
                SyncEvent::HeightIncreased { height: 1 },
            ]
        );
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let orphan = child(&child(&g, 1, &[]), 2, &[]);
        assert!(matches!(engine.accept_header(&orphan), Err(WalletError::DiscontinuousChain(_))));
        assert_eq!(engine.tip_height(), 0);
    }

    #[test]
    fn test_bits_change_inside_interval_rejected() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let mut h1 = child(&g, 1, &[]);
        h1.bits = 0x2000ffff;
        h1.mine().unwrap();
        assert!(matches!(engine.accept_header(&h1), Err(WalletError::InvalidProofOfWork(_))));
    }

    #[test]
    fn test_merkle_block_confirms_transactions() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let log = recorder(&engine);
        let txids = vec![Hash256::hash(b"a"), Hash256::hash(b"b"), Hash256::hash(b"c")];
        let h1 = child(&g, 1, &txids);
        let proof = MerkleProof::build(&txids, &[false, true, false]);

        engine.accept_merkle_block(&h1, &proof, &[txids[1]]).unwrap();
        assert_eq!(engine.transaction_height(&txids[1]), Some((1, h1.timestamp)));
        assert!(log
            .lock()
            .contains(&SyncEvent::TransactionConfirmed { txid: txids[1], height: 1, timestamp: h1.timestamp }));
    }

    #[test]
    fn test_bad_merkle_proof_leaves_state_untouched() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let txids = vec![Hash256::hash(b"a"), Hash256::hash(b"b")];
        let h1 = child(&g, 1, &txids);
        let proof = MerkleProof::build(&txids, &[true, false]);
        let err = engine.accept_merkle_block(&h1, &proof, &[txids[1]]).unwrap_err();
        assert!(err.is_peer_misbehavior());
        assert_eq!(engine.tip_height(), 0);
        assert!(engine.header(&h1.hash()).is_none());
    }

    #[test]
    fn test_sync_state_transitions() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let log = recorder(&engine);
        engine.note_peer_height(2);
        engine.start();
        assert_eq!(engine.state(), SyncState::Syncing);
        assert!(engine.progress() < 1.0);

        let h1 = child(&g, 1, &[]);
        let h2 = child(&h1, 2, &[]);
        engine.accept_header(&h1).unwrap();
        engine.accept_header(&h2).unwrap();
        assert_eq!(engine.state(), SyncState::Synced);
        assert_eq!(engine.progress(), 1.0);

        engine.note_peer_height(3);
        assert_eq!(engine.state(), SyncState::Syncing);
        let events = log.lock();
        assert_eq!(events[0], SyncEvent::SyncStarted);
        assert!(events.contains(&SyncEvent::SyncStopped { error: None }));
        assert_eq!(events.last(), Some(&SyncEvent::SyncStarted));
    }

    #[test]
    fn test_checkpoint_mismatch_rejected() {
        let g = genesis();
        let mut p = params();
        let h1 = child(&g, 1, &[]);
        p.checkpoints.push(Checkpoint {
            height: 1,
            hash: h1.hash(),
            timestamp: h1.timestamp,
            bits: h1.bits,
        });
        let engine = ChainSyncEngine::from_genesis(p, &g).unwrap();
        let impostor = child(&g, 9, &[]);
        assert!(matches!(engine.accept_header(&impostor), Err(WalletError::DiscontinuousChain(_))));
        assert_eq!(engine.accept_header(&h1).unwrap(), HeaderOutcome::Extended { height: 1 });
    }

    #[test]
    fn test_heavier_branch_must_match_checkpoints() {
        let g = genesis();
        let scratch = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let main = grow(&scratch, &g, 1, 3, 60);
        let mut p = params();
        p.checkpoints.push(Checkpoint {
            height: 3,
            hash: main[2].hash(),
            timestamp: main[2].timestamp,
            bits: main[2].bits,
        });
        let engine = ChainSyncEngine::from_genesis(p, &g).unwrap();
        engine.accept_header(&main[0]).unwrap();
        engine.accept_header(&main[1]).unwrap();

        // outgrows the tip at a height the checkpoint pins to another header
        let b2 = next(&engine, &main[0], 7, &[], 60);
        assert_eq!(engine.accept_header(&b2).unwrap(), HeaderOutcome::SideBranch { height: 2 });
        let b3 = next(&engine, &b2, 7, &[], 60);
        assert!(matches!(engine.accept_header(&b3), Err(WalletError::DiscontinuousChain(_))));
        assert_eq!(engine.tip().unwrap().hash, main[1].hash());
        assert!(engine.header(&b3.hash()).is_none());

        assert_eq!(engine.accept_header(&main[2]).unwrap(), HeaderOutcome::Extended { height: 3 });
    }

    #[test]
    fn test_shorter_heavier_branch_below_checkpoint_refused() {
        let g = genesis();
        let scratch = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let main = grow(&scratch, &g, 1, 20, 60);
        let h20 = &main[19];
        let mut p = params();
        p.checkpoints.push(Checkpoint { height: 20, hash: h20.hash(), timestamp: h20.timestamp, bits: h20.bits });
        let engine = ChainSyncEngine::from_genesis(p, &g).unwrap();
        for header in &main {
            engine.accept_header(header).unwrap();
        }

        // one-second spacing retargets the branch to a quarter of the target,
        // so it outweighs the checkpointed chain without reaching its height
        let mut parent = g.clone();
        for height in 1..=12 {
            let header = next(&engine, &parent, 9, &[], 1);
            assert_eq!(engine.accept_header(&header).unwrap(), HeaderOutcome::SideBranch { height });
            parent = header;
        }
        let b13 = next(&engine, &parent, 9, &[], 1);
        let err = engine.accept_header(&b13).unwrap_err();
        assert!(err.recommends_rescan());
        assert_eq!(engine.tip().unwrap().hash, h20.hash());
        assert!(engine.header(&b13.hash()).is_none());
    }

    #[test]
    fn test_retarget_boundary_bits_enforced() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let chain = grow(&engine, &g, 1, 9, 60);
        let h9 = chain.last().unwrap();
        let expected = next(&engine, h9, 2, &[], 60);
        assert_ne!(expected.bits, h9.bits);

        for bits in [expected.bits - 1, expected.bits + 1, h9.bits] {
            let mut wrong = expected.clone();
            wrong.bits = bits;
            wrong.mine().unwrap();
            assert!(
                matches!(engine.accept_header(&wrong), Err(WalletError::InvalidProofOfWork(_))),
                "bits {:#010x} accepted",
                bits
            );
        }
        assert_eq!(engine.accept_header(&expected).unwrap(), HeaderOutcome::Extended { height: 10 });
    }

    #[test]
    fn test_anchor_must_open_a_retarget_period() {
        let g = genesis();
        let unaligned = Checkpoint { height: 5, hash: g.hash(), timestamp: g.timestamp, bits: g.bits };
        assert!(matches!(
            ChainSyncEngine::from_checkpoint(params(), &unaligned),
            Err(WalletError::ConfigError(_))
        ));

        let aligned = Checkpoint { height: 10, ..unaligned };
        let engine = ChainSyncEngine::from_checkpoint(params(), &aligned).unwrap();
        let chain = grow(&engine, &g, 1, 9, 60);
        let expected = next(&engine, chain.last().unwrap(), 2, &[], 60);
        let mut loose = expected.clone();
        loose.bits = 0x2000ffff;
        loose.mine().unwrap();
        assert!(matches!(engine.accept_header(&loose), Err(WalletError::InvalidProofOfWork(_))));
        assert_eq!(engine.accept_header(&expected).unwrap(), HeaderOutcome::Extended { height: 20 });
    }

    #[test]
    fn test_reorg_reports_removals_before_additions() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let h8 = grow(&engine, &g, 1, 8, 60).pop().unwrap();
        let only_a = Hash256::hash(b"only on a");
        let shared = Hash256::hash(b"on both");
        let only_b = Hash256::hash(b"only on b");

        // A: tip 10
        let a9 = next(&engine, &h8, 2, &[only_a], 60);
        accept_block(&engine, &a9, only_a);
        let a10 = next(&engine, &a9, 2, &[shared], 60);
        accept_block(&engine, &a10, shared);
        assert_eq!(engine.tip_height(), 10);

        // B: same work up to 10, heavier from 11
        let b9 = next(&engine, &h8, 3, &[only_b], 60);
        assert_eq!(accept_block(&engine, &b9, only_b), HeaderOutcome::SideBranch { height: 9 });
        let b10 = next(&engine, &b9, 3, &[shared], 60);
        assert_eq!(accept_block(&engine, &b10, shared), HeaderOutcome::SideBranch { height: 10 });

        let log = recorder(&engine);
        let b11 = next(&engine, &b10, 3, &[], 60);
        assert_eq!(
            engine.accept_header(&b11).unwrap(),
            HeaderOutcome::Reorganized { fork_height: 8, removed: 2, added: 3 }
        );
        let b12 = next(&engine, &b11, 3, &[], 60);
        assert_eq!(engine.accept_header(&b12).unwrap(), HeaderOutcome::Extended { height: 12 });

        assert_eq!(
            *log.lock(),
            vec![
                SyncEvent::HeaderRemoved { hash: a10.hash(), height: 10 },
                SyncEvent::TransactionUnconfirmed { txid: only_a },
                SyncEvent::HeaderRemoved { hash: a9.hash(), height: 9 },
                SyncEvent::HeaderAdded { hash: b9.hash(), height: 9, timestamp: b9.timestamp },
                SyncEvent::TransactionConfirmed { txid: only_b, height: 9, timestamp: b9.timestamp },
                SyncEvent::HeaderAdded { hash: b10.hash(), height: 10, timestamp: b10.timestamp },
                SyncEvent::TransactionConfirmed { txid: shared, height: 10, timestamp: b10.timestamp },
                SyncEvent::HeaderAdded { hash: b11.hash(), height: 11, timestamp: b11.timestamp },
                SyncEvent::HeightIncreased { height: 11 },
                SyncEvent::HeaderAdded { hash: b12.hash(), height: 12, timestamp: b12.timestamp },
                SyncEvent::HeightIncreased { height: 12 },
            ]
        );
        assert_eq!(engine.tip().unwrap().hash, b12.hash());
        assert_eq!(engine.transaction_height(&only_a), None);
        assert_eq!(engine.transaction_height(&shared), Some((10, b10.timestamp)));
    }

    #[test]
    fn test_locator_starts_at_tip_and_ends_at_base() {
        let g = genesis();
        let engine = ChainSyncEngine::from_genesis(params(), &g).unwrap();
        let mut prev = g.clone();
        for i in 0..5 {
            let next = child(&prev, i, &[]);
            engine.accept_header(&next).unwrap();
            prev = next;
        }
        let locator = engine.locator();
        assert_eq!(locator.first(), Some(&prev.hash()));
        assert_eq!(locator.last(), Some(&g.hash()));
    }
}
