//! Relayed transactions, sync events, confirmations and queries.

use tracing::{debug, info, warn};

use super::{ChainWallet, PendingTransaction, TxDirection, TxStatus, WalletEvent, WalletState};
use crate::blockchain::address::ProgramHash;
use crate::blockchain::spv::SyncEvent;
use crate::blockchain::transaction::{OutPoint, Transaction};
use crate::blockchain::utxo::Utxo;
use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

impl ChainWallet {
    /// Takes a transaction relayed by a peer. Returns whether it is now
    /// tracked. A transaction spending an output already claimed by an
    /// unconfirmed tracked transaction drops that one as a double spend; one
    /// competing with a spender already in a block is ignored.
    pub fn receive_transaction(&self, tx: Transaction) -> Result<bool, WalletError> {
        let txid = tx.txid();
        let mut events = Vec::new();
        let grew = {
            let mut guard = self.state.write();
            let st = &mut *guard;
            // asked under our lock so a concurrent confirmation cannot slip past
            let confirmed_at = self.engine().transaction_height(&txid);

            if st.archived.contains_key(&txid) {
                return Ok(true);
            }
            let mut grew = false;
            if !st.active.contains_key(&txid) {
                let paid: Vec<ProgramHash> =
                    tx.outputs.iter().map(|o| o.program_hash).filter(|h| st.owns(h)).collect();
                let spent: Vec<OutPoint> =
                    tx.inputs.iter().map(|i| i.previous).filter(|op| st.utxos.contains_key(op)).collect();
                if paid.is_empty() && spent.is_empty() {
                    return Ok(false);
                }

                let settled = spent
                    .iter()
                    .filter_map(|op| st.locks.get(op))
                    .find(|other| **other != txid && st.get(other).map_or(false, |p| p.is_in_block()))
                    .copied();
                if let Some(other) = settled {
                    warn!("{}: ignoring {}, it conflicts with {} already in a block", self.chain_id(), txid, other);
                    return Ok(false);
                }

                for outpoint in &spent {
                    if let Some(other) = st.locks.get(outpoint).copied().filter(|other| *other != txid) {
                        warn!("{}: {} double-spends {}", self.chain_id(), txid, other);
                        Self::drop_transaction(st, &other, true, false, &mut events);
                    }
                    st.locks.insert(*outpoint, txid);
                }

                let value_in: u64 = spent.iter().filter_map(|op| st.utxos.get(op)).map(|u| u.value).sum();
                let to_us: u64 = tx.outputs.iter().filter(|o| st.owns(&o.program_hash)).map(|o| o.value).sum();
                let external: u64 = tx.outputs.iter().filter(|o| !st.owns(&o.program_hash)).map(|o| o.value).sum();
                let (direction, amount) = if spent.is_empty() {
                    (TxDirection::Received, to_us)
                } else if external == 0 {
                    (TxDirection::Moved, to_us)
                } else {
                    (TxDirection::Sent, external)
                };
                let fee = if spent.len() == tx.inputs.len() {
                    value_in.saturating_sub(to_us + external)
                } else {
                    0
                };
                for hash in &paid {
                    grew |= Self::mark_used(st, hash)?;
                }

                Self::apply_outputs(st, &tx, None);
                st.active.insert(
                    txid,
                    PendingTransaction {
                        txid,
                        chain_id: self.chain_id().to_string(),
                        transaction: tx,
                        status: TxStatus::Broadcast,
                        direction,
                        amount,
                        fee,
                        height: None,
                        timestamp: None,
                    },
                );
                st.order.push(txid);
                info!("{}: tracking {:?} transaction {} ({})", self.chain_id(), direction, txid, amount);
                events.push(WalletEvent::TransactionAdded { txid });
                events.push(WalletEvent::TransactionStatusChanged { txid, status: TxStatus::Broadcast, confirmations: 0 });
            }

            if let Some((height, timestamp)) = confirmed_at {
                if st.active.get(&txid).map_or(false, |p| p.height.is_none()) {
                    self.apply_confirmation(st, &txid, height, timestamp, &mut events);
                }
            }
            Self::update_balance(st, &mut events);
            grew
        };
        self.emit(events);
        if grew {
            self.refresh_filter();
        }
        Ok(true)
    }

    /// Final word from the sync worker on a published transaction.
    pub fn on_publish_result(&self, txid: &Hash256, result: Result<(), String>) {
        let reason = match result {
            Ok(()) => {
                debug!("{}: {} accepted by a peer", self.chain_id(), txid);
                return;
            }
            Err(reason) => reason,
        };
        let mut events = Vec::new();
        {
            let mut guard = self.state.write();
            let st = &mut *guard;
            let waiting = st
                .active
                .get(txid)
                .map_or(false, |p| p.status == TxStatus::Broadcast && p.height.is_none());
            if !waiting {
                return;
            }
            warn!("{}: broadcast of {} failed: {}", self.chain_id(), txid, reason);
            Self::drop_transaction(st, txid, true, false, &mut events);
            events.push(WalletEvent::BroadcastFailed { txid: *txid, reason });
        }
        self.emit(events);
    }

    /// Applies one engine notification. Runs on the engine's writer.
    pub(crate) fn handle_sync_event(&self, event: &SyncEvent) {
        let mut events = Vec::new();
        {
            let mut guard = self.state.write();
            let st = &mut *guard;
            match event {
                SyncEvent::SyncStarted => events.push(WalletEvent::SyncStarted),
                SyncEvent::SyncStopped { error } => events.push(WalletEvent::SyncStopped { error: error.clone() }),
                SyncEvent::HeaderAdded { height, .. } => {
                    st.tip_height = *height;
                    self.refresh_confirmations(st, &mut events);
                }
                SyncEvent::HeaderRemoved { height, .. } => {
                    st.tip_height = height.saturating_sub(1);
                }
                SyncEvent::TransactionConfirmed { txid, height, timestamp } => {
                    if st.active.contains_key(txid) {
                        self.apply_confirmation(st, txid, *height, *timestamp, &mut events);
                    }
                }
                SyncEvent::TransactionUnconfirmed { txid } => self.unconfirm(st, txid, &mut events),
                SyncEvent::HeightIncreased { height } => {
                    st.tip_height = *height;
                    self.refresh_confirmations(st, &mut events);
                    self.prune_final(st);
                    events.push(WalletEvent::BlockHeightIncreased { height: *height });
                }
            }
            Self::update_balance(st, &mut events);
        }
        self.emit(events);
    }

    fn apply_confirmation(
        &self,
        st: &mut WalletState,
        txid: &Hash256,
        height: u32,
        timestamp: u32,
        events: &mut Vec<WalletEvent>,
    ) {
        let Some(pending) = st.active.get_mut(txid) else {
            return;
        };
        if pending.status == TxStatus::Dropped {
            return;
        }
        pending.height = Some(height);
        pending.timestamp = Some(timestamp);
        for index in 0..pending.transaction.outputs.len() {
            if let Some(utxo) = st.utxos.get_mut(&OutPoint { txid: *txid, index: index as u16 }) {
                utxo.height = Some(height);
            }
        }
        debug!("{}: {} confirmed at {}", self.chain_id(), txid, height);
        events.push(WalletEvent::TransactionUpdated { txid: *txid, height: Some(height), timestamp: Some(timestamp) });
        self.set_confirmations(st, txid, events);
    }

    /// A reorg removed the block confirming `txid`: back to `Broadcast`.
    fn unconfirm(&self, st: &mut WalletState, txid: &Hash256, events: &mut Vec<WalletEvent>) {
        if let Some(pending) = st.archived.remove(txid) {
            if pending.status == TxStatus::Dropped {
                st.archived.insert(*txid, pending);
                return;
            }
            st.active.insert(*txid, pending);
        }
        let Some(pending) = st.active.get_mut(txid) else {
            return;
        };
        if pending.height.is_none() {
            return;
        }
        pending.height = None;
        pending.timestamp = None;
        pending.status = TxStatus::Broadcast;
        for index in 0..pending.transaction.outputs.len() {
            if let Some(utxo) = st.utxos.get_mut(&OutPoint { txid: *txid, index: index as u16 }) {
                utxo.height = None;
            }
        }
        warn!("{}: {} lost its block in a reorganization", self.chain_id(), txid);
        events.push(WalletEvent::TransactionUpdated { txid: *txid, height: None, timestamp: None });
        events.push(WalletEvent::TransactionStatusChanged { txid: *txid, status: TxStatus::Broadcast, confirmations: 0 });
    }

    fn refresh_confirmations(&self, st: &mut WalletState, events: &mut Vec<WalletEvent>) {
        let confirming: Vec<Hash256> = st
            .active
            .values()
            .filter(|p| p.height.is_some() && !p.status.is_terminal())
            .map(|p| p.txid)
            .collect();
        for txid in confirming {
            self.set_confirmations(st, &txid, events);
        }
    }

    fn set_confirmations(&self, st: &mut WalletState, txid: &Hash256, events: &mut Vec<WalletEvent>) {
        let tip = st.tip_height;
        let threshold = self.params().confirmation_threshold;
        let Some(pending) = st.active.get_mut(txid) else {
            return;
        };
        let Some(height) = pending.height else {
            return;
        };
        if pending.status.is_terminal() {
            return;
        }
        let count = pending.confirmations(tip).max(1);
        let status = if count >= threshold { TxStatus::Confirmed } else { TxStatus::Confirming { height, count } };
        if status != pending.status {
            pending.status = status;
            if status == TxStatus::Confirmed {
                info!("{}: {} confirmed ({} confirmations)", self.chain_id(), txid, count);
            }
            events.push(WalletEvent::TransactionStatusChanged { txid: *txid, status, confirmations: count });
        }
    }

    /// Moves transactions buried deeper than the finality depth out of
    /// active tracking; their spent outputs are forgotten for good.
    fn prune_final(&self, st: &mut WalletState) {
        let tip = st.tip_height;
        let depth = self.params().finality_depth;
        let settled: Vec<Hash256> = st
            .active
            .values()
            .filter(|p| p.status == TxStatus::Confirmed && p.confirmations(tip) > depth)
            .map(|p| p.txid)
            .collect();
        for txid in settled {
            if let Some(pending) = st.active.remove(&txid) {
                for input in &pending.transaction.inputs {
                    if st.locks.get(&input.previous) == Some(&txid) {
                        st.locks.remove(&input.previous);
                        st.utxos.remove(&input.previous);
                    }
                }
                debug!("{}: {} is final", self.chain_id(), txid);
                st.archived.insert(txid, pending);
            }
        }
    }

    /// Records outputs paying this wallet.
    pub(crate) fn apply_outputs(st: &mut WalletState, tx: &Transaction, height: Option<u32>) {
        let txid = tx.txid();
        for (index, out) in tx.outputs.iter().enumerate() {
            if !st.owns(&out.program_hash) {
                continue;
            }
            let outpoint = OutPoint { txid, index: index as u16 };
            st.utxos.entry(outpoint).or_insert(Utxo {
                outpoint,
                value: out.value,
                program_hash: out.program_hash,
                height,
            });
        }
    }

    /// Marks `txid` dropped, releases its inputs and forgets its outputs.
    pub(crate) fn drop_transaction(
        st: &mut WalletState,
        txid: &Hash256,
        notify_user: bool,
        recommend_rescan: bool,
        events: &mut Vec<WalletEvent>,
    ) {
        let Some(mut pending) = st.active.remove(txid) else {
            return;
        };
        pending.status = TxStatus::Dropped;
        st.locks.retain(|_, spender| *spender != *txid);
        st.utxos.retain(|outpoint, _| outpoint.txid != *txid);
        events.push(WalletEvent::TransactionStatusChanged { txid: *txid, status: TxStatus::Dropped, confirmations: 0 });
        events.push(WalletEvent::TransactionDeleted { txid: *txid, notify_user, recommend_rescan });
        st.archived.insert(*txid, pending);
        Self::update_balance(st, events);
    }

    pub(crate) fn update_balance(st: &mut WalletState, events: &mut Vec<WalletEvent>) {
        let balance = Self::balance_of(st, |_| true);
        if balance != st.balance {
            st.balance = balance;
            events.push(WalletEvent::BalanceChanged { balance });
        }
    }

    /// Confirmed outputs not spent by a published transaction.
    fn balance_of(st: &WalletState, include: impl Fn(&ProgramHash) -> bool) -> u64 {
        st.utxos
            .values()
            .filter(|u| u.height.is_some() && include(&u.program_hash))
            .filter(|u| {
                !st.locks
                    .get(&u.outpoint)
                    .and_then(|spender| st.get(spender))
                    .map_or(false, |p| p.status.is_published())
            })
            .map(|u| u.value)
            .sum()
    }

    pub fn balance(&self) -> u64 {
        Self::balance_of(&self.state.read(), |_| true)
    }

    pub fn balance_with_address(&self, address: &str) -> Result<u64, WalletError> {
        let hash = ProgramHash::from_address(address)?;
        Ok(Self::balance_of(&self.state.read(), |h| *h == hash))
    }

    pub fn transaction(&self, txid: &Hash256) -> Option<PendingTransaction> {
        self.state.read().get(txid).cloned()
    }

    /// Newest first. `filter` matches an address paid or spent from, or
    /// part of a txid.
    pub fn all_transactions(
        &self,
        start: usize,
        count: usize,
        filter: Option<&str>,
    ) -> (Vec<PendingTransaction>, usize) {
        let st = self.state.read();
        let address = filter.and_then(|f| ProgramHash::from_address(f).ok());
        let needle = filter.map(str::to_lowercase);
        let matching: Vec<&PendingTransaction> = st
            .order
            .iter()
            .rev()
            .filter_map(|txid| st.get(txid))
            .filter(|p| match (&address, &needle) {
                (Some(hash), _) => {
                    p.transaction.outputs.iter().any(|o| o.program_hash == *hash)
                        || p.transaction.programs.iter().any(|prog| prog.program_hash().ok() == Some(*hash))
                }
                (None, Some(needle)) => p.txid.to_string().contains(needle.as_str()),
                (None, None) => true,
            })
            .collect();
        let total = matching.len();
        let page = matching.into_iter().skip(start).take(count).cloned().collect();
        (page, total)
    }
}
