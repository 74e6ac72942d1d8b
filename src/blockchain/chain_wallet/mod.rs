//! Per-chain wallet: addresses, balance, transaction lifecycle.
//!
//! ## Module Structure
//! - `addresses` - receive addresses, recovery gap, multi-sig accounts
//! - `transactions` - construction, signing, cosigner exchange, broadcast
//! - `tracking` - relayed transactions, sync events, confirmations, queries
//!
//! The wallet listens to its chain's `ChainSyncEngine` through a weak
//! subscription and publishes through a `SyncHandle` once one is attached.
//! State sits behind one reader-writer lock; events are sent after the lock
//! is released.

pub mod addresses;
pub mod tracking;
pub mod transactions;

use parking_lot::{Mutex, RwLock};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::blockchain::address::ProgramHash;
use crate::blockchain::spv::ChainSyncEngine;
use crate::blockchain::transaction::{OutPoint, Transaction};
use crate::blockchain::utxo::Utxo;
use crate::core::config::{ChainKind, ChainParams};
use crate::core::errors::WalletError;
use crate::core::wallet_info::ChainWalletInfo;
use crate::crypto::hash::Hash256;
use crate::crypto::multisig::MultiSigConfig;
use crate::crypto::vault::KeyVault;
use crate::network::SyncHandle;

const EVENT_CAPACITY: usize = 1024;

/// Where a sidechain's value goes when it is withdrawn to the main chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideChainLink {
    pub main_chain_id: String,
    pub destroy_address: ProgramHash,
}

impl SideChainLink {
    pub fn new(main_chain_id: &str) -> Self {
        Self { main_chain_id: main_chain_id.to_string(), destroy_address: ProgramHash::destroy() }
    }
}

/// Chain-specific capabilities of a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainWalletKind {
    /// Holds the main asset; can deposit into sidechains.
    Main,
    /// Sidechain; can withdraw back to the main chain.
    Side(SideChainLink),
    /// Identity sidechain; can also register identification payloads.
    Identity(SideChainLink),
}

impl ChainWalletKind {
    pub fn for_chain(kind: ChainKind, main_chain_id: &str) -> Self {
        match kind {
            ChainKind::Main => ChainWalletKind::Main,
            ChainKind::Side => ChainWalletKind::Side(SideChainLink::new(main_chain_id)),
            ChainKind::Identity => ChainWalletKind::Identity(SideChainLink::new(main_chain_id)),
        }
    }

    pub fn side_chain(&self) -> Option<&SideChainLink> {
        match self {
            ChainWalletKind::Main => None,
            ChainWalletKind::Side(link) | ChainWalletKind::Identity(link) => Some(link),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChainWalletKind::Main => "main",
            ChainWalletKind::Side(_) => "side",
            ChainWalletKind::Identity(_) => "identity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Constructed,
    Signed,
    Broadcast,
    Confirming { height: u32, count: u32 },
    Confirmed,
    Dropped,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Dropped)
    }

    /// Published and not dropped; its inputs count as spent.
    pub fn is_published(&self) -> bool {
        matches!(self, TxStatus::Broadcast | TxStatus::Confirming { .. } | TxStatus::Confirmed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxStatus::Constructed => "constructed",
            TxStatus::Signed => "signed",
            TxStatus::Broadcast => "broadcast",
            TxStatus::Confirming { .. } => "confirming",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxDirection {
    Sent,
    Received,
    /// Every output pays back into this wallet.
    Moved,
}

/// A transaction the wallet tracks, with its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub txid: Hash256,
    pub chain_id: String,
    pub transaction: Transaction,
    pub status: TxStatus,
    pub direction: TxDirection,
    /// Value leaving (sent) or entering (received) the wallet, fee excluded.
    pub amount: u64,
    pub fee: u64,
    pub height: Option<u32>,
    pub timestamp: Option<u32>,
}

impl PendingTransaction {
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.transaction.to_bytes()
    }

    /// Included in an accepted block; a competing spend can no longer win.
    pub fn is_in_block(&self) -> bool {
        self.height.is_some() || matches!(self.status, TxStatus::Confirming { .. } | TxStatus::Confirmed)
    }

    pub fn confirmations(&self, tip_height: u32) -> u32 {
        match self.height {
            Some(h) if tip_height >= h => tip_height - h + 1,
            _ => 0,
        }
    }
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    SyncStarted,
    SyncStopped { error: Option<String> },
    BalanceChanged { balance: u64 },
    TransactionAdded { txid: Hash256 },
    TransactionUpdated { txid: Hash256, height: Option<u32>, timestamp: Option<u32> },
    TransactionDeleted { txid: Hash256, notify_user: bool, recommend_rescan: bool },
    BlockHeightIncreased { height: u32 },
    TransactionStatusChanged { txid: Hash256, status: TxStatus, confirmations: u32 },
    BroadcastFailed { txid: Hash256, reason: String },
    WalletDestroyed,
}

#[derive(Debug, Clone)]
pub(crate) struct WalletAddress {
    /// Derivation index actually used (an invalid child moves it forward).
    pub index: u32,
    pub public_key: PublicKey,
    pub program_hash: ProgramHash,
}

pub(crate) struct WalletState {
    pub info: ChainWalletInfo,
    /// Receive addresses by slot; slot `i` is the i-th address handed out.
    pub addresses: Vec<WalletAddress>,
    pub slots: HashMap<ProgramHash, usize>,
    pub multisig: HashMap<ProgramHash, MultiSigConfig>,
    pub utxos: HashMap<OutPoint, Utxo>,
    /// Outpoint -> txid of the tracked transaction spending it.
    pub locks: HashMap<OutPoint, Hash256>,
    pub active: HashMap<Hash256, PendingTransaction>,
    /// Settled transactions (final or dropped), kept for history.
    pub archived: HashMap<Hash256, PendingTransaction>,
    /// Txids in the order the wallet first saw them.
    pub order: Vec<Hash256>,
    pub tip_height: u32,
    pub balance: u64,
}

impl WalletState {
    pub fn get(&self, txid: &Hash256) -> Option<&PendingTransaction> {
        self.active.get(txid).or_else(|| self.archived.get(txid))
    }

    pub fn owns(&self, hash: &ProgramHash) -> bool {
        self.slots.contains_key(hash) || self.multisig.contains_key(hash)
    }
}

/// One wallet per activated chain.
pub struct ChainWallet {
    kind: ChainWalletKind,
    params: ChainParams,
    vault: Arc<KeyVault>,
    engine: Arc<ChainSyncEngine>,
    pub(crate) state: RwLock<WalletState>,
    publisher: Mutex<Option<SyncHandle>>,
    events: broadcast::Sender<WalletEvent>,
}

impl ChainWallet {
    /// Builds the wallet and subscribes it to `engine`.
    pub fn new(
        info: ChainWalletInfo,
        params: ChainParams,
        kind: ChainWalletKind,
        vault: Arc<KeyVault>,
        engine: Arc<ChainSyncEngine>,
    ) -> Result<Arc<Self>, WalletError> {
        if info.chain_id != params.chain_id || engine.chain_id() != params.chain_id {
            return Err(WalletError::ConfigError(format!(
                "Wallet info '{}' does not match chain '{}'",
                info.chain_id, params.chain_id
            )));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tip_height = engine.tip_height();
        let multisig = info
            .multisig_accounts
            .iter()
            .map(|config| (addresses::multisig_program_hash(config), config.clone()))
            .collect();
        let wallet = Arc::new(Self {
            kind,
            params,
            vault,
            engine,
            state: RwLock::new(WalletState {
                info,
                addresses: Vec::new(),
                slots: HashMap::new(),
                multisig,
                utxos: HashMap::new(),
                locks: HashMap::new(),
                active: HashMap::new(),
                archived: HashMap::new(),
                order: Vec::new(),
                tip_height,
                balance: 0,
            }),
            publisher: Mutex::new(None),
            events,
        });
        wallet.fill_addresses()?;

        let weak: Weak<ChainWallet> = Arc::downgrade(&wallet);
        wallet.engine.subscribe(move |event| {
            if let Some(wallet) = weak.upgrade() {
                wallet.handle_sync_event(event);
            }
        });

        info!(
            "{}: {} chain wallet ready ({} addresses watched)",
            wallet.params.chain_id,
            wallet.kind.name(),
            wallet.state.read().addresses.len()
        );
        Ok(wallet)
    }

    pub fn chain_id(&self) -> &str {
        &self.params.chain_id
    }

    pub fn kind(&self) -> &ChainWalletKind {
        &self.kind
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn engine(&self) -> &Arc<ChainSyncEngine> {
        &self.engine
    }

    /// Current persisted settings.
    pub fn info(&self) -> ChainWalletInfo {
        self.state.read().info.clone()
    }

    pub fn set_fee_per_kb(&self, fee_per_kb: u64) {
        self.state.write().info.fee_per_kb = fee_per_kb;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    pub fn tip_height(&self) -> u32 {
        self.state.read().tip_height
    }

    /// Routes broadcasts through `handle`, loads the address filter and
    /// republishes transactions still waiting for a block.
    pub fn attach_publisher(&self, handle: SyncHandle) {
        let (filter, waiting) = {
            let st = self.state.read();
            let waiting: Vec<Transaction> = st
                .active
                .values()
                .filter(|p| p.status == TxStatus::Broadcast && p.direction != TxDirection::Received)
                .map(|p| p.transaction.clone())
                .collect();
            (Self::filter_of(&st), waiting)
        };
        if let Err(e) = handle.load_filter(filter) {
            warn!("{}: could not load filter: {}", self.chain_id(), e);
        }
        for tx in waiting {
            info!("{}: republishing {}", self.chain_id(), tx.txid());
            if let Err(e) = handle.publish(tx) {
                warn!("{}: republish failed: {}", self.chain_id(), e);
            }
        }
        *self.publisher.lock() = Some(handle);
    }

    pub fn detach_publisher(&self) -> Option<SyncHandle> {
        self.publisher.lock().take()
    }

    /// Tears the wallet down: stops its sync worker and tells listeners.
    pub fn destroy(&self) {
        if let Some(handle) = self.detach_publisher() {
            handle.stop();
        }
        info!("{}: wallet destroyed", self.chain_id());
        self.emit(vec![WalletEvent::WalletDestroyed]);
    }

    pub(crate) fn publisher(&self) -> Option<SyncHandle> {
        self.publisher.lock().clone()
    }

    pub(crate) fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub(crate) fn emit(&self, events: Vec<WalletEvent>) {
        for event in events {
            // no receivers is fine
            let _ = self.events.send(event);
        }
    }

    /// Pushes the current address filter to the sync worker, if any.
    pub(crate) fn refresh_filter(&self) {
        let Some(handle) = self.publisher() else {
            return;
        };
        let filter = Self::filter_of(&self.state.read());
        if let Err(e) = handle.load_filter(filter) {
            warn!("{}: could not load filter: {}", self.chain_id(), e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_kind_for_chain() {
        assert_eq!(ChainWalletKind::for_chain(ChainKind::Main, "ELA"), ChainWalletKind::Main);
        let side = ChainWalletKind::for_chain(ChainKind::Side, "ELA");
        assert_eq!(side.side_chain().unwrap().destroy_address, ProgramHash::destroy());
        assert!(matches!(ChainWalletKind::for_chain(ChainKind::Identity, "ELA"), ChainWalletKind::Identity(_)));
    }

    #[test]
    fn test_mismatched_info_rejected() {
        let (wallet, g) = wallet_with(ChainKind::Main);
        let mut info = wallet.info();
        info.chain_id = "Other".to_string();
        let engine = Arc::new(ChainSyncEngine::from_genesis(wallet.params().clone(), &g).unwrap());
        let result = ChainWallet::new(
            info,
            wallet.params().clone(),
            ChainWalletKind::Main,
            Arc::new(KeyVault::from_sealed(wallet.vault().sealed_blob())),
            engine,
        );
        assert!(matches!(result, Err(WalletError::ConfigError(_))));
    }

    #[test]
    fn test_destroy_emits_event() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        let mut events = wallet.subscribe();
        wallet.destroy();
        assert_eq!(events.try_recv().unwrap(), WalletEvent::WalletDestroyed);
    }

    #[test]
    fn test_status_helpers() {
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(TxStatus::Dropped.is_terminal());
        assert!(!TxStatus::Broadcast.is_terminal());
        assert!(TxStatus::Confirming { height: 3, count: 1 }.is_published());
        assert!(!TxStatus::Signed.is_published());
    }
}
