//! Wallet Coordinator Core Module
//!
//! Owns the key vault and every per-chain wallet derived from it.
//!
//! ## Module Structure
//! - `lifecycle` - create, mnemonic import/export, password change, snapshot/restore
//! - `chains` - chain activation, recovery and teardown
//! - `keys` - master-key message signing and identities
//! - `backup` - keystore export and import
//! - `sync` - wiring chain wallets to their sync workers

pub mod backup;
pub mod chains;
pub mod keys;
pub mod lifecycle;
pub mod sync;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::blockchain::chain_wallet::ChainWallet;
use crate::blockchain::identity::{IdentityAgent, IdentityRecord};
use crate::core::config::WalletConfig;
use crate::core::errors::WalletError;
use crate::crypto::vault::KeyVault;

/// wallet coordinator
///
/// One root secret, many chains. Chain wallets are created on activation
/// and share the coordinator's vault.
pub struct WalletCoordinator {
    id: Uuid,
    created_at: DateTime<Utc>,
    config: WalletConfig,
    vault: Arc<KeyVault>,
    identity: IdentityAgent,
    /// Unix time new chains start scanning from; 0 scans from the oldest checkpoint.
    sync_from: u32,
    /// chain id → wallet
    chains: RwLock<HashMap<String, Arc<ChainWallet>>>,
    /// chain id → worker and relay tasks
    sync_tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl WalletCoordinator {
    fn assemble(
        id: Uuid,
        created_at: DateTime<Utc>,
        config: WalletConfig,
        vault: KeyVault,
        identities: Vec<IdentityRecord>,
        sync_from: u32,
    ) -> Self {
        let vault = Arc::new(vault);
        let identity = IdentityAgent::with_records(Arc::clone(&vault), config.identity.clone(), identities);
        Self {
            id,
            created_at,
            config,
            vault,
            identity,
            sync_from,
            chains: RwLock::new(HashMap::new()),
            sync_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Active chain ids, sorted.
    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chains.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn chain(&self, chain_id: &str) -> Result<Arc<ChainWallet>, WalletError> {
        self.chains
            .read()
            .get(chain_id)
            .cloned()
            .ok_or_else(|| WalletError::NotFoundError(format!("Chain '{}' is not active", chain_id)))
    }

    pub fn identity(&self) -> &IdentityAgent {
        &self.identity
    }

    fn check_password_policy(&self, password: &str) -> Result<(), WalletError> {
        check_password(&self.config, password)
    }
}

fn check_password(config: &WalletConfig, password: &str) -> Result<(), WalletError> {
    if password.chars().count() < config.security.min_password_len {
        return Err(WalletError::ValidationError(format!(
            "Password must be at least {} characters",
            config.security.min_password_len
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::blockchain::spv::BlockHeader;
    use crate::core::config::{ChainKind, ChainParams, Checkpoint, KdfParams};
    use crate::crypto::hash::Hash256;

    pub const PAY_PASSWORD: &str = "pay-password-1";
    pub const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    pub fn genesis() -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            previous_hash: Hash256::ZERO,
            merkle_root: Hash256::hash(b"coordinator genesis"),
            timestamp: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        };
        header.mine().unwrap();
        header
    }

    /// Regtest chains anchored at `genesis()`, fast KDF.
    pub fn config() -> WalletConfig {
        let g = genesis();
        let checkpoint =
            Checkpoint { height: 0, hash: g.hash(), timestamp: g.timestamp, bits: g.bits };
        let mut config = WalletConfig::default();
        config.chains.clear();
        config.security.kdf = KdfParams::Scrypt { log_n: 4, r: 8, p: 1 };
        for (id, kind) in [("ELA", ChainKind::Main), ("IdChain", ChainKind::Identity), ("Token", ChainKind::Side)] {
            let mut params = ChainParams::regtest(id, kind);
            params.checkpoints.push(checkpoint.clone());
            config = config.with_chain(params);
        }
        config
    }

    pub fn coordinator() -> WalletCoordinator {
        WalletCoordinator::import_from_mnemonic(config(), MNEMONIC, "", PAY_PASSWORD).unwrap()
    }
}
