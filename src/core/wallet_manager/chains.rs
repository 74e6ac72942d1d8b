//! Chain activation, recovery and teardown.

use std::sync::Arc;
use tracing::info;

use super::WalletCoordinator;
use crate::blockchain::chain_wallet::{ChainWallet, ChainWalletKind};
use crate::blockchain::spv::ChainSyncEngine;
use crate::core::config::ChainKind;
use crate::core::errors::WalletError;
use crate::core::wallet_info::ChainWalletInfo;
use crate::crypto::hd::ChainKeyDeriver;

/// Main chain id assumed by sidechains when the configuration names none.
const DEFAULT_MAIN_CHAIN: &str = "ELA";

impl WalletCoordinator {
    /// Opens the wallet for `chain_id`, deriving its account key. Returns
    /// the existing wallet if the chain is already active.
    pub fn activate_chain(&self, chain_id: &str, pay_password: &str) -> Result<Arc<ChainWallet>, WalletError> {
        self.open_chain(chain_id, pay_password, self.sync_from)
    }

    /// Activates `chain_id` for recovery: syncing starts at the oldest
    /// checkpoint and `limit_gap` unused addresses are watched past the
    /// highest used one.
    pub fn recover_chain(
        &self,
        chain_id: &str,
        pay_password: &str,
        limit_gap: u32,
    ) -> Result<Arc<ChainWallet>, WalletError> {
        let wallet = self.open_chain(chain_id, pay_password, 0)?;
        wallet.recover(limit_gap)?;
        Ok(wallet)
    }

    /// Stops syncing `chain_id` and forgets its wallet.
    pub fn destroy_chain(&self, chain_id: &str) -> Result<(), WalletError> {
        let wallet = self
            .chains
            .write()
            .remove(chain_id)
            .ok_or_else(|| WalletError::NotFoundError(format!("Chain '{}' is not active", chain_id)))?;
        self.stop_sync(chain_id);
        wallet.destroy();
        info!("Chain {} removed from wallet {}", chain_id, self.id);
        Ok(())
    }

    fn open_chain(&self, chain_id: &str, pay_password: &str, sync_from: u32) -> Result<Arc<ChainWallet>, WalletError> {
        if let Ok(existing) = self.chain(chain_id) {
            return Ok(existing);
        }
        let params = self.config.chain(chain_id)?;
        let account_public = self
            .vault
            .with_seed(pay_password, |seed| ChainKeyDeriver::account_public(seed, params.coin_type))?;
        let mut info = ChainWalletInfo::new(chain_id, params.coin_type, params.default_fee_per_kb, account_public);
        info.earliest_sync_time = sync_from;
        let wallet = self.mount(info)?;
        info!("Chain {} activated (coin type {})", chain_id, params.coin_type);
        Ok(wallet)
    }

    /// Builds the engine and wallet for persisted `info`.
    pub(crate) fn mount(&self, info: ChainWalletInfo) -> Result<Arc<ChainWallet>, WalletError> {
        let params = self.config.chain(&info.chain_id)?.clone();
        params.validate()?;
        let engine = Arc::new(ChainSyncEngine::new(params.clone(), info.earliest_sync_time)?);
        let kind = ChainWalletKind::for_chain(params.kind, &self.main_chain_id());
        let chain_id = info.chain_id.clone();
        let wallet = ChainWallet::new(info, params, kind, Arc::clone(&self.vault), engine)?;

        let mut chains = self.chains.write();
        // a concurrent activation may have won
        Ok(Arc::clone(chains.entry(chain_id).or_insert(wallet)))
    }

    fn main_chain_id(&self) -> String {
        let mut mains: Vec<&String> = self
            .config
            .chains
            .values()
            .filter(|p| p.kind == ChainKind::Main)
            .map(|p| &p.chain_id)
            .collect();
        mains.sort();
        mains.first().map_or_else(|| DEFAULT_MAIN_CHAIN.to_string(), |id| id.to_string())
    }
}
