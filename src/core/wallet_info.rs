// src/core/wallet_info.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blockchain::identity::IdentityRecord;
use crate::crypto::hd::ExtendedPublicKey;
use crate::crypto::multisig::MultiSigConfig;
use crate::crypto::vault::SealedBlob;

/// Per-chain settings and progress, persisted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainWalletInfo {
    pub chain_id: String,
    /// BIP44 coin type the chain's keys live under.
    pub coin_type: u32,
    #[serde(default)]
    pub single_address: bool,
    pub fee_per_kb: u64,
    /// Unix time of the oldest transaction the wallet can hold; picks the sync checkpoint.
    #[serde(default)]
    pub earliest_sync_time: u32,
    #[serde(default)]
    pub highest_used_address_index: Option<u32>,
    /// Addresses kept derived past the highest used one.
    #[serde(default)]
    pub address_gap: u32,
    #[serde(default)]
    pub multisig_accounts: Vec<MultiSigConfig>,
    /// Account key (m/44'/coin'/0') so addresses can be handed out without a password.
    pub account_public: ExtendedPublicKey,
}

impl ChainWalletInfo {
    pub fn new(chain_id: &str, coin_type: u32, fee_per_kb: u64, account_public: ExtendedPublicKey) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            coin_type,
            single_address: false,
            fee_per_kb,
            earliest_sync_time: 0,
            highest_used_address_index: None,
            address_gap: 0,
            multisig_accounts: Vec::new(),
            account_public,
        }
    }

    /// Number of receive addresses handed out so far.
    pub fn used_address_count(&self) -> u32 {
        self.highest_used_address_index.map_or(0, |i| i + 1)
    }
}

/// Everything needed to rebuild a coordinator: sealed root, chains, identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub sealed_root: SealedBlob,
    #[serde(default)]
    pub chains: Vec<ChainWalletInfo>,
    #[serde(default)]
    pub identities: Vec<IdentityRecord>,
}

impl WalletSnapshot {
    pub fn chain(&self, chain_id: &str) -> Option<&ChainWalletInfo> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hd::ChainKeyDeriver;

    fn account() -> ExtendedPublicKey {
        ChainKeyDeriver::account_public(&[7u8; 64], 0).unwrap()
    }

    #[test]
    fn test_used_address_count() {
        let mut info = ChainWalletInfo::new("ELA", 0, 10_000, account());
        assert_eq!(info.used_address_count(), 0);
        info.highest_used_address_index = Some(4);
        assert_eq!(info.used_address_count(), 5);
    }

    #[test]
    fn test_info_json_defaults() {
        let info = ChainWalletInfo::new("IdChain", 1, 10_000, account());
        let mut value = serde_json::to_value(&info).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("single_address");
        obj.remove("address_gap");
        obj.remove("multisig_accounts");
        obj.remove("highest_used_address_index");
        let back: ChainWalletInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }
}
