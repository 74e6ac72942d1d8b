//! Wallet lifecycle management
//!
//! Creation from fresh entropy or a mnemonic, password changes, and the
//! snapshot a coordinator is rebuilt from.

use bip39::{Language, Mnemonic};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{check_password, WalletCoordinator};
use crate::core::config::WalletConfig;
use crate::core::errors::WalletError;
use crate::core::wallet_info::WalletSnapshot;
use crate::crypto::vault::{mnemonic_from_root, KeyVault};
use crate::security::secret::RootSecret;

/// 128 bits: a 12-word mnemonic.
const ENTROPY_LEN: usize = 16;

impl WalletCoordinator {
    /// Create a wallet around fresh random entropy.
    ///
    /// # Arguments
    /// * `phrase_password` - optional BIP39 passphrase ("" for none)
    /// * `pay_password` - seals the root secret
    ///
    /// # Errors
    /// * `WalletError::ValidationError` - pay password too short
    /// * `WalletError::CryptoError` - sealing failed
    pub fn create(config: WalletConfig, phrase_password: &str, pay_password: &str) -> Result<Self, WalletError> {
        check_password(&config, pay_password)?;
        let mut entropy = Zeroizing::new(vec![0u8; ENTROPY_LEN]);
        OsRng.fill_bytes(&mut entropy);
        let root = RootSecret::new(entropy.to_vec(), phrase_password);
        let vault = KeyVault::create(&root, pay_password, &config.security.kdf)?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        info!("Created wallet {}", id);
        let sync_from = now.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        Ok(Self::assemble(id, now, config, vault, Vec::new(), sync_from))
    }

    /// Rebuild a wallet from its mnemonic phrase.
    ///
    /// Returns the coordinator on success; an unparseable phrase (unknown
    /// word, bad checksum, wrong length) is `Err(MnemonicError)`.
    pub fn import_from_mnemonic(
        config: WalletConfig,
        mnemonic: &str,
        phrase_password: &str,
        pay_password: &str,
    ) -> Result<Self, WalletError> {
        check_password(&config, pay_password)?;
        let parsed = Mnemonic::parse_in(Language::English, mnemonic.trim()).map_err(|e| {
            warn!("Mnemonic import rejected");
            WalletError::MnemonicError(format!("Invalid mnemonic: {}", e))
        })?;
        let entropy = Zeroizing::new(parsed.to_entropy());
        let root = RootSecret::new(entropy.to_vec(), phrase_password);
        let vault = KeyVault::create(&root, pay_password, &config.security.kdf)?;
        let id = Uuid::new_v4();
        info!("Imported wallet {} from mnemonic", id);
        // an imported wallet may hold history from before today
        Ok(Self::assemble(id, Utc::now(), config, vault, Vec::new(), 0))
    }

    /// The mnemonic phrase, after checking `pay_password`.
    pub fn export_mnemonic(&self, pay_password: &str) -> Result<Zeroizing<String>, WalletError> {
        let root = self.vault.unlock(pay_password)?;
        info!("Mnemonic exported for wallet {}", self.id);
        mnemonic_from_root(&root)
    }

    /// Reseals the root secret; the old password stays valid if this fails.
    pub fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), WalletError> {
        self.check_password_policy(new_password)?;
        self.vault.rotate_password(old_password, new_password)
    }

    /// Everything needed to rebuild this coordinator with [`WalletCoordinator::restore`].
    pub fn snapshot(&self) -> WalletSnapshot {
        let mut chains: Vec<_> = self.chains.read().values().map(|w| w.info()).collect();
        chains.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        WalletSnapshot {
            id: self.id,
            created_at: self.created_at,
            sealed_root: self.vault.sealed_blob(),
            chains,
            identities: self.identity.records(),
        }
    }

    /// Rebuilds a coordinator and its chains without a password: chain
    /// wallets hand out addresses from their stored account keys.
    pub fn restore(config: WalletConfig, snapshot: WalletSnapshot) -> Result<Self, WalletError> {
        let coordinator = Self::assemble(
            snapshot.id,
            snapshot.created_at,
            config,
            KeyVault::from_sealed(snapshot.sealed_root),
            snapshot.identities,
            0,
        );
        for info in snapshot.chains {
            coordinator.mount(info)?;
        }
        info!("Restored wallet {} ({} chains)", coordinator.id, coordinator.chains.read().len());
        Ok(coordinator)
    }

    /// Tears down every chain wallet.
    pub fn close(&self) {
        for chain_id in self.chain_ids() {
            if let Err(e) = self.destroy_chain(&chain_id) {
                warn!("Closing {}: {}", chain_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_gives_twelve_words() {
        let coordinator = WalletCoordinator::create(config(), "", PAY_PASSWORD).unwrap();
        let phrase = coordinator.export_mnemonic(PAY_PASSWORD).unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
    }

    #[test]
    fn test_import_and_export_mnemonic() {
        let coordinator = coordinator();
        assert_eq!(coordinator.export_mnemonic(PAY_PASSWORD).unwrap().as_str(), MNEMONIC);
        assert!(matches!(coordinator.export_mnemonic("wrong-password"), Err(WalletError::Authentication(_))));
    }

    #[test]
    fn test_import_invalid_mnemonic_is_err() {
        let result = WalletCoordinator::import_from_mnemonic(config(), "abandon zebra nonsense", "", PAY_PASSWORD);
        assert!(matches!(result, Err(WalletError::MnemonicError(_))));
    }

    #[test]
    fn test_short_pay_password_rejected() {
        assert!(matches!(
            WalletCoordinator::create(config(), "", "short"),
            Err(WalletError::ValidationError(_))
        ));
    }

    #[test]
    fn test_change_password() {
        let coordinator = coordinator();
        assert!(coordinator.change_password("wrong-password", "new-password-2").is_err());
        coordinator.change_password(PAY_PASSWORD, "new-password-2").unwrap();
        assert!(coordinator.export_mnemonic(PAY_PASSWORD).is_err());
        assert_eq!(coordinator.export_mnemonic("new-password-2").unwrap().as_str(), MNEMONIC);
    }

    #[test]
    fn test_snapshot_restore_keeps_chains_and_identities() {
        let coordinator = coordinator();
        let wallet = coordinator.activate_chain("ELA", PAY_PASSWORD).unwrap();
        let address = wallet.create_address().unwrap();
        let id = coordinator.identity().derive_identity(0, PAY_PASSWORD).unwrap();

        let snapshot = coordinator.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = WalletCoordinator::restore(config(), serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(restored.id(), coordinator.id());
        assert_eq!(restored.chain_ids(), vec!["ELA".to_string()]);
        let chain = restored.chain("ELA").unwrap();
        assert_eq!(chain.all_addresses(0, 10).0, vec![address]);
        assert_eq!(restored.identity().all_ids(), vec![id]);
        assert_eq!(restored.export_mnemonic(PAY_PASSWORD).unwrap().as_str(), MNEMONIC);
    }
}
