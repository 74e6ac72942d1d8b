//! Keystore export and import
//!
//! A keystore carries the same snapshot as [`WalletCoordinator::snapshot`],
//! except that the root secret is resealed under a backup password so the
//! file can leave the device.

use tracing::info;

use super::{check_password, WalletCoordinator};
use crate::core::config::WalletConfig;
use crate::core::errors::WalletError;
use crate::crypto::vault::{seal, unseal, KeyVault};
use crate::security::secret::RootSecret;
use crate::storage::keystore::{KeystoreDocument, KeystoreFile};

impl WalletCoordinator {
    /// Writes a backup of this wallet to `keystore`.
    ///
    /// # Errors
    /// * `WalletError::Authentication` - wrong pay password
    /// * `WalletError::ValidationError` - backup password too short
    /// * `WalletError::StorageError` - the keystore could not be written
    pub fn export_keystore(
        &self,
        keystore: &dyn KeystoreFile,
        backup_password: &str,
        pay_password: &str,
    ) -> Result<(), WalletError> {
        self.check_password_policy(backup_password)?;
        let root = self.vault.unlock(pay_password)?;
        let mut snapshot = self.snapshot();
        snapshot.sealed_root = seal(&root.to_bytes(), backup_password, &self.config.security.kdf)?;
        keystore.write(&KeystoreDocument::new(snapshot))?;
        info!("Wallet {} exported to keystore", self.id);
        Ok(())
    }

    /// Rebuilds a wallet from a keystore, resealing its root secret under
    /// `pay_password`.
    pub fn import_from_keystore(
        config: WalletConfig,
        keystore: &dyn KeystoreFile,
        backup_password: &str,
        pay_password: &str,
    ) -> Result<Self, WalletError> {
        check_password(&config, pay_password)?;
        let mut snapshot = keystore.read()?.wallet;
        let bytes = unseal(&snapshot.sealed_root, backup_password)?;
        let root = RootSecret::from_bytes(&bytes)
            .ok_or_else(|| WalletError::CryptoError("Keystore root secret is malformed".to_string()))?;
        let vault = KeyVault::create(&root, pay_password, &config.security.kdf)?;
        snapshot.sealed_root = vault.sealed_blob();
        let coordinator = Self::restore(config, snapshot)?;
        info!("Wallet {} imported from keystore", coordinator.id);
        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::storage::keystore::FileKeystore;
    use pretty_assertions::assert_eq;

    const BACKUP_PASSWORD: &str = "backup-password";

    #[test]
    fn test_keystore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = FileKeystore::new(dir.path().join("wallet.json"));
        let coordinator = coordinator();
        let address = coordinator.activate_chain("ELA", PAY_PASSWORD).unwrap().create_address().unwrap();
        let id = coordinator.identity().derive_identity(1, PAY_PASSWORD).unwrap();
        coordinator.export_keystore(&keystore, BACKUP_PASSWORD, PAY_PASSWORD).unwrap();

        let imported =
            WalletCoordinator::import_from_keystore(config(), &keystore, BACKUP_PASSWORD, "another-pay-pass").unwrap();
        assert_eq!(imported.id(), coordinator.id());
        assert_eq!(imported.export_mnemonic("another-pay-pass").unwrap().as_str(), MNEMONIC);
        assert_eq!(imported.chain("ELA").unwrap().all_addresses(0, 1).0, vec![address]);
        assert!(imported.identity().sign(&id, b"msg", "another-pay-pass").is_ok());
    }

    #[test]
    fn test_keystore_is_not_sealed_with_pay_password() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = FileKeystore::new(dir.path().join("wallet.json"));
        coordinator().export_keystore(&keystore, BACKUP_PASSWORD, PAY_PASSWORD).unwrap();
        assert!(matches!(
            WalletCoordinator::import_from_keystore(config(), &keystore, PAY_PASSWORD, PAY_PASSWORD),
            Err(WalletError::Authentication(_))
        ));
    }

    #[test]
    fn test_export_needs_pay_password() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = FileKeystore::new(dir.path().join("wallet.json"));
        assert!(coordinator().export_keystore(&keystore, BACKUP_PASSWORD, "wrong-password").is_err());
        assert!(!dir.path().join("wallet.json").exists());
    }
}
