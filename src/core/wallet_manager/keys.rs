//! Master-key message signing.

use secp256k1::PublicKey;
use tracing::debug;

use super::WalletCoordinator;
use crate::core::errors::WalletError;
use crate::crypto::hd::ExtendedPrivateKey;
use crate::crypto::signature::{sign_message, verify_message};

impl WalletCoordinator {
    /// Public half of the BIP32 master key.
    pub fn master_public_key(&self, pay_password: &str) -> Result<PublicKey, WalletError> {
        self.vault
            .with_seed(pay_password, |seed| ExtendedPrivateKey::from_seed(seed)?.public_key())
    }

    /// Signs `message` with the master key. Verify with [`WalletCoordinator::check_sign`].
    pub fn sign_message(&self, message: &[u8], pay_password: &str) -> Result<[u8; 64], WalletError> {
        let signature = self.vault.with_seed(pay_password, |seed| {
            let master = ExtendedPrivateKey::from_seed(seed)?;
            sign_message(&master.secret_key()?, message)
        })?;
        debug!("Signed {} byte message with the master key", message.len());
        Ok(signature)
    }

    pub fn check_sign(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
        verify_message(public_key, message, signature)
    }
}
