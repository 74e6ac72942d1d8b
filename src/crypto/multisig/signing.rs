//! Cosigner signature collection.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::MultiSigConfig;
use crate::core::errors::WalletError;
use crate::crypto::signature::verify_digest;

/// One cosigner's signature over a transaction digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedSignature {
    pub public_key: PublicKey,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

/// Validates signatures against one account and one digest.
pub struct SignatureCollector<'a> {
    config: &'a MultiSigConfig,
    digest: [u8; 32],
}

impl<'a> SignatureCollector<'a> {
    pub fn new(config: &'a MultiSigConfig, digest: [u8; 32]) -> Self {
        Self { config, digest }
    }

    /// Adds a signature, returning whether the threshold is now met.
    /// A signer that already signed is ignored.
    pub fn add(
        &self,
        collected: &mut Vec<CollectedSignature>,
        public_key: PublicKey,
        signature: Vec<u8>,
    ) -> Result<bool, WalletError> {
        if !self.config.is_authorized_signer(&public_key) {
            return Err(WalletError::ValidationError("Signer not in allowed list".to_string()));
        }
        if !verify_digest(&public_key, &self.digest, &signature) {
            return Err(WalletError::ValidationError("Invalid signature".to_string()));
        }
        if !collected.iter().any(|c| c.public_key == public_key) {
            collected.push(CollectedSignature { public_key, signature });
            collected.sort_by_key(|c| c.public_key.serialize());
        }

        let complete = self.is_complete(collected);
        info!(
            "Multi-sig input signed ({}/{} signatures)",
            collected.len().min(self.config.threshold as usize),
            self.config.threshold
        );
        Ok(complete)
    }

    pub fn is_complete(&self, collected: &[CollectedSignature]) -> bool {
        self.valid_count(collected) >= self.config.threshold as usize
    }

    /// Signatures from authorized signers that verify against the digest.
    pub fn valid_count(&self, collected: &[CollectedSignature]) -> usize {
        collected
            .iter()
            .filter(|c| {
                self.config.is_authorized_signer(&c.public_key)
                    && verify_digest(&c.public_key, &self.digest, &c.signature)
            })
            .count()
    }
}
