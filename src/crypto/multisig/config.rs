//! m-of-n account definition and its redeem script.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::core::errors::WalletError;

const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const PUSH_33: u8 = 0x21;
pub const OP_CHECKMULTISIG: u8 = 0xAE;

/// Largest signer set expressible with a single-byte OP_n.
pub const MAX_SIGNERS: usize = 16;

/// Multi-signature configuration. Signers are kept in ascending order of
/// their compressed encoding so every cosigner builds the same script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigConfig {
    pub threshold: u8,
    pub signers: Vec<PublicKey>,
}

impl MultiSigConfig {
    pub fn new(threshold: u8, mut signers: Vec<PublicKey>) -> Result<Self, WalletError> {
        signers.sort_by_key(|pk| pk.serialize());
        signers.dedup();
        let config = Self { threshold, signers };
        config.validate()?;
        Ok(config)
    }

    pub fn total_signers(&self) -> usize {
        self.signers.len()
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.signers.is_empty() {
            return Err(WalletError::ValidationError("Signers list cannot be empty".to_string()));
        }
        if self.signers.len() > MAX_SIGNERS {
            return Err(WalletError::ValidationError(format!(
                "At most {} signers are supported, got {}",
                MAX_SIGNERS,
                self.signers.len()
            )));
        }
        if self.threshold == 0 {
            return Err(WalletError::ValidationError("Threshold must be at least 1".to_string()));
        }
        if self.threshold as usize > self.signers.len() {
            return Err(WalletError::ValidationError(format!(
                "Threshold ({}) cannot exceed total signers ({})",
                self.threshold,
                self.signers.len()
            )));
        }
        Ok(())
    }

    pub fn is_authorized_signer(&self, pubkey: &PublicKey) -> bool {
        self.signers.iter().any(|s| s == pubkey)
    }

    /// OP_m <pk_1> ... <pk_n> OP_n OP_CHECKMULTISIG
    pub fn redeem_script(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(3 + self.signers.len() * 34);
        script.push(OP_1 - 1 + self.threshold);
        for signer in &self.signers {
            script.push(PUSH_33);
            script.extend_from_slice(&signer.serialize());
        }
        script.push(OP_1 - 1 + self.signers.len() as u8);
        script.push(OP_CHECKMULTISIG);
        script
    }

    pub fn from_redeem_script(script: &[u8]) -> Result<Self, WalletError> {
        let invalid = || WalletError::ValidationError("Not a multi-signature redeem script".to_string());
        if script.len() < 3 + 34 || script[script.len() - 1] != OP_CHECKMULTISIG {
            return Err(invalid());
        }
        let m = script[0];
        let n = script[script.len() - 2];
        if !(OP_1..=OP_16).contains(&m) || !(OP_1..=OP_16).contains(&n) {
            return Err(invalid());
        }
        let body = &script[1..script.len() - 2];
        if body.len() != (n - OP_1 + 1) as usize * 34 {
            return Err(invalid());
        }
        let signers = body
            .chunks(34)
            .map(|chunk| {
                if chunk[0] != PUSH_33 {
                    return Err(invalid());
                }
                PublicKey::from_slice(&chunk[1..]).map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(m - OP_1 + 1, signers)
    }
}
