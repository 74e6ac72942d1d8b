//! BIP32 hierarchical deterministic key derivation.
//!
//! Output is bit-identical to the reference algorithm so that addresses match
//! other wallets holding the same seed.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::warn;
use zeroize::Zeroizing;

use crate::core::errors::WalletError;

type HmacSha512 = Hmac<Sha512>;

/// Bit marking a hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

/// BIP44 purpose of financial keys.
pub const BIP44_PURPOSE: u32 = 44;

/// Derivation attempts before giving up on a run of invalid children.
const MAX_INDEX_RETRIES: u32 = 16;

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<[u8; 64]>, WalletError> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| WalletError::CryptoError(format!("HMAC initialization failed: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn split_i(i: &[u8; 64]) -> (Zeroizing<[u8; 32]>, [u8; 32]) {
    let mut il = Zeroizing::new([0u8; 32]);
    il.copy_from_slice(&i[..32]);
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&i[32..]);
    (il, chain_code)
}

/// Extended private key: secret scalar plus chain code.
pub struct ExtendedPrivateKey {
    key: Zeroizing<[u8; 32]>,
    chain_code: [u8; 32],
    depth: u8,
}

impl ExtendedPrivateKey {
    /// Master key from a BIP39 seed: HMAC-SHA512("Bitcoin seed", seed).
    pub fn from_seed(seed: &[u8]) -> Result<Self, WalletError> {
        if seed.len() < 16 || seed.len() > 64 {
            return Err(WalletError::InvalidDerivation(format!(
                "Seed length must be 16..=64 bytes, got {}",
                seed.len()
            )));
        }
        let i = hmac_sha512(b"Bitcoin seed", &[seed])?;
        let (il, chain_code) = split_i(&i);
        SecretKey::from_slice(il.as_ref())
            .map_err(|_| WalletError::InvalidDerivation("Master key out of range".to_string()))?;
        Ok(Self { key: il, chain_code, depth: 0 })
    }

    /// CKDpriv. Fails with `InvalidDerivation` when IL ≥ n or the child key is zero.
    pub fn derive_child(&self, index: u32) -> Result<Self, WalletError> {
        let secp = Secp256k1::signing_only();
        let parent = self.secret_key()?;

        let index_bytes = index.to_be_bytes();
        let i = if index & HARDENED != 0 {
            hmac_sha512(&self.chain_code, &[&[0u8], self.key.as_ref(), &index_bytes])?
        } else {
            let public = PublicKey::from_secret_key(&secp, &parent).serialize();
            hmac_sha512(&self.chain_code, &[&public, &index_bytes])?
        };
        let (il, chain_code) = split_i(&i);

        let tweak = Scalar::from_be_bytes(*il)
            .map_err(|_| WalletError::InvalidDerivation(format!("IL not below curve order at index {}", index)))?;
        let child = parent
            .add_tweak(&tweak)
            .map_err(|_| WalletError::InvalidDerivation(format!("Zero child key at index {}", index)))?;

        Ok(Self {
            key: Zeroizing::new(child.secret_bytes()),
            chain_code,
            depth: self.depth.saturating_add(1),
        })
    }

    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut current = Self { key: self.key.clone(), chain_code: self.chain_code, depth: self.depth };
        for index in path {
            current = current.derive_child(*index)?;
        }
        Ok(current)
    }

    pub fn secret_key(&self) -> Result<SecretKey, WalletError> {
        SecretKey::from_slice(self.key.as_ref())
            .map_err(|e| WalletError::CryptoError(format!("Invalid private key: {}", e)))
    }

    pub fn private_key(&self) -> &[u8] {
        self.key.as_ref()
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn public_key(&self) -> Result<PublicKey, WalletError> {
        let secp = Secp256k1::signing_only();
        Ok(PublicKey::from_secret_key(&secp, &self.secret_key()?))
    }

    pub fn to_extended_public(&self) -> Result<ExtendedPublicKey, WalletError> {
        Ok(ExtendedPublicKey {
            public_key: self.public_key()?,
            chain_code: self.chain_code,
            depth: self.depth,
        })
    }
}

/// Extended public key. Only non-hardened children can be derived from it,
/// which is what lets a wallet hand out receive addresses without a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPublicKey {
    pub public_key: PublicKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
}

impl ExtendedPublicKey {
    /// CKDpub.
    pub fn derive_child(&self, index: u32) -> Result<Self, WalletError> {
        if index & HARDENED != 0 {
            return Err(WalletError::ValidationError(
                "Hardened child cannot be derived from a public key".to_string(),
            ));
        }
        let secp = Secp256k1::verification_only();
        let i = hmac_sha512(&self.chain_code, &[&self.public_key.serialize(), &index.to_be_bytes()])?;
        let (il, chain_code) = split_i(&i);

        let tweak = Scalar::from_be_bytes(*il)
            .map_err(|_| WalletError::InvalidDerivation(format!("IL not below curve order at index {}", index)))?;
        let public_key = self
            .public_key
            .add_exp_tweak(&secp, &tweak)
            .map_err(|_| WalletError::InvalidDerivation(format!("Point at infinity at index {}", index)))?;

        Ok(Self { public_key, chain_code, depth: self.depth.saturating_add(1) })
    }

    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut current = self.clone();
        for index in path {
            current = current.derive_child(*index)?;
        }
        Ok(current)
    }
}

/// One derived keypair.
pub struct DerivedKey {
    pub purpose: u32,
    /// Index actually used; may be above the requested one if a child was invalid.
    pub index: u32,
    pub public_key: PublicKey,
    pub private_key: Option<Zeroizing<[u8; 32]>>,
    pub chain_code: [u8; 32],
}

impl DerivedKey {
    pub fn secret_key(&self) -> Result<SecretKey, WalletError> {
        let bytes = self
            .private_key
            .as_ref()
            .ok_or_else(|| WalletError::ValidationError("Derived key holds no private part".to_string()))?;
        SecretKey::from_slice(bytes.as_ref())
            .map_err(|e| WalletError::CryptoError(format!("Invalid private key: {}", e)))
    }

    /// Drops the private half, keeping only what may be persisted.
    pub fn neuter(mut self) -> Self {
        self.private_key = None;
        self
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("purpose", &self.purpose)
            .field("index", &self.index)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Stateless mapping from (seed, purpose, index) to keys.
pub struct ChainKeyDeriver;

impl ChainKeyDeriver {
    /// Derives m/purpose'/index (index hardened on request). An invalid child
    /// is skipped in favour of index+1.
    pub fn derive(seed: &[u8], purpose: u32, index: u32, hardened: bool) -> Result<DerivedKey, WalletError> {
        let master = ExtendedPrivateKey::from_seed(seed)?;
        let purpose_key = master.derive_child(purpose | HARDENED)?;
        let (used, child) = Self::child_with_retry(index, |i| {
            purpose_key.derive_child(if hardened { i | HARDENED } else { i })
        })?;
        Ok(DerivedKey {
            purpose,
            index: used,
            public_key: child.public_key()?,
            private_key: Some(child.key.clone()),
            chain_code: child.chain_code,
        })
    }

    /// Master key followed by `path`.
    pub fn derive_path(seed: &[u8], path: &[u32]) -> Result<ExtendedPrivateKey, WalletError> {
        ExtendedPrivateKey::from_seed(seed)?.derive_path(path)
    }

    /// Account path m/44'/coin_type'/account'.
    pub fn account_path(coin_type: u32, account: u32) -> [u32; 3] {
        [BIP44_PURPOSE | HARDENED, coin_type | HARDENED, account | HARDENED]
    }

    /// Public account key from which receive/change addresses are derived.
    pub fn account_public(seed: &[u8], coin_type: u32) -> Result<ExtendedPublicKey, WalletError> {
        Self::derive_path(seed, &Self::account_path(coin_type, 0))?.to_extended_public()
    }

    /// Private key of m/44'/coin_type'/0'/branch/index.
    pub fn address_private(seed: &[u8], coin_type: u32, branch: u32, index: u32) -> Result<ExtendedPrivateKey, WalletError> {
        let account = Self::derive_path(seed, &Self::account_path(coin_type, 0))?;
        account.derive_path(&[branch, index])
    }

    /// Public key of `account/branch/index`, or the next valid index after it.
    pub fn address_public(account: &ExtendedPublicKey, branch: u32, index: u32) -> Result<(u32, PublicKey), WalletError> {
        let branch_key = account.derive_child(branch)?;
        let (used, child) = Self::child_with_retry(index, |i| branch_key.derive_child(i))?;
        Ok((used, child.public_key))
    }

    fn child_with_retry<K>(
        index: u32,
        mut derive: impl FnMut(u32) -> Result<K, WalletError>,
    ) -> Result<(u32, K), WalletError> {
        let mut candidate = index & !HARDENED;
        for _ in 0..MAX_INDEX_RETRIES {
            match derive(candidate) {
                Ok(key) => return Ok((candidate, key)),
                Err(WalletError::InvalidDerivation(msg)) => {
                    warn!("Skipping invalid child {}: {}", candidate, msg);
                    candidate = candidate
                        .checked_add(1)
                        .filter(|c| c & HARDENED == 0)
                        .ok_or_else(|| WalletError::InvalidDerivation("Child index space exhausted".to_string()))?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(WalletError::InvalidDerivation(format!("No valid child near index {}", index)))
    }
}
