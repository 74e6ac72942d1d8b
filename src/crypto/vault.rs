//! Sealed storage of the wallet root secret.
//!
//! The root secret lives at rest only as an AES-256-GCM ciphertext whose key
//! is stretched from the pay password (scrypt or Argon2id). Every unlock hands
//! out a value that zeroizes itself when dropped; nothing is cached across
//! calls.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::core::config::KdfParams;
use crate::core::errors::WalletError;
use crate::crypto::kdf::KeyDerivation;
use crate::security::secret::{RootSecret, SecretVec};

const SEAL_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const SEAL_AAD: &[u8] = b"SPV-WALLET-SEAL-V1";

/// Password-sealed ciphertext and everything needed to re-derive its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    pub version: u8,
    pub kdf: KdfParams,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Encrypts `secret` under a key stretched from `password`.
pub fn seal(secret: &[u8], password: &str, kdf: &KdfParams) -> Result<SealedBlob, WalletError> {
    if secret.is_empty() {
        return Err(WalletError::CryptoError("Refusing to seal an empty secret".to_string()));
    }
    if password.is_empty() {
        return Err(WalletError::CryptoError("Password cannot be empty".to_string()));
    }

    let salt = KeyDerivation::generate_salt(SALT_LEN);
    let key = KeyDerivation::new(kdf.clone()).derive_key(password.as_bytes(), &salt, KEY_LEN)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| WalletError::CryptoError("Invalid key length".to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: secret, aad: SEAL_AAD })
        .map_err(|_| WalletError::CryptoError("Encryption failed".to_string()))?;

    Ok(SealedBlob {
        version: SEAL_VERSION,
        kdf: kdf.clone(),
        salt,
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Decrypts a sealed blob. A wrong password and a corrupted blob are
/// indistinguishable and both surface as `Authentication`.
pub fn unseal(blob: &SealedBlob, password: &str) -> Result<SecretVec, WalletError> {
    if blob.version != SEAL_VERSION {
        return Err(WalletError::CryptoError(format!("Unsupported seal version {}", blob.version)));
    }
    if blob.nonce.len() != NONCE_LEN {
        return Err(WalletError::Authentication("Malformed sealed blob".to_string()));
    }

    let key = KeyDerivation::new(blob.kdf.clone()).derive_key(password.as_bytes(), &blob.salt, KEY_LEN)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| WalletError::CryptoError("Invalid key length".to_string()))?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&blob.nonce),
            Payload { msg: &blob.ciphertext, aad: SEAL_AAD },
        )
        .map_err(|_| WalletError::Authentication("Wrong password or corrupted data".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

/// Owner of the sealed root secret.
pub struct KeyVault {
    sealed: RwLock<SealedBlob>,
}

impl KeyVault {
    /// Seals a fresh root secret under `password`.
    pub fn create(root: &RootSecret, password: &str, kdf: &KdfParams) -> Result<Self, WalletError> {
        let bytes = root.to_bytes();
        let sealed = seal(&bytes, password, kdf)?;
        info!("Key vault sealed ({:?})", kdf);
        Ok(Self { sealed: RwLock::new(sealed) })
    }

    pub fn from_sealed(blob: SealedBlob) -> Self {
        Self { sealed: RwLock::new(blob) }
    }

    /// Current ciphertext, for persistence.
    pub fn sealed_blob(&self) -> SealedBlob {
        self.sealed.read().clone()
    }

    /// Decrypts the root secret. The caller owns it only for the current scope.
    pub fn unlock(&self, password: &str) -> Result<RootSecret, WalletError> {
        let blob = self.sealed.read().clone();
        let bytes = unseal(&blob, password)?;
        RootSecret::from_bytes(&bytes)
            .ok_or_else(|| WalletError::CryptoError("Sealed root secret is malformed".to_string()))
    }

    /// Runs `f` with the 64-byte BIP39 seed; the seed and the root secret are
    /// zeroized when this returns, whether `f` succeeded or not.
    pub fn with_seed<T>(
        &self,
        password: &str,
        f: impl FnOnce(&[u8]) -> Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        let root = self.unlock(password)?;
        let seed = seed_from_root(&root)?;
        debug!("Vault unlocked for one derivation scope");
        f(seed.as_slice())
    }

    /// Unlock on the blocking pool so KDF work never stalls event delivery.
    /// Dropping the returned future drops the secret as soon as the worker finishes.
    pub async fn unlock_async(self: &Arc<Self>, password: String) -> Result<RootSecret, WalletError> {
        let vault = Arc::clone(self);
        let password = Zeroizing::new(password);
        tokio::task::spawn_blocking(move || vault.unlock(&password))
            .await
            .map_err(|e| WalletError::InternalError(format!("Unlock task failed: {}", e)))?
    }

    pub fn verify_password(&self, password: &str) -> Result<(), WalletError> {
        self.unlock(password).map(|_| ())
    }

    /// Unseal with the old password and reseal under the new one. The stored
    /// blob is replaced only after the new ciphertext exists.
    pub fn rotate_password(&self, old_password: &str, new_password: &str) -> Result<(), WalletError> {
        let mut guard = self.sealed.write();
        let plaintext = unseal(&guard, old_password).map_err(|e| {
            warn!("Password rotation rejected: {}", e);
            e
        })?;
        let resealed = seal(&plaintext, new_password, &guard.kdf)?;
        *guard = resealed;
        info!("Key vault password rotated");
        Ok(())
    }
}

/// BIP39 seed from entropy + passphrase.
pub fn seed_from_root(root: &RootSecret) -> Result<Zeroizing<[u8; 64]>, WalletError> {
    let mnemonic = bip39::Mnemonic::from_entropy(root.entropy())
        .map_err(|e| WalletError::MnemonicError(format!("Invalid root entropy: {}", e)))?;
    Ok(Zeroizing::new(mnemonic.to_seed(root.passphrase())))
}

/// Mnemonic phrase for a root secret.
pub fn mnemonic_from_root(root: &RootSecret) -> Result<Zeroizing<String>, WalletError> {
    let mnemonic = bip39::Mnemonic::from_entropy(root.entropy())
        .map_err(|e| WalletError::MnemonicError(format!("Invalid root entropy: {}", e)))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}
