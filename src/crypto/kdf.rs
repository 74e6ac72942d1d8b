use argon2::{Algorithm, Argon2, Params as Argon2Params, Version};
use rand::RngCore;
use scrypt::Params;
use tracing::debug;
use zeroize::Zeroizing;

use crate::core::config::KdfParams;
use crate::core::errors::WalletError;

/// Password stretching for the key vault.
pub struct KeyDerivation {
    params: KdfParams,
}

impl KeyDerivation {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn scrypt(log_n: u8, r: u32, p: u32) -> Self {
        Self::new(KdfParams::Scrypt { log_n, r, p })
    }

    pub fn argon2id(m_cost_kib: u32, t_cost: u32, p_cost: u32) -> Self {
        Self::new(KdfParams::Argon2id { m_cost_kib, t_cost, p_cost })
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    pub fn derive_key(
        &self,
        password: &[u8],
        salt: &[u8],
        key_length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        debug!("Deriving key with length {} bytes", key_length);

        match &self.params {
            KdfParams::Scrypt { log_n, r, p } => {
                self.derive_scrypt(password, salt, *log_n, *r, *p, key_length)
            }
            KdfParams::Argon2id { m_cost_kib, t_cost, p_cost } => {
                self.derive_argon2(password, salt, *m_cost_kib, *t_cost, *p_cost, key_length)
            }
        }
    }

    fn derive_scrypt(
        &self,
        password: &[u8],
        salt: &[u8],
        log_n: u8,
        r: u32,
        p: u32,
        key_length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        debug!("Using Scrypt with parameters log_n={}, r={}, p={}", log_n, r, p);

        let params = Params::new(log_n, r, p, key_length)
            .map_err(|e| WalletError::CryptoError(format!("Invalid Scrypt parameters: {}", e)))?;

        let mut key = Zeroizing::new(vec![0u8; key_length]);
        scrypt::scrypt(password, salt, &params, &mut key)
            .map_err(|e| WalletError::CryptoError(format!("Scrypt derivation failed: {}", e)))?;
        Ok(key)
    }

    fn derive_argon2(
        &self,
        password: &[u8],
        salt: &[u8],
        m_cost_kib: u32,
        t_cost: u32,
        p_cost: u32,
        key_length: usize,
    ) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        debug!("Using Argon2id with m={} KiB, t={}, p={}", m_cost_kib, t_cost, p_cost);

        let params = Argon2Params::new(m_cost_kib, t_cost, p_cost, Some(key_length))
            .map_err(|e| WalletError::CryptoError(format!("Invalid Argon2 parameters: {}", e)))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new(vec![0u8; key_length]);
        argon
            .hash_password_into(password, salt, &mut key)
            .map_err(|e| WalletError::CryptoError(format!("Argon2 derivation failed: {}", e)))?;
        Ok(key)
    }

    pub fn generate_salt(length: usize) -> Vec<u8> {
        let mut salt = vec![0u8; length];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    }
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self::new(KdfParams::default())
    }
}
