//! Small helpers and aliases for secret buffers that must be zeroized on drop.
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Common alias for secret byte buffers which will be zeroed when dropped.
pub type SecretVec = Zeroizing<Vec<u8>>;

/// Convert a Vec<u8> into a `SecretVec` which will be zeroized on drop.
pub fn vec_to_secret(v: Vec<u8>) -> SecretVec {
    Zeroizing::new(v)
}

/// Root entropy plus the optional mnemonic passphrase.
///
/// Only ever materialized inside a vault unlock scope. Memory is overwritten
/// when the value is dropped, on every exit path.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootSecret {
    entropy: Vec<u8>,
    passphrase: String,
}

impl RootSecret {
    pub fn new(entropy: Vec<u8>, passphrase: &str) -> Self {
        Self { entropy, passphrase: passphrase.to_string() }
    }

    pub fn entropy(&self) -> &[u8] {
        &self.entropy
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// Wire layout: u16 entropy length (BE) || entropy || passphrase bytes.
    pub fn to_bytes(&self) -> SecretVec {
        let mut out = Vec::with_capacity(2 + self.entropy.len() + self.passphrase.len());
        out.extend_from_slice(&(self.entropy.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.entropy);
        out.extend_from_slice(self.passphrase.as_bytes());
        Zeroizing::new(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let entropy = bytes.get(2..2 + len)?.to_vec();
        let passphrase = match std::str::from_utf8(&bytes[2 + len..]) {
            Ok(s) => s.to_string(),
            Err(_) => {
                let mut entropy = entropy;
                entropy.zeroize();
                return None;
            }
        };
        Some(Self { entropy, passphrase })
    }
}

impl fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootSecret([REDACTED])")
    }
}
