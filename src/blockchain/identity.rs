//! Signing identities derived from the wallet's root secret.
//!
//! Identities live under their own hardened purpose (`m/purpose'/index'`),
//! never under a purpose reserved for financial keys. A record is created
//! once per `(purpose, index)` and afterwards looked up, not re-derived.

use parking_lot::RwLock;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::blockchain::address::{identity_redeem_script, AddressKind, ProgramHash};
use crate::core::config::IdentityConfig;
use crate::core::errors::WalletError;
use crate::crypto::hd::ChainKeyDeriver;
use crate::crypto::signature::{parse_public_key, sign_message};
use crate::crypto::vault::KeyVault;

/// Persisted description of one identity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub purpose: u32,
    pub index: u32,
    pub public_key_hex: String,
}

pub struct IdentityAgent {
    vault: Arc<KeyVault>,
    config: IdentityConfig,
    records: RwLock<Vec<IdentityRecord>>,
}

impl IdentityAgent {
    pub fn new(vault: Arc<KeyVault>, config: IdentityConfig) -> Self {
        Self::with_records(vault, config, Vec::new())
    }

    /// Restores an agent from persisted records.
    pub fn with_records(vault: Arc<KeyVault>, config: IdentityConfig, records: Vec<IdentityRecord>) -> Self {
        Self { vault, config, records: RwLock::new(records) }
    }

    /// Identity at `index` under the default purpose.
    pub fn derive_identity(&self, index: u32, password: &str) -> Result<String, WalletError> {
        self.derive_identity_for_purpose(self.config.default_purpose, index, password)
    }

    /// Returns the existing id for `(purpose, index)` or derives and
    /// registers a new one. Reserved purposes are rejected.
    pub fn derive_identity_for_purpose(&self, purpose: u32, index: u32, password: &str) -> Result<String, WalletError> {
        if self.config.is_reserved(purpose) {
            warn!("Identity derivation under reserved purpose {} refused", purpose);
            return Err(WalletError::InvalidDerivation(format!(
                "Purpose {} is reserved for wallet keys",
                purpose
            )));
        }
        if let Some(id) = self.lookup(purpose, index) {
            return Ok(id);
        }

        let derived = self
            .vault
            .with_seed(password, |seed| ChainKeyDeriver::derive(seed, purpose, index, true))?
            .neuter();
        let record = IdentityRecord {
            identity_id: ProgramHash::identity(&derived.public_key).to_address(),
            purpose,
            index,
            public_key_hex: hex::encode(derived.public_key.serialize()),
        };

        let mut records = self.records.write();
        // another caller may have registered it while the vault was open
        if let Some(existing) = records.iter().find(|r| r.purpose == purpose && r.index == index) {
            return Ok(existing.identity_id.clone());
        }
        info!("Registered identity {} (purpose {}, index {})", record.identity_id, purpose, index);
        let id = record.identity_id.clone();
        records.push(record);
        Ok(id)
    }

    /// Signs `message` with the identity's key. The private key exists only
    /// for the duration of this call.
    pub fn sign(&self, identity_id: &str, message: &[u8], password: &str) -> Result<[u8; 64], WalletError> {
        let record = self.record(identity_id)?;
        let expected = parse_public_key(&record.public_key_hex)?;
        self.vault.with_seed(password, |seed| {
            let key = ChainKeyDeriver::derive(seed, record.purpose, record.index, true)?;
            if key.public_key != expected {
                return Err(WalletError::InternalError(format!(
                    "Identity {} no longer matches the vault's key",
                    identity_id
                )));
            }
            sign_message(&key.secret_key()?, message)
        })
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.records.read().iter().map(|r| r.identity_id.clone()).collect()
    }

    pub fn records(&self) -> Vec<IdentityRecord> {
        self.records.read().clone()
    }

    pub fn public_key(&self, identity_id: &str) -> Result<PublicKey, WalletError> {
        parse_public_key(&self.record(identity_id)?.public_key_hex)
    }

    /// Whether `identity_id` is a well-formed identity address. Registration
    /// with this agent is not required.
    pub fn is_id_valid(identity_id: &str) -> bool {
        ProgramHash::from_address(identity_id).map_or(false, |h| h.kind() == Some(AddressKind::Identity))
    }

    pub fn generate_redeem_script(&self, identity_id: &str) -> Result<Vec<u8>, WalletError> {
        Ok(identity_redeem_script(&self.public_key(identity_id)?))
    }

    fn lookup(&self, purpose: u32, index: u32) -> Option<String> {
        self.records
            .read()
            .iter()
            .find(|r| r.purpose == purpose && r.index == index)
            .map(|r| r.identity_id.clone())
    }

    fn record(&self, identity_id: &str) -> Result<IdentityRecord, WalletError> {
        self.records
            .read()
            .iter()
            .find(|r| r.identity_id == identity_id)
            .cloned()
            .ok_or_else(|| WalletError::UnknownIdentity(identity_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::KdfParams;
    use crate::crypto::signature::verify_message;
    use crate::security::secret::RootSecret;
    use test_case::test_case;

    const PASSWORD: &str = "identity-pass";

    fn agent() -> IdentityAgent {
        let root = RootSecret::new(vec![5u8; 16], "");
        let vault = KeyVault::create(&root, PASSWORD, &KdfParams::Scrypt { log_n: 4, r: 8, p: 1 }).unwrap();
        IdentityAgent::new(Arc::new(vault), IdentityConfig::default())
    }

    #[test]
    fn test_derive_identity_is_idempotent() {
        let agent = agent();
        let first = agent.derive_identity(0, PASSWORD).unwrap();
        let second = agent.derive_identity(0, PASSWORD).unwrap();
        assert_eq!(first, second);
        assert_eq!(agent.all_ids(), vec![first.clone()]);
        assert!(IdentityAgent::is_id_valid(&first));
    }

    #[test]
    fn test_known_identity_needs_no_password() {
        let agent = agent();
        let id = agent.derive_identity(3, PASSWORD).unwrap();
        assert_eq!(agent.derive_identity(3, "wrong").unwrap(), id);
        assert!(matches!(agent.derive_identity(4, "wrong"), Err(WalletError::Authentication(_))));
    }

    #[test_case(44 ; "bip44 purpose")]
    fn test_reserved_purpose_rejected(purpose: u32) {
        let agent = agent();
        assert!(matches!(
            agent.derive_identity_for_purpose(purpose, 0, PASSWORD),
            Err(WalletError::InvalidDerivation(_))
        ));
        assert!(agent.all_ids().is_empty());
    }

    #[test]
    fn test_purposes_give_distinct_identities() {
        let agent = agent();
        let a = agent.derive_identity_for_purpose(1, 0, PASSWORD).unwrap();
        let b = agent.derive_identity_for_purpose(2, 0, PASSWORD).unwrap();
        assert_ne!(a, b);
        assert_eq!(agent.records().len(), 2);
    }

    #[test]
    fn test_sign_and_verify() {
        let agent = agent();
        let id = agent.derive_identity(0, PASSWORD).unwrap();
        let signature = agent.sign(&id, b"did:payload", PASSWORD).unwrap();
        assert!(verify_message(&agent.public_key(&id).unwrap(), b"did:payload", &signature));

        let script = agent.generate_redeem_script(&id).unwrap();
        assert_eq!(ProgramHash::from_script(AddressKind::Identity, &script).to_address(), id);
    }

    #[test]
    fn test_sign_errors() {
        let agent = agent();
        let id = agent.derive_identity(0, PASSWORD).unwrap();
        assert!(matches!(agent.sign(&id, b"m", "nope"), Err(WalletError::Authentication(_))));
        assert!(matches!(agent.sign("not-registered", b"m", PASSWORD), Err(WalletError::UnknownIdentity(_))));
    }

    #[test]
    fn test_restored_records_sign() {
        let original = agent();
        let id = original.derive_identity(7, PASSWORD).unwrap();
        let restored = IdentityAgent::with_records(
            Arc::clone(&original.vault),
            IdentityConfig::default(),
            original.records(),
        );
        assert!(restored.sign(&id, b"again", PASSWORD).is_ok());
        assert!(!IdentityAgent::is_id_valid(&ProgramHash::destroy().to_address()));
    }
}
