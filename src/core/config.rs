use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

/// Which family of chain a sub-wallet serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Main,
    Side,
    Identity,
}

/// Password-stretching parameters used by the key vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum KdfParams {
    Scrypt { log_n: u8, r: u32, p: u32 },
    Argon2id { m_cost_kib: u32, t_cost: u32, p_cost: u32 },
}

impl Default for KdfParams {
    fn default() -> Self {
        // N = 2^15 keeps unlock under a second on mobile-class hardware.
        KdfParams::Scrypt { log_n: 15, r: 8, p: 1 }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub kdf: KdfParams,

    /// Minimum accepted pay-password length
    #[serde(default = "SecurityConfig::default_min_password_len")]
    pub min_password_len: usize,
}

impl SecurityConfig {
    fn default_min_password_len() -> usize { 8 }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { kdf: KdfParams::default(), min_password_len: Self::default_min_password_len() }
    }
}

/// Peer pool and synchronization tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "SyncConfig::default_max_peers")]
    pub max_peers: usize,

    /// A peer that does not answer a ping within this many seconds is dropped
    #[serde(default = "SyncConfig::default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Reconnection penalty for misbehaving peers
    #[serde(default = "SyncConfig::default_misbehavior_backoff_secs")]
    pub misbehavior_backoff_secs: u64,

    #[serde(default = "SyncConfig::default_misbehavior_threshold")]
    pub misbehavior_threshold: u32,

    /// Maximum headers requested per round trip
    #[serde(default = "SyncConfig::default_header_batch")]
    pub header_batch: usize,
}

impl SyncConfig {
    fn default_max_peers() -> usize { 3 }
    fn default_ping_timeout_secs() -> u64 { 30 }
    fn default_misbehavior_backoff_secs() -> u64 { 600 }
    fn default_misbehavior_threshold() -> u32 { 100 }
    fn default_header_batch() -> usize { 2000 }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_peers: Self::default_max_peers(),
            ping_timeout_secs: Self::default_ping_timeout_secs(),
            misbehavior_backoff_secs: Self::default_misbehavior_backoff_secs(),
            misbehavior_threshold: Self::default_misbehavior_threshold(),
            header_batch: Self::default_header_batch(),
        }
    }
}

/// Identity agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "IdentityConfig::default_purpose")]
    pub default_purpose: u32,

    /// Purposes owned by financial key namespaces; never usable for identities.
    #[serde(default = "IdentityConfig::default_reserved_purposes")]
    pub reserved_purposes: Vec<u32>,
}

impl IdentityConfig {
    fn default_purpose() -> u32 { 1 }
    fn default_reserved_purposes() -> Vec<u32> { vec![44] }

    pub fn is_reserved(&self, purpose: u32) -> bool {
        self.reserved_purposes.contains(&purpose)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            default_purpose: Self::default_purpose(),
            reserved_purposes: Self::default_reserved_purposes(),
        }
    }
}

/// A trusted header the engine may start syncing from. Its height must open
/// a retarget period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    /// Block hash, hex in display (reversed) byte order
    pub hash: Hash256,
    pub timestamp: u32,
    pub bits: u32,
}

/// Consensus and wallet parameters of one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    pub chain_id: String,
    pub kind: ChainKind,
    /// BIP44 coin type used for the account path m/44'/coin_type'/0'
    pub coin_type: u32,
    #[serde(default)]
    pub seed_peers: Vec<String>,
    #[serde(default = "ChainParams::default_retarget_interval")]
    pub retarget_interval: u32,
    #[serde(default = "ChainParams::default_target_spacing_secs")]
    pub target_spacing_secs: u32,
    #[serde(default = "ChainParams::default_pow_limit_bits")]
    pub pow_limit_bits: u32,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default = "ChainParams::default_confirmation_threshold")]
    pub confirmation_threshold: u32,
    /// Confirmed transactions deeper than this leave active tracking
    #[serde(default = "ChainParams::default_finality_depth")]
    pub finality_depth: u32,
    #[serde(default = "ChainParams::default_fee_per_kb")]
    pub default_fee_per_kb: u64,
}

impl ChainParams {
    fn default_retarget_interval() -> u32 { 2016 }
    fn default_target_spacing_secs() -> u32 { 120 }
    fn default_pow_limit_bits() -> u32 { 0x1d00ffff }
    fn default_confirmation_threshold() -> u32 { 6 }
    fn default_finality_depth() -> u32 { 100 }
    fn default_fee_per_kb() -> u64 { 10_000 }

    pub fn new(chain_id: &str, kind: ChainKind, coin_type: u32) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            kind,
            coin_type,
            seed_peers: Vec::new(),
            retarget_interval: Self::default_retarget_interval(),
            target_spacing_secs: Self::default_target_spacing_secs(),
            pow_limit_bits: Self::default_pow_limit_bits(),
            checkpoints: Vec::new(),
            confirmation_threshold: Self::default_confirmation_threshold(),
            finality_depth: Self::default_finality_depth(),
            default_fee_per_kb: Self::default_fee_per_kb(),
        }
    }

    /// Low-difficulty parameters for local networks and tests: trivially
    /// minable targets, short retarget interval, three confirmations.
    pub fn regtest(chain_id: &str, kind: ChainKind) -> Self {
        Self {
            retarget_interval: 10,
            target_spacing_secs: 60,
            pow_limit_bits: 0x207fffff,
            confirmation_threshold: 3,
            finality_depth: 20,
            ..Self::new(chain_id, kind, 1)
        }
    }

    /// Latest checkpoint not newer than `earliest_time`, falling back to the oldest.
    pub fn start_checkpoint(&self, earliest_time: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|c| c.timestamp <= earliest_time)
            .max_by_key(|c| c.height)
            .or_else(|| self.checkpoints.iter().min_by_key(|c| c.height))
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.height == height)
    }

    /// Checkpoints must open a difficulty period so the engine can check
    /// the first retarget after its anchor.
    pub fn check_checkpoint_alignment(&self, checkpoint: &Checkpoint) -> Result<(), WalletError> {
        if self.retarget_interval == 0 || checkpoint.height % self.retarget_interval != 0 {
            return Err(WalletError::ConfigError(format!(
                "{}: checkpoint at {} is not on a retarget boundary of {}",
                self.chain_id, checkpoint.height, self.retarget_interval
            )));
        }
        Ok(())
    }

    /// Highest checkpoint already reached by a chain at `tip_height`;
    /// reorganizations may not fork below it.
    pub fn checkpoint_floor(&self, tip_height: u32) -> u32 {
        self.checkpoints
            .iter()
            .map(|c| c.height)
            .filter(|h| *h <= tip_height)
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.chain_id.is_empty() {
            return Err(WalletError::ConfigError("chain_id cannot be empty".into()));
        }
        if self.retarget_interval == 0 || self.target_spacing_secs == 0 {
            return Err(WalletError::ConfigError(format!(
                "{}: retarget interval and spacing must be positive",
                self.chain_id
            )));
        }
        if self.confirmation_threshold == 0 {
            return Err(WalletError::ConfigError(format!(
                "{}: confirmation threshold must be at least 1",
                self.chain_id
            )));
        }
        if self.finality_depth < self.confirmation_threshold {
            return Err(WalletError::ConfigError(format!(
                "{}: finality depth {} below confirmation threshold {}",
                self.chain_id, self.finality_depth, self.confirmation_threshold
            )));
        }
        for checkpoint in &self.checkpoints {
            self.check_checkpoint_alignment(checkpoint)?;
        }
        Ok(())
    }
}

/// wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default = "WalletConfig::default_chains")]
    pub chains: HashMap<String, ChainParams>,
}

impl WalletConfig {
    fn default_chains() -> HashMap<String, ChainParams> {
        let mut chains = HashMap::with_capacity(3);
        chains.insert("ELA".to_string(), ChainParams::new("ELA", ChainKind::Main, 0));
        chains.insert("IdChain".to_string(), ChainParams::new("IdChain", ChainKind::Identity, 0));
        chains.insert("TokenChain".to_string(), ChainParams::new("TokenChain", ChainKind::Side, 0));
        chains
    }

    pub fn from_toml_str(content: &str) -> Result<Self, WalletError> {
        let config: WalletConfig = toml::from_str(content)?;
        for params in config.chains.values() {
            params.validate()?;
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WalletError::ConfigError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn chain(&self, chain_id: &str) -> Result<&ChainParams, WalletError> {
        self.chains
            .get(chain_id)
            .ok_or_else(|| WalletError::ConfigError(format!("Unknown chain: {}", chain_id)))
    }

    pub fn with_chain(mut self, params: ChainParams) -> Self {
        self.chains.insert(params.chain_id.clone(), params);
        self
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            security: SecurityConfig::default(),
            sync: SyncConfig::default(),
            identity: IdentityConfig::default(),
            chains: Self::default_chains(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WalletConfig::default();
        assert_eq!(config.sync.max_peers, 3);
        assert_eq!(config.identity.reserved_purposes, vec![44]);
        assert!(config.identity.is_reserved(44));
        assert_eq!(config.chain("ELA").unwrap().kind, ChainKind::Main);
        assert!(config.chain("nope").is_err());
    }

    #[test]
    fn test_toml_overrides_and_defaults() {
        let content = r#"
            [sync]
            max_peers = 5

            [security.kdf]
            algorithm = "argon2id"
            m_cost_kib = 1024
            t_cost = 1
            p_cost = 1

            [chains.ELA]
            chain_id = "ELA"
            kind = "main"
            coin_type = 0
            seed_peers = ["node-1.example:20866"]

            [[chains.ELA.checkpoints]]
            height = 2016
            hash = "00000000000000A1B2C3D4E5F60718293A4B5C6D7E8F90A1B2C3D4E5F6071829"
            timestamp = 1500000000
            bits = 486604799
        "#;
        let config = WalletConfig::from_toml_str(content).unwrap();
        assert_eq!(config.sync.max_peers, 5);
        assert_eq!(config.sync.ping_timeout_secs, 30);
        assert_eq!(
            config.security.kdf,
            KdfParams::Argon2id { m_cost_kib: 1024, t_cost: 1, p_cost: 1 }
        );
        let ela = config.chain("ELA").unwrap();
        assert_eq!(ela.retarget_interval, 2016);
        assert_eq!(ela.checkpoint_floor(5000), 2016);
        assert_eq!(ela.checkpoint_floor(100), 0);
        assert_eq!(ela.seed_peers.len(), 1);
        assert_eq!(
            ela.checkpoint_at(2016).unwrap().hash,
            "00000000000000a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f6071829".parse().unwrap()
        );
    }

    #[test]
    fn test_malformed_checkpoint_hash_rejected() {
        let content = r#"
            [chains.ELA]
            chain_id = "ELA"
            kind = "main"
            coin_type = 0

            [[chains.ELA.checkpoints]]
            height = 2016
            hash = "00"
            timestamp = 1500000000
            bits = 486604799
        "#;
        assert!(WalletConfig::from_toml_str(content).is_err());
    }

    #[test]
    fn test_unaligned_checkpoint_rejected() {
        let mut params = ChainParams::regtest("T", ChainKind::Main);
        params.checkpoints.push(Checkpoint { height: 20, hash: Hash256::ZERO, timestamp: 100, bits: 0x207fffff });
        assert!(params.validate().is_ok());
        params.checkpoints.push(Checkpoint { height: 25, hash: Hash256::ZERO, timestamp: 200, bits: 0x207fffff });
        assert!(matches!(params.validate(), Err(WalletError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_chain_rejected() {
        let content = r#"
            [chains.BAD]
            chain_id = "BAD"
            kind = "side"
            coin_type = 0
            confirmation_threshold = 0
        "#;
        assert!(matches!(WalletConfig::from_toml_str(content), Err(WalletError::ConfigError(_))));
    }

    #[test]
    fn test_start_checkpoint_selection() {
        let mut params = ChainParams::regtest("T", ChainKind::Main);
        params.checkpoints = vec![
            Checkpoint { height: 0, hash: Hash256([1; 32]), timestamp: 100, bits: 0x207fffff },
            Checkpoint { height: 10, hash: Hash256([2; 32]), timestamp: 200, bits: 0x207fffff },
        ];
        assert_eq!(params.start_checkpoint(150).unwrap().height, 0);
        assert_eq!(params.start_checkpoint(250).unwrap().height, 10);
        assert_eq!(params.start_checkpoint(50).unwrap().height, 0);
    }
}
