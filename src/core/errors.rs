use std::fmt;

/// Custom error type for wallet operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Wrong password or a sealed blob whose authentication tag does not verify.
    Authentication(String),
    /// Encryption/decryption or key-stretching failures.
    CryptoError(String),
    /// A derived child key was zero or not below the curve order.
    InvalidDerivation(String),
    /// Header hash does not satisfy its target, or the target is not the expected one.
    InvalidProofOfWork(String),
    /// Header does not link to the tip or any known ancestor.
    DiscontinuousChain(String),
    /// Merkle proof does not authenticate the matched transactions.
    InvalidMerkleProof(String),
    /// Competing branch forks below the checkpoint; a rescan is recommended.
    ReorgTooDeep(String),
    /// Available outputs cannot cover amount plus fee.
    InsufficientFunds(String),
    /// Cross-chain payload amounts exceed the value-bearing outputs.
    PayloadMismatch(String),
    /// Identity id is not registered with the agent.
    UnknownIdentity(String),
    /// Every peer rejected (or none accepted) a published transaction.
    BroadcastFailed(String),
    /// Configuration-related errors.
    ConfigError(String),
    /// Validation errors.
    ValidationError(String),
    /// Invalid address errors.
    InvalidAddress(String),
    /// Mnemonic generation/parsing errors.
    MnemonicError(String),
    /// Serialization/deserialization errors.
    SerializationError(String),
    /// Storage-related errors.
    StorageError(String),
    /// Resource not found errors.
    NotFoundError(String),
    /// Network errors.
    NetworkError(String),
    /// Timeout errors.
    TimeoutError(String),
    /// Internal errors.
    InternalError(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            WalletError::CryptoError(msg) => write!(f, "Crypto error: {}", msg),
            WalletError::InvalidDerivation(msg) => write!(f, "Invalid derivation: {}", msg),
            WalletError::InvalidProofOfWork(msg) => write!(f, "Invalid proof of work: {}", msg),
            WalletError::DiscontinuousChain(msg) => write!(f, "Discontinuous chain: {}", msg),
            WalletError::InvalidMerkleProof(msg) => write!(f, "Invalid merkle proof: {}", msg),
            WalletError::ReorgTooDeep(msg) => write!(f, "Reorganization too deep: {}", msg),
            WalletError::InsufficientFunds(msg) => write!(f, "Insufficient funds: {}", msg),
            WalletError::PayloadMismatch(msg) => write!(f, "Payload mismatch: {}", msg),
            WalletError::UnknownIdentity(msg) => write!(f, "Unknown identity: {}", msg),
            WalletError::BroadcastFailed(msg) => write!(f, "Broadcast failed: {}", msg),
            WalletError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            WalletError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            WalletError::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            WalletError::MnemonicError(msg) => write!(f, "Mnemonic error: {}", msg),
            WalletError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            WalletError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            WalletError::NotFoundError(msg) => write!(f, "Not found: {}", msg),
            WalletError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            WalletError::TimeoutError(msg) => write!(f, "Timeout error: {}", msg),
            WalletError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

impl WalletError {
    /// Errors that must reach the caller and are never retried automatically.
    pub fn is_critical(&self) -> bool {
        matches!(self, WalletError::Authentication(_) | WalletError::CryptoError(_))
    }

    /// Errors recovered locally by replacing the peer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::NetworkError(_) | WalletError::TimeoutError(_))
    }

    /// Errors caused by data a peer sent; the peer gets disconnected.
    pub fn is_peer_misbehavior(&self) -> bool {
        matches!(
            self,
            WalletError::InvalidProofOfWork(_)
                | WalletError::DiscontinuousChain(_)
                | WalletError::InvalidMerkleProof(_)
        )
    }

    /// The caller should rescan from a checkpoint.
    pub fn recommends_rescan(&self) -> bool {
        matches!(self, WalletError::ReorgTooDeep(_))
    }
}

impl From<anyhow::Error> for WalletError {
    fn from(err: anyhow::Error) -> Self {
        WalletError::InternalError(err.to_string())
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        WalletError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        WalletError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for WalletError {
    fn from(err: toml::de::Error) -> Self {
        WalletError::ConfigError(err.to_string())
    }
}

impl From<secp256k1::Error> for WalletError {
    fn from(err: secp256k1::Error) -> Self {
        WalletError::CryptoError(err.to_string())
    }
}
