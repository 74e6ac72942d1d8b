//! Chain-level wallet logic: addresses, transactions, coin selection,
//! per-chain wallets, identities and the SPV layer.

pub mod address;
pub mod chain_wallet;
pub mod identity;
pub mod spv;
pub mod transaction;
pub mod utxo;

pub use address::{AddressKind, ProgramHash};
pub use chain_wallet::{ChainWallet, ChainWalletKind, PendingTransaction, TxDirection, TxStatus, WalletEvent};
pub use identity::{IdentityAgent, IdentityRecord};
pub use transaction::{Payload, Transaction, TxType};
pub use utxo::{Utxo, UtxoSelector};
