//! Multi-chain SPV wallet engine.
//!
//! One password-sealed root secret (`crypto::vault`) backs any number of
//! chain wallets (`blockchain::chain_wallet`), each synchronized against
//! untrusted peers by header and merkle-proof verification
//! (`blockchain::spv`, `network`). `core::WalletCoordinator` ties them
//! together; `blockchain::identity` signs application payloads with keys
//! kept apart from the financial ones.

#![allow(clippy::too_many_arguments)]

pub mod blockchain;
pub mod core;
pub mod crypto;
pub mod logging;
pub mod network;
pub mod security;
pub mod storage;

pub use crate::blockchain::chain_wallet::{ChainWallet, WalletEvent};
pub use crate::blockchain::identity::IdentityAgent;
pub use crate::core::errors::WalletError;
pub use crate::core::wallet_manager::WalletCoordinator;
