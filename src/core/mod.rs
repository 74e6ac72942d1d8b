pub mod config;
pub mod errors;
pub mod wallet_info;
pub mod wallet_manager;

pub use config::{ChainKind, ChainParams, WalletConfig};
pub use errors::WalletError;
pub use wallet_info::{ChainWalletInfo, WalletSnapshot};
pub use wallet_manager::WalletCoordinator;
