//! Threshold (m-of-n) signature accounts.
//!
//! - `config` - signer set, threshold and redeem script
//! - `signing` - signature collection and validation

pub mod config;
pub mod signing;

pub use config::MultiSigConfig;
pub use signing::{CollectedSignature, SignatureCollector};
