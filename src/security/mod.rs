// src/security/mod.rs
//! Security-related functionality for the wallet
//!
//! Secret buffers that are zeroized when dropped.

pub mod secret;

pub use secret::{RootSecret, SecretVec};
