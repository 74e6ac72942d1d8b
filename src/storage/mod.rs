//! Persistence collaborators.

pub mod keystore;

pub use keystore::{FileKeystore, KeystoreDocument, KeystoreFile, KEYSTORE_VERSION};
