pub mod hash;
pub mod hd;
pub mod kdf;
pub mod multisig;
pub mod signature;
pub mod vault;

pub use self::hd::{ChainKeyDeriver, DerivedKey, ExtendedPrivateKey, ExtendedPublicKey, HARDENED};
pub use self::kdf::KeyDerivation;
pub use self::multisig::MultiSigConfig;
pub use self::vault::{KeyVault, SealedBlob};
