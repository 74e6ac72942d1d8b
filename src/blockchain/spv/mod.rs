//! Simplified payment verification: headers, proof-of-work and merkle proofs.

pub mod header;
pub mod merkle;
pub mod sync_engine;
pub mod u256;

pub use header::{BlockHeader, HeaderRecord};
pub use merkle::MerkleProof;
pub use sync_engine::{ChainSyncEngine, HeaderOutcome, SyncEvent, SyncState};
pub use u256::U256;
