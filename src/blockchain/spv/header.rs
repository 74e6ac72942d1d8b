//! Block headers, proof-of-work and difficulty retargeting.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::u256::U256;
use crate::core::config::ChainParams;
use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

/// 80-byte block header as relayed by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::hash(&self.to_bytes())
    }

    /// Hash, read as a little-endian number, must not exceed the target its
    /// bits declare, and that target must not exceed the chain's limit.
    pub fn check_proof_of_work(&self, pow_limit_bits: u32) -> Result<(), WalletError> {
        let target = U256::from_compact(self.bits).filter(|t| !t.is_zero()).ok_or_else(|| {
            WalletError::InvalidProofOfWork(format!("Malformed target bits {:#010x}", self.bits))
        })?;
        let limit = U256::from_compact(pow_limit_bits).unwrap_or(U256::MAX);
        if target > limit {
            return Err(WalletError::InvalidProofOfWork(format!(
                "Target {:#010x} easier than limit {:#010x}",
                self.bits, pow_limit_bits
            )));
        }
        let hash = self.hash();
        if U256::from_le_bytes(hash.as_bytes()) > target {
            return Err(WalletError::InvalidProofOfWork(format!(
                "Hash {} above target {:#010x}",
                hash, self.bits
            )));
        }
        Ok(())
    }

    pub fn work(&self) -> U256 {
        U256::from_compact(self.bits)
            .map(|t| U256::work_for_target(&t))
            .unwrap_or(U256::ZERO)
    }

    /// Grinds the nonce until the header meets its own target. Only practical
    /// against regtest-style limits.
    pub fn mine(&mut self) -> Result<(), WalletError> {
        let target = U256::from_compact(self.bits)
            .ok_or_else(|| WalletError::InvalidProofOfWork("Malformed target bits".to_string()))?;
        for nonce in 0..=u32::MAX {
            self.nonce = nonce;
            if U256::from_le_bytes(self.hash().as_bytes()) <= target {
                return Ok(());
            }
        }
        Err(WalletError::InvalidProofOfWork("Nonce space exhausted".to_string()))
    }
}

/// A header accepted into the local index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub hash: Hash256,
    pub previous_hash: Hash256,
    pub height: u32,
    pub timestamp: u32,
    pub merkle_root: Hash256,
    pub bits: u32,
    /// Cumulative work from the sync starting point up to and including this header.
    pub chain_work: U256,
}

impl HeaderRecord {
    pub fn from_header(header: &BlockHeader, height: u32, parent_work: &U256) -> Self {
        Self {
            hash: header.hash(),
            previous_hash: header.previous_hash,
            height,
            timestamp: header.timestamp,
            merkle_root: header.merkle_root,
            bits: header.bits,
            chain_work: parent_work.saturating_add(&header.work()),
        }
    }
}

/// Whether `height` starts a new difficulty period.
pub fn is_retarget_height(params: &ChainParams, height: u32) -> bool {
    height % params.retarget_interval == 0
}

/// Target for the first header of a new period, from the last header of the
/// previous period and the timestamp of its first header. The observed
/// timespan is clamped to [T/4, 4T] and the result capped at the chain limit.
pub fn retarget(params: &ChainParams, last: &HeaderRecord, first_timestamp: u32) -> u32 {
    let target_timespan = params.retarget_interval as u64 * params.target_spacing_secs as u64;
    let actual = (last.timestamp as i64 - first_timestamp as i64)
        .clamp((target_timespan / 4) as i64, (target_timespan * 4) as i64) as u64;

    let limit = U256::from_compact(params.pow_limit_bits).unwrap_or(U256::MAX);
    let last_target = U256::from_compact(last.bits).unwrap_or(limit);
    let next = last_target
        .mul_div_u64(actual, target_timespan)
        .unwrap_or(limit)
        .min(limit);

    debug!(
        "Retarget at {}: timespan {}s of {}s, bits {:#010x} -> {:#010x}",
        last.height + 1,
        actual,
        target_timespan,
        last.bits,
        next.to_compact()
    );
    next.to_compact()
}
