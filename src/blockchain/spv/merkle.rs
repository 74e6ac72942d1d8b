//! Partial merkle trees: proof that a set of transactions is committed to by a
//! header's merkle root without downloading the block.

use serde::{Deserialize, Serialize};

use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;

/// Upper bound on transactions per block accepted in a proof.
const MAX_TRANSACTIONS: u32 = 1_000_000;

fn combine(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash256::hash(&data)
}

/// Merkle root of a full transaction list.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }
    let mut level = txids.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| combine(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    level[0]
}

/// Depth-first pruned tree: one flag bit per visited node (LSB first) and
/// the hashes of every pruned subtree or matched leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub total_transactions: u32,
    pub hashes: Vec<Hash256>,
    #[serde(with = "hex")]
    pub flags: Vec<u8>,
}

impl MerkleProof {
    /// Builds a proof for the leaves where `matches[i]` is set.
    pub fn build(txids: &[Hash256], matches: &[bool]) -> Self {
        let mut builder = Builder { txids, matches, bits: Vec::new(), hashes: Vec::new() };
        let height = tree_height(txids.len() as u32);
        builder.traverse(height, 0);

        let mut flags = vec![0u8; builder.bits.len().div_ceil(8)];
        for (i, bit) in builder.bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }
        Self { total_transactions: txids.len() as u32, hashes: builder.hashes, flags }
    }

    /// Recomputes the root and collects matched leaves with their positions.
    pub fn extract_matches(&self) -> Result<(Hash256, Vec<(Hash256, u32)>), WalletError> {
        let n = self.total_transactions;
        if n == 0 || n > MAX_TRANSACTIONS {
            return Err(invalid(format!("Bad transaction count {}", n)));
        }
        if self.hashes.len() as u32 > n {
            return Err(invalid("More hashes than transactions".to_string()));
        }
        if self.flags.len() * 8 < self.hashes.len() {
            return Err(invalid("Fewer flag bits than hashes".to_string()));
        }

        let mut extractor = Extractor { proof: self, bits_used: 0, hashes_used: 0, matches: Vec::new() };
        let root = extractor.traverse(tree_height(n), 0)?;

        if extractor.bits_used.div_ceil(8) != self.flags.len() {
            return Err(invalid("Unused flag bytes".to_string()));
        }
        if extractor.hashes_used != self.hashes.len() {
            return Err(invalid("Unused hashes".to_string()));
        }
        Ok((root, extractor.matches))
    }

    /// Checks the proof commits `matched` (and nothing else) under `root`.
    pub fn verify(&self, root: &Hash256, matched: &[Hash256]) -> Result<Vec<(Hash256, u32)>, WalletError> {
        let (computed, found) = self.extract_matches()?;
        if computed != *root {
            return Err(invalid(format!("Computed root {} does not match header root {}", computed, root)));
        }
        let mut expected: Vec<Hash256> = matched.to_vec();
        expected.sort();
        expected.dedup();
        let mut actual: Vec<Hash256> = found.iter().map(|(h, _)| *h).collect();
        actual.sort();
        actual.dedup();
        if expected != actual {
            return Err(invalid(format!(
                "Proof matches {} transactions, {} claimed",
                actual.len(),
                expected.len()
            )));
        }
        Ok(found)
    }
}

fn invalid(msg: String) -> WalletError {
    WalletError::InvalidMerkleProof(msg)
}

fn tree_width(n: u32, height: u32) -> u32 {
    (n + (1 << height) - 1) >> height
}

fn tree_height(n: u32) -> u32 {
    let mut height = 0;
    while tree_width(n, height) > 1 {
        height += 1;
    }
    height
}

struct Builder<'a> {
    txids: &'a [Hash256],
    matches: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<Hash256>,
}

impl Builder<'_> {
    fn n(&self) -> u32 {
        self.txids.len() as u32
    }

    fn subtree_hash(&self, height: u32, pos: u32) -> Hash256 {
        if height == 0 {
            return self.txids[pos as usize];
        }
        let left = self.subtree_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < tree_width(self.n(), height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        combine(&left, &right)
    }

    fn traverse(&mut self, height: u32, pos: u32) {
        let start = (pos << height) as usize;
        let end = (((pos + 1) << height) as usize).min(self.txids.len());
        let parent_of_match = (start..end).any(|i| self.matches.get(i).copied().unwrap_or(false));
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            let hash = self.subtree_hash(height, pos);
            self.hashes.push(hash);
        } else {
            self.traverse(height - 1, pos * 2);
            if pos * 2 + 1 < tree_width(self.n(), height - 1) {
                self.traverse(height - 1, pos * 2 + 1);
            }
        }
    }
}

struct Extractor<'a> {
    proof: &'a MerkleProof,
    bits_used: usize,
    hashes_used: usize,
    matches: Vec<(Hash256, u32)>,
}

impl Extractor<'_> {
    fn next_bit(&mut self) -> Result<bool, WalletError> {
        let i = self.bits_used;
        let byte = self.proof.flags.get(i / 8).ok_or_else(|| invalid("Ran out of flag bits".to_string()))?;
        self.bits_used += 1;
        Ok(byte & (1 << (i % 8)) != 0)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<Hash256, WalletError> {
        let flag = self.next_bit()?;
        if height == 0 || !flag {
            let hash = *self
                .proof
                .hashes
                .get(self.hashes_used)
                .ok_or_else(|| invalid("Ran out of hashes".to_string()))?;
            self.hashes_used += 1;
            if height == 0 && flag {
                self.matches.push((hash, pos));
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.proof.total_transactions, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            // identical siblings would let a forged tree duplicate a leaf
            if right == left {
                return Err(invalid("Duplicate sibling hashes".to_string()));
            }
            right
        } else {
            left
        };
        Ok(combine(&left, &right))
    }
}
