//! Unspent outputs and coin selection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blockchain::address::ProgramHash;
use crate::blockchain::transaction::OutPoint;
use crate::core::errors::WalletError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub program_hash: ProgramHash,
    /// Height of the confirming block; `None` while unconfirmed.
    pub height: Option<u32>,
}

impl Utxo {
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        match self.height {
            Some(h) if tip_height >= h => tip_height - h + 1,
            _ => 0,
        }
    }
}

/// Result of a selection: chosen outputs and the fee they imply.
#[derive(Debug, Clone)]
pub struct Selection {
    pub utxos: Vec<Utxo>,
    pub fee: u64,
    pub total: u64,
}

impl Selection {
    pub fn change(&self, amount: u64) -> u64 {
        self.total.saturating_sub(amount).saturating_sub(self.fee)
    }
}

pub struct UtxoSelector;

impl UtxoSelector {
    /// Largest-first accumulation, then the last pick is swapped for the
    /// smallest remaining output that still covers `amount + fee`.
    ///
    /// `fee_for_inputs(n)` is the fee of a transaction spending `n` inputs.
    pub fn select(
        utxos: &[Utxo],
        amount: u64,
        fee_for_inputs: impl Fn(usize) -> u64,
    ) -> Result<Selection, WalletError> {
        let available = Self::sum(utxos)?;
        if utxos.is_empty() {
            return Err(WalletError::InsufficientFunds(format!(
                "need {} plus fee, no spendable outputs",
                amount
            )));
        }

        let mut sorted = utxos.to_vec();
        sorted.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let mut total = 0u64;
        let mut count = 0usize;
        let mut covered = false;
        for utxo in &sorted {
            total = total
                .checked_add(utxo.value)
                .ok_or_else(|| WalletError::ValidationError("UTXO sum overflow".to_string()))?;
            count += 1;
            if total >= Self::target(amount, fee_for_inputs(count))? {
                covered = true;
                break;
            }
        }
        if !covered {
            return Err(WalletError::InsufficientFunds(format!(
                "need {} plus fee {}, available {}",
                amount,
                fee_for_inputs(count),
                available
            )));
        }

        let fee = fee_for_inputs(count);
        let target = Self::target(amount, fee)?;
        let last = count - 1;
        let without_last = total - sorted[last].value;

        // candidates after `last` are no larger; take the smallest that still works
        let replacement = sorted[count..]
            .iter()
            .enumerate()
            .filter(|(_, u)| without_last.saturating_add(u.value) >= target)
            .min_by_key(|(_, u)| u.value)
            .map(|(i, _)| count + i);
        if let Some(idx) = replacement {
            debug!(
                "Replacing {} with {} to shrink change",
                sorted[last].value, sorted[idx].value
            );
            sorted.swap(last, idx);
            total = without_last + sorted[last].value;
        }

        sorted.truncate(count);
        debug!("Selected {} outputs, total={}, fee={}", count, total, fee);
        Ok(Selection { utxos: sorted, fee, total })
    }

    fn target(amount: u64, fee: u64) -> Result<u64, WalletError> {
        amount
            .checked_add(fee)
            .ok_or_else(|| WalletError::ValidationError("Amount plus fee overflows".to_string()))
    }

    pub fn sum(utxos: &[Utxo]) -> Result<u64, WalletError> {
        utxos.iter().try_fold(0u64, |acc, u| {
            acc.checked_add(u.value)
                .ok_or_else(|| WalletError::ValidationError("UTXO sum overflow".to_string()))
        })
    }
}
