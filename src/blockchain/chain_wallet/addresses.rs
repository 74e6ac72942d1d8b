//! Receive addresses, the recovery gap and multi-signature accounts.

use secp256k1::PublicKey;
use tracing::{debug, info};

use super::{ChainWallet, WalletAddress, WalletState};
use crate::blockchain::address::{standard_redeem_script, AddressKind, ProgramHash};
use crate::core::errors::WalletError;
use crate::crypto::hd::ChainKeyDeriver;
use crate::crypto::multisig::MultiSigConfig;

/// External (receive) branch under the account key.
const RECEIVE_BRANCH: u32 = 0;

pub fn multisig_program_hash(config: &MultiSigConfig) -> ProgramHash {
    ProgramHash::from_script(AddressKind::MultiSig, &config.redeem_script())
}

impl ChainWallet {
    /// Next receive address. In single-address mode this is always the
    /// first one.
    pub fn create_address(&self) -> Result<String, WalletError> {
        let address = {
            let mut st = self.state.write();
            let slot = if st.info.single_address { 0 } else { st.info.used_address_count() };
            st.info.highest_used_address_index = Some(st.info.highest_used_address_index.map_or(slot, |h| h.max(slot)));
            Self::ensure_slots(&mut st)?;
            st.addresses
                .get(slot as usize)
                .map(|a| a.program_hash.to_address())
                .ok_or_else(|| WalletError::InternalError(format!("Address slot {} missing", slot)))?
        };
        debug!("{}: handed out address {}", self.chain_id(), address);
        self.refresh_filter();
        Ok(address)
    }

    /// Keeps `limit_gap` addresses derived past the highest used one so
    /// payments to not-yet-handed-out addresses are found while syncing.
    /// Returns the number of watched receive addresses.
    pub fn recover(&self, limit_gap: u32) -> Result<usize, WalletError> {
        let watched = {
            let mut st = self.state.write();
            st.info.address_gap = limit_gap;
            Self::ensure_slots(&mut st)?;
            st.addresses.len()
        };
        info!("{}: recovering with gap {}, watching {} addresses", self.chain_id(), limit_gap, watched);
        self.refresh_filter();
        Ok(watched)
    }

    /// Handed-out addresses in `[start, start + count)` plus the total.
    pub fn all_addresses(&self, start: usize, count: usize) -> (Vec<String>, usize) {
        let st = self.state.read();
        let used = if st.info.single_address { 1 } else { st.info.used_address_count() as usize };
        let used = used.min(st.addresses.len());
        let page = st.addresses[..used]
            .iter()
            .skip(start)
            .take(count)
            .map(|a| a.program_hash.to_address())
            .collect();
        (page, used)
    }

    /// Key of the first receive address; this wallet's cosigner key.
    pub fn public_key(&self) -> Result<PublicKey, WalletError> {
        self.state
            .read()
            .addresses
            .first()
            .map(|a| a.public_key)
            .ok_or_else(|| WalletError::InternalError("Wallet has no addresses".to_string()))
    }

    /// Registers an m-of-n account made of `cosigners` and this wallet's key.
    pub fn create_multisig_address(&self, cosigners: &[PublicKey], required: u8) -> Result<String, WalletError> {
        let own = self.public_key()?;
        let mut signers = cosigners.to_vec();
        if !signers.contains(&own) {
            signers.push(own);
        }
        let config = MultiSigConfig::new(required, signers)?;
        let hash = multisig_program_hash(&config);
        {
            let mut st = self.state.write();
            if st.multisig.insert(hash, config.clone()).is_none() {
                st.info.multisig_accounts.push(config.clone());
            }
        }
        info!(
            "{}: multi-sig account {} ({} of {})",
            self.chain_id(),
            hash,
            config.threshold,
            config.total_signers()
        );
        self.refresh_filter();
        Ok(hash.to_address())
    }

    /// Derives addresses until the used ones plus the gap are covered.
    pub(crate) fn fill_addresses(&self) -> Result<bool, WalletError> {
        Self::ensure_slots(&mut self.state.write())
    }

    pub(crate) fn ensure_slots(st: &mut WalletState) -> Result<bool, WalletError> {
        let wanted = if st.info.single_address {
            1
        } else {
            (st.info.used_address_count() as usize + st.info.address_gap as usize).max(1)
        };
        let mut added = false;
        while st.addresses.len() < wanted {
            let next = st.addresses.last().map_or(0, |a| a.index + 1);
            let (index, public_key) = ChainKeyDeriver::address_public(&st.info.account_public, RECEIVE_BRANCH, next)?;
            let program_hash = ProgramHash::standard(&public_key);
            st.slots.insert(program_hash, st.addresses.len());
            st.addresses.push(WalletAddress { index, public_key, program_hash });
            added = true;
        }
        Ok(added)
    }

    /// Marks the slot owning `hash` as used. Returns whether new addresses
    /// had to be derived to keep the gap.
    pub(crate) fn mark_used(st: &mut WalletState, hash: &ProgramHash) -> Result<bool, WalletError> {
        let Some(&slot) = st.slots.get(hash) else {
            return Ok(false);
        };
        if st.info.single_address {
            return Ok(false);
        }
        let slot = slot as u32;
        if st.info.highest_used_address_index.map_or(true, |h| slot > h) {
            st.info.highest_used_address_index = Some(slot);
            return Self::ensure_slots(st);
        }
        Ok(false)
    }

    /// Redeem script for an address this wallet controls.
    pub(crate) fn redeem_script(st: &WalletState, hash: &ProgramHash) -> Option<Vec<u8>> {
        if let Some(&slot) = st.slots.get(hash) {
            return st.addresses.get(slot).map(|a| standard_redeem_script(&a.public_key));
        }
        st.multisig.get(hash).map(MultiSigConfig::redeem_script)
    }

    pub(crate) fn filter_of(st: &WalletState) -> Vec<ProgramHash> {
        let mut filter: Vec<ProgramHash> = st.addresses.iter().map(|a| a.program_hash).collect();
        filter.extend(st.multisig.keys().copied());
        filter
    }

    /// Addresses the sync worker should match transactions against.
    pub fn filter(&self) -> Vec<ProgramHash> {
        Self::filter_of(&self.state.read())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::blockchain::address::{is_valid_address, AddressKind, ProgramHash};
    use crate::core::config::ChainKind;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn cosigner(i: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[i; 32]).unwrap())
    }

    #[test]
    fn test_create_address_advances_index() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        let first = wallet.create_address().unwrap();
        let second = wallet.create_address().unwrap();
        assert_ne!(first, second);
        assert!(is_valid_address(&first));
        assert_eq!(wallet.info().highest_used_address_index, Some(1));
        assert_eq!(wallet.all_addresses(0, 10), (vec![first, second], 2));
    }

    #[test]
    fn test_single_address_mode() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        wallet.state.write().info.single_address = true;
        let first = wallet.create_address().unwrap();
        assert_eq!(wallet.create_address().unwrap(), first);
        assert_eq!(wallet.info().highest_used_address_index, Some(0));
    }

    #[test]
    fn test_addresses_are_deterministic() {
        let (a, _) = wallet_with(ChainKind::Main);
        let (b, _) = wallet_with(ChainKind::Main);
        assert_eq!(a.create_address().unwrap(), b.create_address().unwrap());
        assert_eq!(a.public_key().unwrap(), b.public_key().unwrap());
    }

    #[test]
    fn test_recover_watches_gap() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        assert_eq!(wallet.filter().len(), 1);
        assert_eq!(wallet.recover(5).unwrap(), 5);
        assert_eq!(wallet.filter().len(), 5);
        // handed-out list is unaffected by the gap
        assert_eq!(wallet.all_addresses(0, 10).1, 0);
    }

    #[test]
    fn test_payment_to_gap_address_marks_used() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        wallet.recover(3).unwrap();
        let third = wallet.filter()[2];
        {
            let mut st = wallet.state.write();
            assert!(super::ChainWallet::mark_used(&mut st, &third).unwrap());
        }
        assert_eq!(wallet.info().highest_used_address_index, Some(2));
        assert_eq!(wallet.filter().len(), 6);
    }

    #[test]
    fn test_multisig_address_includes_own_key() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        let address = wallet.create_multisig_address(&[cosigner(1), cosigner(2)], 2).unwrap();
        let hash = ProgramHash::from_address(&address).unwrap();
        assert_eq!(hash.kind(), Some(AddressKind::MultiSig));
        let info = wallet.info();
        assert_eq!(info.multisig_accounts.len(), 1);
        assert_eq!(info.multisig_accounts[0].total_signers(), 3);
        assert!(wallet.filter().contains(&hash));
    }

    #[test]
    fn test_multisig_threshold_validated() {
        let (wallet, _) = wallet_with(ChainKind::Main);
        assert!(wallet.create_multisig_address(&[cosigner(1)], 3).is_err());
    }
}
