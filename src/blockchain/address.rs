//! Program hashes and their base58check address form.
//!
//! An address is `prefix || RIPEMD160(SHA256(redeem_script))` encoded with
//! base58check. The prefix byte tells what kind of script redeems it:
//! - standard single-key (`0x21`), script ends with CHECKSIG
//! - multi-signature (`0x12`), script ends with CHECKMULTISIG
//! - cross-chain (`0x4B`), the sidechain lock address
//! - identity (`0x67`), script ends with the identity opcode

use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::core::errors::WalletError;
use crate::crypto::hash::hash160;
use crate::crypto::multisig::config::OP_CHECKMULTISIG;

const PUSH_33: u8 = 0x21;
const OP_CHECKSIG: u8 = 0xAC;
const OP_IDENTITY: u8 = 0xAD;

/// Address families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    Standard,
    MultiSig,
    CrossChain,
    Identity,
    /// All-zero program hash: value sent here is burned (withdrawals).
    Destroy,
}

impl AddressKind {
    pub fn prefix(self) -> u8 {
        match self {
            AddressKind::Standard => 0x21,
            AddressKind::MultiSig => 0x12,
            AddressKind::CrossChain => 0x4B,
            AddressKind::Identity => 0x67,
            AddressKind::Destroy => 0x00,
        }
    }

    pub fn from_prefix(prefix: u8) -> Option<Self> {
        match prefix {
            0x21 => Some(AddressKind::Standard),
            0x12 => Some(AddressKind::MultiSig),
            0x4B => Some(AddressKind::CrossChain),
            0x67 => Some(AddressKind::Identity),
            0x00 => Some(AddressKind::Destroy),
            _ => None,
        }
    }
}

/// Prefix byte plus 20-byte script hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHash(pub [u8; 21]);

impl ProgramHash {
    pub fn from_script(kind: AddressKind, script: &[u8]) -> Self {
        let mut bytes = [0u8; 21];
        bytes[0] = kind.prefix();
        bytes[1..].copy_from_slice(&hash160(script));
        ProgramHash(bytes)
    }

    pub fn destroy() -> Self {
        ProgramHash([0u8; 21])
    }

    pub fn standard(public_key: &PublicKey) -> Self {
        Self::from_script(AddressKind::Standard, &standard_redeem_script(public_key))
    }

    pub fn identity(public_key: &PublicKey) -> Self {
        Self::from_script(AddressKind::Identity, &identity_redeem_script(public_key))
    }

    pub fn kind(&self) -> Option<AddressKind> {
        if self.0 == [0u8; 21] {
            return Some(AddressKind::Destroy);
        }
        AddressKind::from_prefix(self.0[0])
    }

    pub fn to_address(&self) -> String {
        bs58::encode(&self.0).with_check().into_string()
    }

    pub fn from_address(address: &str) -> Result<Self, WalletError> {
        let bytes = bs58::decode(address)
            .with_check(None)
            .into_vec()
            .map_err(|e| WalletError::InvalidAddress(format!("{}: {}", address, e)))?;
        let bytes: [u8; 21] = bytes
            .try_into()
            .map_err(|_| WalletError::InvalidAddress(format!("{}: wrong payload length", address)))?;
        let hash = ProgramHash(bytes);
        if hash.kind().is_none() {
            return Err(WalletError::InvalidAddress(format!("{}: unknown prefix", address)));
        }
        Ok(hash)
    }
}

impl fmt::Display for ProgramHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_address())
    }
}

impl fmt::Debug for ProgramHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgramHash({})", self.to_address())
    }
}

impl FromStr for ProgramHash {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProgramHash::from_address(s)
    }
}

impl Serialize for ProgramHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_address())
    }
}

impl<'de> Deserialize<'de> for ProgramHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ProgramHash::from_address(&s).map_err(serde::de::Error::custom)
    }
}

/// <push 33> <pubkey> CHECKSIG
pub fn standard_redeem_script(public_key: &PublicKey) -> Vec<u8> {
    single_key_script(public_key, OP_CHECKSIG)
}

/// <push 33> <pubkey> IDENTITY
pub fn identity_redeem_script(public_key: &PublicKey) -> Vec<u8> {
    single_key_script(public_key, OP_IDENTITY)
}

fn single_key_script(public_key: &PublicKey, op: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(35);
    script.push(PUSH_33);
    script.extend_from_slice(&public_key.serialize());
    script.push(op);
    script
}

/// Address kind implied by the last opcode of a redeem script.
pub fn script_kind(script: &[u8]) -> Option<AddressKind> {
    match script.last() {
        Some(&OP_CHECKSIG) if script.len() == 35 => Some(AddressKind::Standard),
        Some(&OP_IDENTITY) if script.len() == 35 => Some(AddressKind::Identity),
        Some(&OP_CHECKMULTISIG) => Some(AddressKind::MultiSig),
        _ => None,
    }
}

/// Public key embedded in a single-key script.
pub fn script_public_key(script: &[u8]) -> Option<PublicKey> {
    if script.len() != 35 || script[0] != PUSH_33 {
        return None;
    }
    PublicKey::from_slice(&script[1..34]).ok()
}

pub fn is_valid_address(address: &str) -> bool {
    ProgramHash::from_address(address).is_ok()
}
