//! Transaction model, payloads and byte serialization.
//!
//! The txid is the double SHA-256 of the unsigned serialization, so it does
//! not change while cosigners add signatures.

use serde::{Deserialize, Serialize};

use crate::blockchain::address::{script_kind, AddressKind, ProgramHash};
use crate::core::errors::WalletError;
use crate::crypto::hash::{sha256, Hash256};
use crate::crypto::multisig::{CollectedSignature, MultiSigConfig};

/// Serialized size of one compact signature with its length prefix.
pub const SIGNATURE_SIZE: usize = 65;

const ATTRIBUTE_MEMO: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    TransferAsset,
    WithdrawFromSideChain,
    TransferCrossChainAsset,
    RegisterIdentification,
}

impl TxType {
    pub fn code(self) -> u8 {
        match self {
            TxType::TransferAsset => 0x02,
            TxType::WithdrawFromSideChain => 0x07,
            TxType::TransferCrossChainAsset => 0x08,
            TxType::RegisterIdentification => 0x09,
        }
    }
}

/// Recipients on the other side of a cross-chain transfer. Entry `i` pays
/// `amounts[i]` to `addresses[i]` and is funded by output `output_indexes[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CrossChainPayload {
    pub addresses: Vec<String>,
    pub output_indexes: Vec<u64>,
    pub amounts: Vec<u64>,
}

/// One entry of an identity document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContent {
    pub path: String,
    pub data_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub id: String,
    pub contents: Vec<IdentityContent>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

impl IdentityPayload {
    /// Bytes the identity key signs: everything except the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = Vec::new();
        write_var_bytes(&mut w, self.id.as_bytes());
        write_varint(&mut w, self.contents.len() as u64);
        for content in &self.contents {
            write_var_bytes(&mut w, content.path.as_bytes());
            w.extend_from_slice(content.data_hash.as_bytes());
        }
        w
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[default]
    None,
    CrossChain(CrossChainPayload),
    RegisterIdentification(IdentityPayload),
}

impl Payload {
    fn write(&self, w: &mut Vec<u8>) {
        match self {
            Payload::None => {}
            Payload::CrossChain(p) => {
                write_varint(w, p.addresses.len() as u64);
                for ((address, index), amount) in p.addresses.iter().zip(&p.output_indexes).zip(&p.amounts) {
                    write_var_bytes(w, address.as_bytes());
                    write_varint(w, *index);
                    w.extend_from_slice(&amount.to_le_bytes());
                }
            }
            Payload::RegisterIdentification(p) => {
                w.extend_from_slice(&p.signing_bytes());
                write_var_bytes(w, &p.signature);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous: OutPoint,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub program_hash: ProgramHash,
    #[serde(default)]
    pub output_lock: u32,
}

/// Redeem script of one spent address plus the signatures satisfying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(with = "hex")]
    pub code: Vec<u8>,
    #[serde(default)]
    pub signatures: Vec<CollectedSignature>,
}

impl Program {
    pub fn new(code: Vec<u8>) -> Self {
        Self { code, signatures: Vec::new() }
    }

    pub fn program_hash(&self) -> Result<ProgramHash, WalletError> {
        let kind = script_kind(&self.code)
            .ok_or_else(|| WalletError::ValidationError("Unrecognized redeem script".to_string()))?;
        Ok(ProgramHash::from_script(kind, &self.code))
    }

    /// Signatures this program needs before it can be spent.
    pub fn required_signatures(&self) -> usize {
        match script_kind(&self.code) {
            Some(AddressKind::MultiSig) => MultiSigConfig::from_redeem_script(&self.code)
                .map(|c| c.threshold as usize)
                .unwrap_or(1),
            _ => 1,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.signatures.len() >= self.required_signatures()
    }

    /// Concatenated signatures, each with a one-byte length prefix.
    pub fn parameter(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.signatures.len() * SIGNATURE_SIZE);
        for sig in self.signatures.iter().take(self.required_signatures()) {
            out.push(sig.signature.len() as u8);
            out.extend_from_slice(&sig.signature);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub payload_version: u8,
    pub payload: Payload,
    pub memo: Option<String>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub programs: Vec<Program>,
}

impl Transaction {
    pub fn new(tx_type: TxType) -> Self {
        Self {
            tx_type,
            payload_version: 0,
            payload: Payload::None,
            memo: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            programs: Vec::new(),
        }
    }

    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(256);
        w.push(self.tx_type.code());
        w.push(self.payload_version);
        self.payload.write(&mut w);

        match &self.memo {
            Some(memo) => {
                write_varint(&mut w, 1);
                w.push(ATTRIBUTE_MEMO);
                write_var_bytes(&mut w, memo.as_bytes());
            }
            None => write_varint(&mut w, 0),
        }

        write_varint(&mut w, self.inputs.len() as u64);
        for input in &self.inputs {
            w.extend_from_slice(input.previous.txid.as_bytes());
            w.extend_from_slice(&input.previous.index.to_le_bytes());
            w.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut w, self.outputs.len() as u64);
        for output in &self.outputs {
            w.extend_from_slice(&output.value.to_le_bytes());
            w.extend_from_slice(&output.output_lock.to_le_bytes());
            w.extend_from_slice(&output.program_hash.0);
        }

        w.extend_from_slice(&self.lock_time.to_le_bytes());
        w
    }

    /// Full serialization including programs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = self.unsigned_bytes();
        write_varint(&mut w, self.programs.len() as u64);
        for program in &self.programs {
            write_var_bytes(&mut w, &program.parameter());
            write_var_bytes(&mut w, &program.code);
        }
        w
    }

    pub fn txid(&self) -> Hash256 {
        Hash256::hash(&self.unsigned_bytes())
    }

    /// Digest every input signature commits to.
    pub fn signing_digest(&self) -> [u8; 32] {
        sha256(&self.unsigned_bytes())
    }

    /// Size once every program carries its required signatures.
    pub fn estimated_size(&self) -> usize {
        let mut size = self.unsigned_bytes().len() + varint_size(self.programs.len() as u64);
        for program in &self.programs {
            let parameter = program.required_signatures() * SIGNATURE_SIZE;
            size += varint_size(parameter as u64) + parameter;
            size += varint_size(program.code.len() as u64) + program.code.len();
        }
        size
    }

    pub fn is_fully_signed(&self) -> bool {
        !self.programs.is_empty() && self.programs.iter().all(Program::is_complete)
    }

    pub fn total_output(&self) -> Result<u64, WalletError> {
        self.outputs.iter().try_fold(0u64, |acc, o| {
            acc.checked_add(o.value)
                .ok_or_else(|| WalletError::ValidationError("Output sum overflow".to_string()))
        })
    }

    /// Cross-chain amounts must be funded by the outputs they point at.
    pub fn validate_payload(&self) -> Result<(), WalletError> {
        let Payload::CrossChain(payload) = &self.payload else {
            return Ok(());
        };
        let n = payload.addresses.len();
        if n == 0 || payload.amounts.len() != n || payload.output_indexes.len() != n {
            return Err(WalletError::PayloadMismatch(format!(
                "{} addresses, {} amounts, {} output indexes",
                n,
                payload.amounts.len(),
                payload.output_indexes.len()
            )));
        }

        let mut value_bearing = 0u64;
        let mut counted = Vec::with_capacity(n);
        for index in &payload.output_indexes {
            let output = self
                .outputs
                .get(*index as usize)
                .ok_or_else(|| WalletError::PayloadMismatch(format!("Output index {} out of range", index)))?;
            if !counted.contains(index) {
                counted.push(*index);
                value_bearing = value_bearing.saturating_add(output.value);
            }
        }

        let declared = payload
            .amounts
            .iter()
            .try_fold(0u64, |acc, a| acc.checked_add(*a))
            .ok_or_else(|| WalletError::PayloadMismatch("Payload amount overflow".to_string()))?;
        if declared > value_bearing {
            return Err(WalletError::PayloadMismatch(format!(
                "Payload declares {} but outputs carry {}",
                declared, value_bearing
            )));
        }
        Ok(())
    }
}

/// ceil(size / 1000) * fee_per_kb
pub fn fee_for_size(size_bytes: usize, fee_per_kb: u64) -> u64 {
    (size_bytes as u64).div_ceil(1000).saturating_mul(fee_per_kb)
}

pub fn write_varint(w: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => w.push(n as u8),
        0xfd..=0xffff => {
            w.push(0xfd);
            w.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            w.push(0xfe);
            w.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            w.push(0xff);
            w.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_var_bytes(w: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(w, bytes.len() as u64);
    w.extend_from_slice(bytes);
}
