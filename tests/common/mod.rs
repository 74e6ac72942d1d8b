#![allow(dead_code)]

use spv_hot_wallet::blockchain::address::ProgramHash;
use spv_hot_wallet::blockchain::spv::merkle::merkle_root;
use spv_hot_wallet::blockchain::spv::{BlockHeader, MerkleProof};
use spv_hot_wallet::blockchain::transaction::{OutPoint, Transaction, TxInput, TxOutput, TxType};
use spv_hot_wallet::core::config::{ChainKind, ChainParams, Checkpoint, KdfParams, WalletConfig};
use spv_hot_wallet::crypto::hash::Hash256;
use spv_hot_wallet::{ChainWallet, WalletCoordinator};

pub const PAY_PASSWORD: &str = "integration-pass";
pub const MNEMONIC: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";
pub const REGTEST_BITS: u32 = 0x207fffff;
/// Opens a regtest retarget period, so heights up to 109 keep the anchor's bits.
pub const ANCHOR_HEIGHT: u32 = 100;

/// A mined header standing in for the block at a checkpoint.
pub fn anchor(salt: &[u8]) -> BlockHeader {
    let mut header = BlockHeader {
        version: 1,
        previous_hash: Hash256::hash(salt),
        merkle_root: Hash256::hash(b"anchor"),
        timestamp: 1_650_000_000,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    header.mine().unwrap();
    header
}

pub fn checkpoint(height: u32, header: &BlockHeader) -> Checkpoint {
    Checkpoint { height, hash: header.hash(), timestamp: header.timestamp, bits: header.bits }
}

/// Regtest "ELA" main chain and "IdChain" identity chain, both starting at `checkpoint`.
pub fn config(checkpoint: Checkpoint) -> WalletConfig {
    let mut config = WalletConfig::default();
    config.chains.clear();
    config.security.kdf = KdfParams::Scrypt { log_n: 4, r: 8, p: 1 };
    for (id, kind) in [("ELA", ChainKind::Main), ("IdChain", ChainKind::Identity)] {
        let mut params = ChainParams::regtest(id, kind);
        params.checkpoints.push(checkpoint.clone());
        config = config.with_chain(params);
    }
    config
}

pub fn coordinator(checkpoint: Checkpoint) -> WalletCoordinator {
    WalletCoordinator::import_from_mnemonic(config(checkpoint), MNEMONIC, "", PAY_PASSWORD).unwrap()
}

pub fn child(parent: &BlockHeader, salt: u8, txids: &[Hash256]) -> BlockHeader {
    let mut header = BlockHeader {
        version: 1,
        previous_hash: parent.hash(),
        merkle_root: if txids.is_empty() { Hash256::hash(&[salt, parent.nonce as u8]) } else { merkle_root(txids) },
        timestamp: parent.timestamp + 60,
        bits: parent.bits,
        nonce: 0,
    };
    header.mine().unwrap();
    header
}

/// Mines a block holding `txs` on `parent` and feeds header plus proof to the
/// wallet's engine. The wallet only learns the transactions themselves
/// through [`ChainWallet::receive_transaction`].
pub fn confirm(wallet: &ChainWallet, parent: &BlockHeader, txs: &[Transaction]) -> BlockHeader {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    let header = child(parent, 0, &txids);
    let proof = MerkleProof::build(&txids, &vec![true; txids.len()]);
    wallet.engine().accept_merkle_block(&header, &proof, &txids).unwrap();
    header
}

pub fn extend(wallet: &ChainWallet, parent: &BlockHeader, salt: u8) -> BlockHeader {
    let header = child(parent, salt, &[]);
    wallet.engine().accept_header(&header).unwrap();
    header
}

/// Pays `value` to `to` from an output the wallet does not own.
pub fn payment(to: ProgramHash, value: u64, salt: u8) -> Transaction {
    let mut tx = Transaction::new(TxType::TransferAsset);
    tx.inputs.push(TxInput { previous: OutPoint { txid: Hash256([salt; 32]), index: 0 }, sequence: u32::MAX });
    tx.outputs.push(TxOutput { value, program_hash: to, output_lock: 0 });
    tx
}
