//! Hot-path benchmarks: key derivation, signing, merkle proofs and header
//! acceptance. A wallet derives and signs on user request and verifies
//! every block a peer sends, so all of these stay well under a millisecond
//! except the seed stretch.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use spv_hot_wallet::blockchain::spv::merkle::merkle_root;
use spv_hot_wallet::blockchain::spv::{BlockHeader, ChainSyncEngine, MerkleProof};
use spv_hot_wallet::core::config::{ChainKind, ChainParams};
use spv_hot_wallet::crypto::hash::Hash256;
use spv_hot_wallet::crypto::hd::ChainKeyDeriver;
use spv_hot_wallet::crypto::signature::sign_digest;

const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn seed() -> [u8; 64] {
    bip39::Mnemonic::parse(MNEMONIC).expect("valid mnemonic").to_seed("")
}

/// Mnemonic to BIP39 seed (PBKDF2, 2048 rounds)
fn bench_mnemonic_to_seed(c: &mut Criterion) {
    let mnemonic = bip39::Mnemonic::parse(MNEMONIC).expect("valid mnemonic");
    c.bench_function("mnemonic_to_seed", |b| b.iter(|| black_box(&mnemonic).to_seed(black_box(""))));
}

fn bench_identity_derivation(c: &mut Criterion) {
    let seed = seed();
    c.bench_function("derive_identity_key", |b| {
        b.iter(|| ChainKeyDeriver::derive(black_box(&seed), 1, black_box(7), true).expect("derive failed"))
    });
}

fn bench_address_signing(c: &mut Criterion) {
    let seed = seed();
    let key = ChainKeyDeriver::address_private(&seed, 0, 0, 0)
        .and_then(|k| k.secret_key())
        .expect("derive failed");
    let digest = Hash256::hash(b"transfer 1.0 ELA").0;
    c.bench_function("sign_digest", |b| b.iter(|| sign_digest(black_box(&key), black_box(&digest))));
}

/// One matched transaction out of a thousand
fn bench_merkle_verify(c: &mut Criterion) {
    let txids: Vec<Hash256> = (0u32..1000).map(|i| Hash256::hash(&i.to_le_bytes())).collect();
    let mut matches = vec![false; txids.len()];
    matches[517] = true;
    let root = merkle_root(&txids);
    let proof = MerkleProof::build(&txids, &matches);
    let matched = [txids[517]];
    c.bench_function("merkle_proof_verify_1000", |b| {
        b.iter(|| proof.verify(black_box(&root), black_box(&matched)).expect("proof rejected"))
    });
}

/// Nine headers on a fresh engine, staying inside the first retarget interval
fn bench_header_acceptance(c: &mut Criterion) {
    let params = ChainParams::regtest("ELA", ChainKind::Main);
    let mut genesis = BlockHeader {
        version: 1,
        previous_hash: Hash256::ZERO,
        merkle_root: Hash256::hash(b"bench genesis"),
        timestamp: 1_600_000_000,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    genesis.mine().expect("mine failed");
    let mut headers = Vec::new();
    let mut parent = genesis.clone();
    for i in 0u8..9 {
        let mut next = BlockHeader {
            version: 1,
            previous_hash: parent.hash(),
            merkle_root: Hash256::hash(&[i]),
            timestamp: parent.timestamp + 60,
            bits: parent.bits,
            nonce: 0,
        };
        next.mine().expect("mine failed");
        headers.push(next.clone());
        parent = next;
    }

    c.bench_function("accept_9_headers", |b| {
        b.iter(|| {
            let engine = ChainSyncEngine::from_genesis(params.clone(), &genesis).expect("engine");
            for header in &headers {
                engine.accept_header(black_box(header)).expect("header rejected");
            }
            engine.tip_height()
        })
    });
}

criterion_group!(
    benches,
    bench_mnemonic_to_seed,
    bench_identity_derivation,
    bench_address_signing,
    bench_merkle_verify,
    bench_header_acceptance
);
criterion_main!(benches);
