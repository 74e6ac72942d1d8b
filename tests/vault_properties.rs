//! Sealing and derivation properties of the key vault.

use proptest::prelude::*;
use spv_hot_wallet::core::config::KdfParams;
use spv_hot_wallet::crypto::hd::ChainKeyDeriver;
use spv_hot_wallet::crypto::signature::{sign_message, verify_message};
use spv_hot_wallet::crypto::vault::{seal, unseal, KeyVault};
use spv_hot_wallet::security::RootSecret;
use spv_hot_wallet::WalletError;
use test_case::test_case;

fn fast_kdf() -> KdfParams {
    KdfParams::Scrypt { log_n: 4, r: 8, p: 1 }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn sealed_secret_opens_only_with_its_password(
        secret in proptest::collection::vec(any::<u8>(), 1..96),
        password in "[a-zA-Z0-9]{8,24}",
    ) {
        let blob = seal(&secret, &password, &fast_kdf()).unwrap();
        let opened = unseal(&blob, &password).unwrap();
        prop_assert_eq!(opened.as_slice(), secret.as_slice());
        let wrong = format!("{}x", password);
        prop_assert!(matches!(unseal(&blob, &wrong), Err(WalletError::Authentication(_))));
    }

    #[test]
    fn derivation_is_deterministic(seed in proptest::collection::vec(any::<u8>(), 16..64), index in 0u32..1000) {
        let a = ChainKeyDeriver::derive(&seed, 1, index, true).unwrap();
        let b = ChainKeyDeriver::derive(&seed, 1, index, true).unwrap();
        prop_assert_eq!(a.public_key, b.public_key);
        prop_assert_eq!(a.index, b.index);

        let other_purpose = ChainKeyDeriver::derive(&seed, 2, index, true).unwrap();
        prop_assert_ne!(a.public_key, other_purpose.public_key);

        let signature = sign_message(&a.secret_key().unwrap(), b"identity").unwrap();
        prop_assert!(verify_message(&a.public_key, b"identity", &signature));
        prop_assert!(!verify_message(&other_purpose.public_key, b"identity", &signature));
    }
}

#[test_case(16; "twelve words")]
#[test_case(32; "twenty-four words")]
fn vault_seed_matches_between_unlocks(entropy_len: usize) {
    let root = RootSecret::new(vec![0x5a; entropy_len], "");
    let vault = KeyVault::create(&root, "vault-password", &fast_kdf()).unwrap();
    let first = vault.with_seed("vault-password", |seed| ChainKeyDeriver::account_public(seed, 0)).unwrap();
    let second = vault.with_seed("vault-password", |seed| ChainKeyDeriver::account_public(seed, 0)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn rotated_password_replaces_the_old_one() {
    let root = RootSecret::new(vec![7u8; 16], "extra words");
    let vault = KeyVault::create(&root, "first-password", &fast_kdf()).unwrap();
    vault.rotate_password("first-password", "second-password").unwrap();
    assert!(matches!(vault.verify_password("first-password"), Err(WalletError::Authentication(_))));
    let unlocked = vault.unlock("second-password").unwrap();
    assert_eq!(unlocked.entropy(), root.entropy());
    assert_eq!(unlocked.passphrase(), "extra words");
}

#[test]
fn failed_rotation_keeps_the_old_password() {
    let root = RootSecret::new(vec![8u8; 16], "");
    let vault = KeyVault::create(&root, "first-password", &fast_kdf()).unwrap();
    assert!(vault.rotate_password("not-it", "second-password").is_err());
    assert!(vault.verify_password("first-password").is_ok());
}
