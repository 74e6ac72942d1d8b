//! Chain reorganizations observed through a chain wallet.

mod common;

use common::*;
use proptest::prelude::*;
use spv_hot_wallet::blockchain::address::ProgramHash;
use spv_hot_wallet::blockchain::chain_wallet::TxStatus;
use spv_hot_wallet::blockchain::spv::BlockHeader;
use spv_hot_wallet::WalletError;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A heavier branch forking at or above the checkpoint always wins, and a
    /// payment confirmed only on the losing branch goes back to waiting.
    #[test]
    fn heavier_branch_wins(main_len in 1u32..=5, fork_offset in 0u32..=5, extra in 0u32..=1) {
        let fork_offset = fork_offset.min(main_len);
        let anchor = anchor(b"reorg-property");
        let coordinator = coordinator(checkpoint(ANCHOR_HEIGHT, &anchor));
        let wallet = coordinator.activate_chain("ELA", PAY_PASSWORD).unwrap();
        let address = ProgramHash::from_address(&wallet.create_address().unwrap()).unwrap();

        let incoming = payment(address, 25_000, 7);
        let txid = incoming.txid();
        wallet.receive_transaction(incoming.clone()).unwrap();

        let mut main: Vec<BlockHeader> = vec![anchor.clone(), confirm(&wallet, &anchor, &[incoming])];
        for i in 1..main_len {
            let next = extend(&wallet, &main[i as usize], i as u8);
            main.push(next);
        }
        prop_assert_eq!(wallet.tip_height(), ANCHOR_HEIGHT + main_len);

        let branch_len = main_len - fork_offset + 1 + extra;
        let mut parent = main[fork_offset as usize].clone();
        for i in 0..branch_len {
            parent = extend(&wallet, &parent, 100 + i as u8);
        }

        let fork_height = ANCHOR_HEIGHT + fork_offset;
        prop_assert_eq!(wallet.tip_height(), fork_height + branch_len);
        prop_assert_eq!(wallet.engine().tip().unwrap().hash, parent.hash());
        let pending = wallet.transaction(&txid).unwrap();
        if fork_offset == 0 {
            prop_assert_eq!(pending.status, TxStatus::Broadcast);
            prop_assert_eq!(pending.height, None);
            prop_assert_eq!(wallet.balance(), 0);
        } else {
            prop_assert_eq!(pending.height, Some(ANCHOR_HEIGHT + 1));
            prop_assert_eq!(wallet.balance(), 25_000);
        }
    }

    /// A branch no heavier than the accepted chain changes nothing.
    #[test]
    fn lighter_branch_is_kept_aside(main_len in 2u32..=5, fork_offset in 0u32..=4) {
        let fork_offset = fork_offset.min(main_len - 1);
        let anchor = anchor(b"side-property");
        let coordinator = coordinator(checkpoint(ANCHOR_HEIGHT, &anchor));
        let wallet = coordinator.activate_chain("ELA", PAY_PASSWORD).unwrap();

        let mut main = vec![anchor.clone()];
        for i in 0..main_len {
            let next = extend(&wallet, &main[i as usize], i as u8);
            main.push(next);
        }
        let tip = wallet.engine().tip().unwrap();

        let mut parent = main[fork_offset as usize].clone();
        for i in 0..(main_len - fork_offset) {
            parent = extend(&wallet, &parent, 200 + i as u8);
        }
        prop_assert_eq!(wallet.engine().tip().unwrap().hash, tip.hash);
        prop_assert_eq!(wallet.tip_height(), ANCHOR_HEIGHT + main_len);
        prop_assert!(!wallet.engine().is_on_main_chain(&parent.hash()));
    }
}

#[test]
fn orphan_header_is_rejected() {
    let anchor = anchor(b"orphan");
    let coordinator = coordinator(checkpoint(ANCHOR_HEIGHT, &anchor));
    let wallet = coordinator.activate_chain("ELA", PAY_PASSWORD).unwrap();
    let stranger = anchor_child_of_unknown();
    assert!(matches!(
        wallet.engine().accept_header(&stranger),
        Err(WalletError::DiscontinuousChain(_))
    ));
    assert_eq!(wallet.tip_height(), ANCHOR_HEIGHT);
}

fn anchor_child_of_unknown() -> BlockHeader {
    child(&anchor(b"somewhere else"), 1, &[])
}
