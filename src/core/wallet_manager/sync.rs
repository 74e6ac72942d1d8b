//! Wiring chain wallets to their sync workers.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::WalletCoordinator;
use crate::blockchain::chain_wallet::ChainWallet;
use crate::core::errors::WalletError;
use crate::network::{PeerConnector, PeerSet, RelayEvent, SyncHandle, SyncWorker};

impl WalletCoordinator {
    /// Starts synchronizing `chain_id` through `connector`, seeded with the
    /// chain's configured peers. Must be called inside a tokio runtime.
    /// A running sync for the chain is replaced.
    pub fn start_sync(&self, chain_id: &str, connector: Arc<dyn PeerConnector>) -> Result<SyncHandle, WalletError> {
        let wallet = self.chain(chain_id)?;
        self.stop_sync(chain_id);

        let params = wallet.params();
        let peers = PeerSet::new(chain_id, self.config.sync.clone(), &params.seed_peers);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (worker, handle) = SyncWorker::new(
            Arc::clone(wallet.engine()),
            peers,
            connector,
            self.config.sync.clone(),
            wallet.filter(),
            relay_tx,
        );
        let worker_task = worker.spawn();
        let relay_task = tokio::spawn(relay(Arc::downgrade(&wallet), relay_rx));
        wallet.attach_publisher(handle.clone());

        self.sync_tasks.lock().insert(chain_id.to_string(), vec![worker_task, relay_task]);
        info!("{}: sync started with {} seed peers", chain_id, params.seed_peers.len());
        Ok(handle)
    }

    /// Stops the sync worker of `chain_id`, if one runs.
    pub fn stop_sync(&self, chain_id: &str) {
        if let Ok(wallet) = self.chain(chain_id) {
            if let Some(handle) = wallet.detach_publisher() {
                handle.stop();
            }
        }
        if let Some(tasks) = self.sync_tasks.lock().remove(chain_id) {
            // the worker winds down on its own once stopped; the relay has nothing left to do
            if let Some(relay) = tasks.get(1) {
                relay.abort();
            }
            info!("{}: sync stopped", chain_id);
        }
    }
}

/// Hands worker output to the wallet until either side goes away.
async fn relay(wallet: Weak<ChainWallet>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
    while let Some(event) = events.recv().await {
        let Some(wallet) = wallet.upgrade() else {
            break;
        };
        match event {
            RelayEvent::Transaction(tx) => {
                let txid = tx.txid();
                if let Err(e) = wallet.receive_transaction(tx) {
                    warn!("{}: relayed transaction {} not applied: {}", wallet.chain_id(), txid, e);
                }
            }
            RelayEvent::PublishResult { txid, result } => wallet.on_publish_result(&txid, result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::blockchain::address::ProgramHash;
    use crate::blockchain::chain_wallet::TxStatus;
    use crate::blockchain::transaction::{OutPoint, Transaction, TxInput, TxOutput, TxType};
    use crate::crypto::hash::Hash256;
    use crate::network::memory::{MemoryConnector, MemoryNode};
    use std::time::Duration;

    fn payment(to: ProgramHash, value: u64) -> Transaction {
        let mut tx = Transaction::new(TxType::TransferAsset);
        tx.inputs.push(TxInput { previous: OutPoint { txid: Hash256([4u8; 32]), index: 0 }, sequence: u32::MAX });
        tx.outputs.push(TxOutput { value, program_hash: to, output_lock: 0 });
        tx
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_synced_payment_reaches_wallet() {
        let mut config = config();
        if let Some(params) = config.chains.get_mut("ELA") {
            params.seed_peers = vec!["node-1".to_string()];
        }
        let coordinator = WalletCoordinator::import_from_mnemonic(config, MNEMONIC, "", PAY_PASSWORD).unwrap();
        let wallet = coordinator.activate_chain("ELA", PAY_PASSWORD).unwrap();
        let address = ProgramHash::from_address(&wallet.create_address().unwrap()).unwrap();

        let node = MemoryNode::new(genesis());
        let tx = payment(address, 7_000);
        node.mine_block(vec![tx.clone()]).unwrap();
        for _ in 0..3 {
            node.mine_block(Vec::new()).unwrap();
        }
        let connector = MemoryConnector::new();
        connector.add_node("node-1", node.clone());

        let handle = coordinator.start_sync("ELA", Arc::new(connector)).unwrap();
        let txid = tx.txid();
        wait_until(|| {
            wallet.tip_height() == 4 && wallet.transaction(&txid).map(|p| p.status) == Some(TxStatus::Confirmed)
        })
        .await;
        assert_eq!(wallet.balance(), 7_000);
        assert_eq!(wallet.transaction(&txid).unwrap().height, Some(1));

        coordinator.stop_sync("ELA");
        assert!(handle.is_stopped());
    }
}
