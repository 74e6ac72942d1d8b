//! Transaction construction, signing, cosigner exchange and broadcast.

use secp256k1::PublicKey;
use tracing::{debug, info, warn};

use super::{ChainWallet, ChainWalletKind, PendingTransaction, TxDirection, TxStatus, WalletEvent, WalletState};
use crate::blockchain::address::{script_kind, script_public_key, standard_redeem_script, AddressKind, ProgramHash};
use crate::blockchain::transaction::{
    fee_for_size, CrossChainPayload, IdentityPayload, OutPoint, Payload, Program, Transaction, TxInput, TxOutput,
    TxType,
};
use crate::blockchain::utxo::{Utxo, UtxoSelector};
use crate::core::errors::WalletError;
use crate::crypto::hash::Hash256;
use crate::crypto::hd::ChainKeyDeriver;
use crate::crypto::multisig::{MultiSigConfig, SignatureCollector};
use crate::crypto::signature::{sign_digest, verify_digest, verify_message};

const RECEIVE_BRANCH: u32 = 0;
const FINAL_SEQUENCE: u32 = u32::MAX;

/// What a caller asked for, before inputs and change are chosen.
struct Draft {
    tx_type: TxType,
    payload: Payload,
    outputs: Vec<TxOutput>,
    from: Option<ProgramHash>,
    memo: Option<String>,
}

/// A key this wallet holds for one program of a transaction.
struct SigningPlan {
    program: usize,
    index: u32,
    public_key: PublicKey,
}

impl ChainWallet {
    /// Plain transfer of `amount` to `to`. Without `from`, any single-key
    /// address of the wallet may fund it.
    pub fn create_transaction(
        &self,
        from: Option<&str>,
        to: &str,
        amount: u64,
        memo: Option<&str>,
    ) -> Result<PendingTransaction, WalletError> {
        if amount == 0 {
            return Err(WalletError::ValidationError("Amount must be positive".to_string()));
        }
        let draft = Draft {
            tx_type: TxType::TransferAsset,
            payload: Payload::None,
            outputs: vec![output(ProgramHash::from_address(to)?, amount)],
            from: from.map(ProgramHash::from_address).transpose()?,
            memo: memo.map(str::to_string),
        };
        self.build(draft)
    }

    /// Transfer funded by one of this wallet's multi-signature accounts.
    pub fn create_multisig_transaction(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        memo: Option<&str>,
    ) -> Result<PendingTransaction, WalletError> {
        let account = ProgramHash::from_address(from)?;
        if !self.state.read().multisig.contains_key(&account) {
            return Err(WalletError::NotFoundError(format!("{} is not a multi-sig account of this wallet", from)));
        }
        self.create_transaction(Some(from), to, amount, memo)
    }

    /// Main chain only: locks `amount` at a sidechain's lock address; the
    /// payload names who receives it on the sidechain.
    pub fn create_deposit_transaction(
        &self,
        from: Option<&str>,
        lock_address: &str,
        amount: u64,
        payload: CrossChainPayload,
        memo: Option<&str>,
    ) -> Result<PendingTransaction, WalletError> {
        if self.kind() != &ChainWalletKind::Main {
            return Err(WalletError::ValidationError(format!(
                "{}: deposits are made from the main chain",
                self.chain_id()
            )));
        }
        let lock = ProgramHash::from_address(lock_address)?;
        if lock.kind() != Some(AddressKind::CrossChain) {
            return Err(WalletError::InvalidAddress(format!("{} is not a cross-chain address", lock_address)));
        }
        for address in &payload.addresses {
            ProgramHash::from_address(address)?;
        }
        self.build(Draft {
            tx_type: TxType::TransferCrossChainAsset,
            payload: Payload::CrossChain(payload),
            outputs: vec![output(lock, amount)],
            from: from.map(ProgramHash::from_address).transpose()?,
            memo: memo.map(str::to_string),
        })
    }

    /// Sidechain only: burns `amount` to the destroy address; the payload
    /// names the main-chain recipients.
    pub fn create_withdraw_transaction(
        &self,
        from: Option<&str>,
        amount: u64,
        payload: CrossChainPayload,
        memo: Option<&str>,
    ) -> Result<PendingTransaction, WalletError> {
        let link = self.kind().side_chain().ok_or_else(|| {
            WalletError::ValidationError(format!("{}: withdrawals are made from a sidechain", self.chain_id()))
        })?;
        for address in &payload.addresses {
            if ProgramHash::from_address(address)?.kind() != Some(AddressKind::Standard) {
                return Err(WalletError::InvalidAddress(format!(
                    "{} is not a standard {} address",
                    address, link.main_chain_id
                )));
            }
        }
        self.build(Draft {
            tx_type: TxType::WithdrawFromSideChain,
            payload: Payload::CrossChain(payload),
            outputs: vec![output(link.destroy_address, amount)],
            from: from.map(ProgramHash::from_address).transpose()?,
            memo: memo.map(str::to_string),
        })
    }

    /// Identity chain only: registers `payload`, which must be signed by
    /// `identity_key`. Only the fee is spent.
    pub fn create_id_transaction(
        &self,
        from: Option<&str>,
        payload: IdentityPayload,
        identity_key: &PublicKey,
        memo: Option<&str>,
    ) -> Result<PendingTransaction, WalletError> {
        if !matches!(self.kind(), ChainWalletKind::Identity(_)) {
            return Err(WalletError::ValidationError(format!(
                "{}: identities are registered on the identity chain",
                self.chain_id()
            )));
        }
        let id = ProgramHash::from_address(&payload.id)?;
        if id != ProgramHash::identity(identity_key) {
            return Err(WalletError::UnknownIdentity(format!("{} does not belong to the given key", payload.id)));
        }
        if !verify_message(identity_key, &payload.signing_bytes(), &payload.signature) {
            return Err(WalletError::ValidationError("Identity payload signature does not verify".to_string()));
        }
        self.build(Draft {
            tx_type: TxType::RegisterIdentification,
            payload: Payload::RegisterIdentification(payload),
            outputs: Vec::new(),
            from: from.map(ProgramHash::from_address).transpose()?,
            memo: memo.map(str::to_string),
        })
    }

    /// Fee `tx` costs at `fee_per_kb` once fully signed.
    pub fn calculate_transaction_fee(&self, tx: &Transaction, fee_per_kb: u64) -> u64 {
        fee_for_size(tx.estimated_size(), fee_per_kb)
    }

    fn build(&self, draft: Draft) -> Result<PendingTransaction, WalletError> {
        let amount = draft.outputs.iter().try_fold(0u64, |acc, o| {
            acc.checked_add(o.value)
                .ok_or_else(|| WalletError::ValidationError("Output sum overflow".to_string()))
        })?;

        let mut shell = Transaction::new(draft.tx_type);
        shell.payload = draft.payload;
        shell.memo = draft.memo;
        shell.outputs = draft.outputs;
        shell.validate_payload()?;

        let mut guard = self.state.write();
        let st = &mut *guard;
        let fee_per_kb = st.info.fee_per_kb;

        let (candidates, estimate_script, change_to) = match draft.from {
            Some(from) => {
                let script = Self::redeem_script(st, &from)
                    .ok_or_else(|| WalletError::NotFoundError(format!("{} is not an address of this wallet", from)))?;
                (Self::spendable(st, |h| *h == from), script, from)
            }
            None => {
                let first = st
                    .addresses
                    .first()
                    .ok_or_else(|| WalletError::InternalError("Wallet has no addresses".to_string()))?;
                let script = standard_redeem_script(&first.public_key);
                let change_to = first.program_hash;
                (Self::spendable(st, |h| st.slots.contains_key(h)), script, change_to)
            }
        };

        // upper bound: one program per input
        let estimate = |inputs: usize| {
            let mut tx = shell.clone();
            tx.outputs.push(output(change_to, 0));
            for _ in 0..inputs {
                tx.inputs.push(TxInput { previous: OutPoint { txid: Hash256::ZERO, index: 0 }, sequence: FINAL_SEQUENCE });
                tx.programs.push(Program::new(estimate_script.clone()));
            }
            fee_for_size(tx.estimated_size(), fee_per_kb)
        };
        let selection = UtxoSelector::select(&candidates, amount, estimate)?;

        let mut tx = shell;
        let mut spent_hashes: Vec<ProgramHash> = Vec::new();
        for utxo in &selection.utxos {
            tx.inputs.push(TxInput { previous: utxo.outpoint, sequence: FINAL_SEQUENCE });
            if !spent_hashes.contains(&utxo.program_hash) {
                spent_hashes.push(utxo.program_hash);
            }
        }
        for hash in &spent_hashes {
            let code = Self::redeem_script(st, hash)
                .ok_or_else(|| WalletError::InternalError(format!("No redeem script for {}", hash)))?;
            tx.programs.push(Program::new(code));
        }
        tx.outputs.push(output(change_to, 0));
        let fee = fee_for_size(tx.estimated_size(), fee_per_kb);
        let change = selection.total.saturating_sub(amount).saturating_sub(fee);
        match tx.outputs.last_mut() {
            Some(last) if change > 0 => last.value = change,
            _ => {
                tx.outputs.pop();
            }
        }
        tx.validate_payload()?;

        let txid = tx.txid();
        let external: u64 = tx.outputs.iter().filter(|o| !st.owns(&o.program_hash)).map(|o| o.value).sum();
        let (direction, moved) = if external > 0 || tx.outputs.is_empty() {
            (TxDirection::Sent, external)
        } else {
            (TxDirection::Moved, amount)
        };
        for input in &tx.inputs {
            st.locks.insert(input.previous, txid);
        }
        let pending = PendingTransaction {
            txid,
            chain_id: self.chain_id().to_string(),
            transaction: tx,
            status: TxStatus::Constructed,
            direction,
            amount: moved,
            fee: selection.total.saturating_sub(amount).saturating_sub(change),
            height: None,
            timestamp: None,
        };
        st.active.insert(txid, pending.clone());
        st.order.push(txid);
        drop(guard);

        info!(
            "{}: constructed {} ({} inputs, amount {}, fee {})",
            self.chain_id(),
            txid,
            pending.transaction.inputs.len(),
            amount,
            pending.fee
        );
        Ok(pending)
    }

    /// Confirmed, unlocked outputs on addresses accepted by `allowed`.
    fn spendable(st: &WalletState, allowed: impl Fn(&ProgramHash) -> bool) -> Vec<Utxo> {
        st.utxos
            .values()
            .filter(|u| u.height.is_some() && !st.locks.contains_key(&u.outpoint) && allowed(&u.program_hash))
            .cloned()
            .collect()
    }

    /// Adds this wallet's signatures. The transaction becomes `Signed` once
    /// every program has the signatures it needs; a multi-sig spend stays
    /// `Constructed` until enough cosigners have signed.
    pub fn sign(&self, txid: &Hash256, password: &str) -> Result<TxStatus, WalletError> {
        let (digest, plans, coin_type) = {
            let st = self.state.read();
            let pending = st
                .active
                .get(txid)
                .ok_or_else(|| WalletError::NotFoundError(format!("Transaction {} is not tracked", txid)))?;
            if !matches!(pending.status, TxStatus::Constructed | TxStatus::Signed) {
                return Err(WalletError::ValidationError(format!(
                    "Transaction {} is already {}",
                    txid,
                    pending.status.name()
                )));
            }
            let plans = Self::signing_plans(&st, &pending.transaction);
            (pending.transaction.signing_digest(), plans, st.info.coin_type)
        };
        if plans.is_empty() {
            return Err(WalletError::ValidationError(format!("Nothing left for this wallet to sign in {}", txid)));
        }

        let signatures = self.vault().with_seed(password, |seed| {
            plans
                .iter()
                .map(|plan| {
                    let key = ChainKeyDeriver::address_private(seed, coin_type, RECEIVE_BRANCH, plan.index)?;
                    let signature = sign_digest(&key.secret_key()?, &digest)?;
                    Ok((plan.program, plan.public_key, signature.to_vec()))
                })
                .collect::<Result<Vec<_>, WalletError>>()
        })?;

        let mut events = Vec::new();
        let status = {
            let mut st = self.state.write();
            let pending = st
                .active
                .get_mut(txid)
                .ok_or_else(|| WalletError::NotFoundError(format!("Transaction {} was dropped while signing", txid)))?;
            for (program, public_key, signature) in signatures {
                let Some(program) = pending.transaction.programs.get_mut(program) else {
                    continue;
                };
                attach_signature(program, &digest, public_key, signature)?;
            }
            let before = pending.status;
            if pending.transaction.is_fully_signed() {
                pending.status = TxStatus::Signed;
            }
            if pending.status != before {
                events.push(WalletEvent::TransactionStatusChanged { txid: *txid, status: pending.status, confirmations: 0 });
            }
            pending.status
        };
        info!("{}: signed {} ({})", self.chain_id(), txid, status.name());
        self.emit(events);
        Ok(status)
    }

    fn signing_plans(st: &WalletState, tx: &Transaction) -> Vec<SigningPlan> {
        let own = st.addresses.first();
        let mut plans = Vec::new();
        for (i, program) in tx.programs.iter().enumerate() {
            match script_kind(&program.code) {
                Some(AddressKind::Standard) => {
                    let Ok(hash) = program.program_hash() else {
                        continue;
                    };
                    let Some(address) = st.slots.get(&hash).and_then(|&slot| st.addresses.get(slot)) else {
                        continue;
                    };
                    if program.signatures.is_empty() {
                        plans.push(SigningPlan { program: i, index: address.index, public_key: address.public_key });
                    }
                }
                Some(AddressKind::MultiSig) => {
                    let (Some(own), Ok(config)) = (own, MultiSigConfig::from_redeem_script(&program.code)) else {
                        continue;
                    };
                    let signed = program.signatures.iter().any(|s| s.public_key == own.public_key);
                    if config.is_authorized_signer(&own.public_key) && !signed && !program.is_complete() {
                        plans.push(SigningPlan { program: i, index: own.index, public_key: own.public_key });
                    }
                }
                _ => {}
            }
        }
        plans
    }

    /// JSON form of a tracked transaction, for cosigners.
    pub fn export_transaction(&self, txid: &Hash256) -> Result<String, WalletError> {
        let st = self.state.read();
        let pending = st
            .get(txid)
            .ok_or_else(|| WalletError::NotFoundError(format!("Transaction {} is not tracked", txid)))?;
        Ok(serde_json::to_string(&pending.transaction)?)
    }

    /// Takes a (partially) signed transaction from a cosigner. Signatures
    /// that do not verify are discarded; valid ones are merged into the
    /// local copy if the transaction is already tracked.
    pub fn import_transaction(&self, json: &str) -> Result<PendingTransaction, WalletError> {
        let mut incoming: Transaction = serde_json::from_str(json)?;
        let txid = incoming.txid();
        let digest = incoming.signing_digest();
        for program in &mut incoming.programs {
            let offered = std::mem::take(&mut program.signatures);
            for sig in offered {
                if let Err(e) = attach_signature(program, &digest, sig.public_key, sig.signature) {
                    warn!("{}: discarding cosigner signature on {}: {}", self.chain_id(), txid, e);
                }
            }
        }

        let mut events = Vec::new();
        let pending = {
            let mut guard = self.state.write();
            let st = &mut *guard;
            match st.active.get_mut(&txid) {
                Some(existing) => {
                    if existing.transaction.programs.len() != incoming.programs.len() {
                        return Err(WalletError::ValidationError(format!("Programs of {} do not match", txid)));
                    }
                    for (local, remote) in existing.transaction.programs.iter_mut().zip(incoming.programs) {
                        if local.code != remote.code {
                            return Err(WalletError::ValidationError(format!("Programs of {} do not match", txid)));
                        }
                        for sig in remote.signatures {
                            attach_signature(local, &digest, sig.public_key, sig.signature)?;
                        }
                    }
                    existing.clone()
                }
                None => {
                    if st.archived.contains_key(&txid) {
                        return Err(WalletError::ValidationError(format!("Transaction {} is already settled", txid)));
                    }
                    let known_inputs: Vec<u64> = incoming
                        .inputs
                        .iter()
                        .filter_map(|i| st.utxos.get(&i.previous).map(|u| u.value))
                        .collect();
                    let total_out = incoming.total_output()?;
                    let fee = if known_inputs.len() == incoming.inputs.len() {
                        known_inputs.iter().sum::<u64>().saturating_sub(total_out)
                    } else {
                        0
                    };
                    let external: u64 =
                        incoming.outputs.iter().filter(|o| !st.owns(&o.program_hash)).map(|o| o.value).sum();
                    for input in &incoming.inputs {
                        if st.utxos.contains_key(&input.previous) {
                            st.locks.insert(input.previous, txid);
                        }
                    }
                    let pending = PendingTransaction {
                        txid,
                        chain_id: self.chain_id().to_string(),
                        transaction: incoming,
                        status: TxStatus::Constructed,
                        direction: if external > 0 { TxDirection::Sent } else { TxDirection::Moved },
                        amount: if external > 0 { external } else { total_out },
                        fee,
                        height: None,
                        timestamp: None,
                    };
                    st.active.insert(txid, pending.clone());
                    st.order.push(txid);
                    pending
                }
            }
        };

        let pending = {
            let mut st = self.state.write();
            match st.active.get_mut(&txid) {
                Some(p) if p.status == TxStatus::Constructed && p.transaction.is_fully_signed() => {
                    p.status = TxStatus::Signed;
                    events.push(WalletEvent::TransactionStatusChanged { txid, status: p.status, confirmations: 0 });
                    p.clone()
                }
                _ => pending,
            }
        };
        debug!("{}: imported {} ({})", self.chain_id(), txid, pending.status.name());
        self.emit(events);
        Ok(pending)
    }

    /// Hands a fully signed transaction to the sync worker. The outcome
    /// arrives later through `on_publish_result`; without a worker the
    /// transaction waits and is published when one is attached.
    pub fn broadcast(&self, txid: &Hash256) -> Result<(), WalletError> {
        let mut events = Vec::new();
        let tx = {
            let mut guard = self.state.write();
            let st = &mut *guard;
            let pending = st
                .active
                .get_mut(txid)
                .ok_or_else(|| WalletError::NotFoundError(format!("Transaction {} is not tracked", txid)))?;
            match pending.status {
                TxStatus::Signed => {
                    pending.status = TxStatus::Broadcast;
                    events.push(WalletEvent::TransactionAdded { txid: *txid });
                    events.push(WalletEvent::TransactionStatusChanged {
                        txid: *txid,
                        status: TxStatus::Broadcast,
                        confirmations: 0,
                    });
                    let tx = pending.transaction.clone();
                    Self::apply_outputs(st, &tx, None);
                    Self::update_balance(st, &mut events);
                    tx
                }
                TxStatus::Broadcast => pending.transaction.clone(),
                other => {
                    return Err(WalletError::ValidationError(format!(
                        "Transaction {} cannot be broadcast while {}",
                        txid,
                        other.name()
                    )))
                }
            }
        };
        self.emit(events);

        match self.publisher() {
            Some(handle) => {
                if let Err(e) = handle.publish(tx) {
                    warn!("{}: {} kept for republishing: {}", self.chain_id(), txid, e);
                }
            }
            None => info!("{}: {} queued until sync starts", self.chain_id(), txid),
        }
        Ok(())
    }

    /// Drops a transaction that has not been broadcast, releasing its inputs.
    pub fn cancel(&self, txid: &Hash256) -> Result<(), WalletError> {
        let mut events = Vec::new();
        {
            let mut guard = self.state.write();
            let st = &mut *guard;
            let status = st
                .active
                .get(txid)
                .map(|p| p.status)
                .ok_or_else(|| WalletError::NotFoundError(format!("Transaction {} is not tracked", txid)))?;
            if status.is_published() {
                return Err(WalletError::ValidationError(format!("Transaction {} was already broadcast", txid)));
            }
            Self::drop_transaction(st, txid, false, false, &mut events);
        }
        self.emit(events);
        Ok(())
    }
}

fn output(program_hash: ProgramHash, value: u64) -> TxOutput {
    TxOutput { value, program_hash, output_lock: 0 }
}

/// Verifies and stores one signature on `program`.
fn attach_signature(
    program: &mut Program,
    digest: &[u8; 32],
    public_key: PublicKey,
    signature: Vec<u8>,
) -> Result<(), WalletError> {
    match script_kind(&program.code) {
        Some(AddressKind::MultiSig) => {
            let config = MultiSigConfig::from_redeem_script(&program.code)?;
            SignatureCollector::new(&config, *digest).add(&mut program.signatures, public_key, signature)?;
        }
        Some(_) => {
            if script_public_key(&program.code) != Some(public_key) {
                return Err(WalletError::ValidationError("Signature key does not own the program".to_string()));
            }
            if !verify_digest(&public_key, digest, &signature) {
                return Err(WalletError::ValidationError("Invalid signature".to_string()));
            }
            if program.signatures.is_empty() {
                program.signatures.push(crate::crypto::multisig::CollectedSignature { public_key, signature });
            }
        }
        None => return Err(WalletError::ValidationError("Unrecognized redeem script".to_string())),
    }
    Ok(())
}
