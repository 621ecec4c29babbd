//! Scripted in-memory ledger for pipeline tests.

use async_trait::async_trait;
use serde_json::json;
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Signature};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Mutex,
    },
};
use tokio::sync::mpsc;

use super::{models::*, traits::LedgerClient};
use crate::error::{AppResult, LedgerError, SettlementError};

pub fn signature(seed: u8) -> Signature {
    Signature::from([seed; 64])
}

pub fn system_program() -> String {
    solana_system_interface::program::ID.to_string()
}

pub fn transfer_instruction(from: &Pubkey, to: &Pubkey, lamports: u64) -> FetchedInstruction {
    FetchedInstruction {
        program_id: system_program(),
        parsed: Some(json!({
            "type": "transfer",
            "info": {
                "source": from.to_string(),
                "destination": to.to_string(),
                "lamports": lamports,
            }
        })),
    }
}

pub fn transfer_tx(sig: &Signature, slot: u64, from: &Pubkey, to: &Pubkey, lamports: u64) -> FetchedTransaction {
    FetchedTransaction {
        signature: sig.to_string(),
        slot,
        succeeded: true,
        instructions: vec![transfer_instruction(from, to, lamports)],
    }
}

pub fn notification(slot: u64) -> ChangeNotification {
    ChangeNotification {
        slot,
        snapshot: AccountSnapshot {
            lamports: 5_000_000_000,
            owner: system_program(),
        },
    }
}

pub struct ScriptedLedger {
    authority: Pubkey,
    blocks: Mutex<HashMap<u64, Vec<Signature>>>,
    transactions: Mutex<HashMap<String, FetchedTransaction>>,
    notifications: Mutex<Vec<ChangeNotification>>,
    reject_submissions: AtomicBool,
    fail_activity_lookup: AtomicBool,
    current_slot: AtomicU64,
    next_settlement: AtomicU8,
    pub fetch_batches: Mutex<Vec<usize>>,
    pub submissions: Mutex<Vec<Vec<Instruction>>>,
}

impl ScriptedLedger {
    pub fn new(authority: Pubkey) -> Self {
        Self {
            authority,
            blocks: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            notifications: Mutex::new(Vec::new()),
            reject_submissions: AtomicBool::new(false),
            fail_activity_lookup: AtomicBool::new(false),
            current_slot: AtomicU64::new(0),
            next_settlement: AtomicU8::new(200),
            fetch_batches: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Register a block; transactions are served when fetched
    pub fn add_block(&self, slot: u64, transactions: Vec<FetchedTransaction>) {
        let signatures = transactions
            .iter()
            .map(|tx| tx.signature.parse().unwrap())
            .collect();
        self.blocks.lock().unwrap().insert(slot, signatures);

        let mut known = self.transactions.lock().unwrap();
        for tx in transactions {
            known.insert(tx.signature.clone(), tx);
        }
    }

    /// Register a signature the node lists but cannot serve yet
    pub fn add_unavailable(&self, slot: u64, sig: Signature) {
        self.blocks
            .lock()
            .unwrap()
            .entry(slot)
            .or_default()
            .push(sig);
    }

    pub fn push_notification(&self, notification: ChangeNotification) {
        self.notifications.lock().unwrap().push(notification);
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    pub fn fail_activity_lookup(&self, fail: bool) {
        self.fail_activity_lookup.store(fail, Ordering::SeqCst);
    }

    pub fn set_current_slot(&self, slot: u64) {
        self.current_slot.store(slot, Ordering::SeqCst);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn subscribe_account_changes(
        &self,
        _address: Pubkey,
        buffer: usize,
    ) -> AppResult<mpsc::Receiver<ChangeNotification>> {
        let scripted: Vec<ChangeNotification> = self.notifications.lock().unwrap().drain(..).collect();
        let (sender, receiver) = mpsc::channel(buffer.max(scripted.len()).max(1));
        for notification in scripted {
            sender
                .try_send(notification)
                .map_err(|e| LedgerError::Subscription(e.to_string()))?;
        }
        Ok(receiver)
    }

    /// Every scripted block counts as activity on the watched account
    async fn slots_with_activity(
        &self,
        _address: &Pubkey,
        after: u64,
        through: u64,
    ) -> AppResult<Vec<u64>> {
        if self.fail_activity_lookup.load(Ordering::SeqCst) {
            return Err(LedgerError::Rpc {
                operation: "getSignaturesForAddress",
                message: "connection reset".to_string(),
            }
            .into());
        }

        let mut slots: Vec<u64> = self
            .blocks
            .lock()
            .unwrap()
            .keys()
            .copied()
            .filter(|slot| *slot > after && *slot <= through)
            .collect();
        slots.sort_unstable();
        Ok(slots)
    }

    async fn current_slot(&self) -> AppResult<u64> {
        Ok(self.current_slot.load(Ordering::SeqCst))
    }

    async fn list_transaction_signatures(&self, slot: u64) -> AppResult<Vec<Signature>> {
        self.blocks
            .lock()
            .unwrap()
            .get(&slot)
            .cloned()
            .ok_or_else(|| LedgerError::BlockUnavailable(slot).into())
    }

    async fn fetch_parsed_transactions(
        &self,
        signatures: &[Signature],
    ) -> AppResult<Vec<Option<FetchedTransaction>>> {
        self.fetch_batches.lock().unwrap().push(signatures.len());
        let known = self.transactions.lock().unwrap();
        Ok(signatures
            .iter()
            .map(|sig| known.get(&sig.to_string()).cloned())
            .collect())
    }

    async fn submit_transaction(&self, instructions: &[Instruction]) -> AppResult<Signature> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(SettlementError::Rejected("insufficient funds".to_string()).into());
        }

        self.submissions.lock().unwrap().push(instructions.to_vec());
        Ok(signature(self.next_settlement.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_account_balance(&self, _address: &Pubkey) -> AppResult<u64> {
        Ok(7_000_000_000)
    }

    fn authority(&self) -> Pubkey {
        self.authority
    }
}
