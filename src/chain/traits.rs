use async_trait::async_trait;
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Signature};
use tokio::sync::mpsc;

use super::models::{ChangeNotification, FetchedTransaction};
use crate::error::AppResult;

/// Everything the watcher needs from the external ledger
///
/// INVARIANTS:
/// - `fetch_parsed_transactions` answers in input order, `None` for bodies
///   the node cannot serve yet
/// - `submit_transaction` returns only once the transaction is confirmed,
///   and either all instructions land or none do
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Start forwarding change notifications for `address` into a bounded queue
    async fn subscribe_account_changes(
        &self,
        address: Pubkey,
        buffer: usize,
    ) -> AppResult<mpsc::Receiver<ChangeNotification>>;

    /// Slots in `(after, through]` holding transactions that touched `address`,
    /// ascending. Finds changes whose notification never arrived.
    async fn slots_with_activity(
        &self,
        address: &Pubkey,
        after: u64,
        through: u64,
    ) -> AppResult<Vec<u64>>;

    async fn current_slot(&self) -> AppResult<u64>;

    /// Transaction signatures recorded at `slot`, in block order
    async fn list_transaction_signatures(&self, slot: u64) -> AppResult<Vec<Signature>>;

    async fn fetch_parsed_transactions(
        &self,
        signatures: &[Signature],
    ) -> AppResult<Vec<Option<FetchedTransaction>>>;

    /// Sign with the authority and submit; the returned signature is the settlement id
    async fn submit_transaction(&self, instructions: &[Instruction]) -> AppResult<Signature>;

    async fn get_account_balance(&self, address: &Pubkey) -> AppResult<u64>;

    /// Fee payer, signer and owner of the reward token account
    fn authority(&self) -> Pubkey;
}
