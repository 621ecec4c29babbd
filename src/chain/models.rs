use serde_json::Value;

/// State of the monitored account as carried by a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub lamports: u64,
    pub owner: String,
}

/// Pushed by the ledger whenever the monitored account changes
///
/// Delivery is at-least-once and slots are not guaranteed to be monotonic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub slot: u64,
    pub snapshot: AccountSnapshot,
}

/// One top-level instruction of a fetched transaction
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedInstruction {
    pub program_id: String,
    /// `{"type": ..., "info": {...}}` when the RPC node could parse it
    pub parsed: Option<Value>,
}

/// Parsed transaction body, reduced to what the extractor reads
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedTransaction {
    pub signature: String,
    pub slot: u64,
    /// False when the transaction landed but its execution failed
    pub succeeded: bool,
    pub instructions: Vec<FetchedInstruction>,
}
