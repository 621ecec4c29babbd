use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use uuid::Uuid;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Key of the last acknowledged slot
pub const CURRENT_KEY: &str = "current";

/// Key of the list of slots whose cycle failed
pub const ERROR_KEY: &str = "error";

/// Convert base units to a display amount with the given decimals
pub fn to_ui_amount(amount: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(amount as i128, decimals)
}

/// Incoming native transfer into the monitored account
///
/// Immutable once extracted; lives for one processing cycle and is then
/// embedded in the cycle's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    #[serde(with = "pubkey_string")]
    pub sender: Pubkey,
    pub lamports: u64,
    pub signature: String,
    pub slot: u64,
}

impl TransferEvent {
    pub fn sol(&self) -> Decimal {
        to_ui_amount(self.lamports, 9)
    }
}

/// Outgoing token reward for one transfer event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardInstruction {
    #[serde(with = "pubkey_string")]
    pub recipient: Pubkey,
    pub amount: u64,
    pub source_signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Settled,
    Failed,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Settled => "settled",
            ProcessingStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Persisted key of a processing record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// One record per processed slot
    Slot(u64),
    /// One audit record per source transaction
    Transfer(String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Slot(slot) => write!(f, "slot_{}", slot),
            RecordKey::Transfer(signature) => write!(f, "tx_{}", signature),
        }
    }
}

/// Outcome of a cycle (slot key) or of one transfer inside it (transfer key)
///
/// INVARIANT: once written with `Settled`, a record is never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub key: String,
    pub status: ProcessingStatus,
    pub cycle_id: Uuid,
    pub slot: u64,
    pub events: Vec<TransferEvent>,
    pub rewards: Vec<RewardInstruction>,
    pub settlement_id: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn pending(
        key: &RecordKey,
        cycle_id: Uuid,
        slot: u64,
        events: Vec<TransferEvent>,
        rewards: Vec<RewardInstruction>,
    ) -> Self {
        Self {
            key: key.to_string(),
            status: ProcessingStatus::Pending,
            cycle_id,
            slot,
            events,
            rewards,
            settlement_id: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Cycle that found nothing to pay
    pub fn no_op(slot: u64, cycle_id: Uuid) -> Self {
        let mut record = Self::pending(&RecordKey::Slot(slot), cycle_id, slot, vec![], vec![]);
        record.status = ProcessingStatus::Settled;
        record
    }

    pub fn failed_slot(slot: u64, cycle_id: Uuid, error: String) -> Self {
        let mut record = Self::pending(&RecordKey::Slot(slot), cycle_id, slot, vec![], vec![]);
        record.status = ProcessingStatus::Failed;
        record.error = Some(error);
        record
    }

    pub fn into_settled(mut self, settlement_id: String) -> Self {
        self.status = ProcessingStatus::Settled;
        self.settlement_id = Some(settlement_id);
        self.error = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn into_failed(mut self, error: String) -> Self {
        self.status = ProcessingStatus::Failed;
        self.error = Some(error);
        self.updated_at = Utc::now();
        self
    }

    pub fn is_settled(&self) -> bool {
        self.status == ProcessingStatus::Settled
    }
}

/// Pubkeys are persisted as base58 strings so records stay readable
mod pubkey_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(pubkey: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&pubkey.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pubkey::from_str(&raw).map_err(D::Error::custom)
    }
}
