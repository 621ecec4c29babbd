use std::time::Duration;

use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire watcher
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Reward error: {0}")]
    Reward(#[from] RewardError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cycle timed out after {0:?}")]
    Timeout(Duration),

    #[error("Record {key} is already settled and cannot be overwritten")]
    AlreadySettled { key: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while talking to the external ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("RPC call {operation} failed: {message}")]
    Rpc {
        operation: &'static str,
        message: String,
    },

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Block for slot {0} is not available")]
    BlockUnavailable(u64),

    #[error("Transaction {0} is not available yet")]
    TransactionUnavailable(String),

    #[error("Transaction {signature} could not be decoded: {message}")]
    Undecodable { signature: String, message: String },

    #[error("Notification stream closed")]
    StreamClosed,
}

/// Settlement-related errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Batch of {count} rewards exceeds the per-transaction maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("Failed to build reward instruction: {0}")]
    InvalidInstruction(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

/// Reward conversion errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RewardError {
    #[error("Reward for {amount} lamports at ratio {ratio} overflows u64")]
    Overflow { amount: u64, ratio: u64 },
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::Config(format!("Validation failed: {}", message))
    }
}

impl AppError {
    /// Short, stable label used in persisted failure records
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Ledger(LedgerError::TransactionUnavailable(_))
            | AppError::Ledger(LedgerError::BlockUnavailable(_)) => "unavailable",
            AppError::Ledger(_) => "ledger",
            AppError::Settlement(SettlementError::Rejected(_)) => "rejected",
            AppError::Settlement(_) => "settlement",
            AppError::Reward(_) => "reward",
            AppError::Serialization(_) => "serialization",
            AppError::Config(_) => "config",
            AppError::Timeout(_) => "timeout",
            AppError::AlreadySettled { .. } => "already_settled",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether replaying the same slot can succeed without operator action.
    /// Oversized batches and overflowing rewards fail identically every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::Settlement(SettlementError::BatchTooLarge { .. })
                | AppError::Settlement(SettlementError::InvalidInstruction(_))
                | AppError::Reward(_)
                | AppError::Config(_)
        )
    }
}

/// Result type alias for the watcher
pub type AppResult<T> = Result<T, AppError>;
