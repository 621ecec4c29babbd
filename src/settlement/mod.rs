// Reward conversion and batched payout
pub mod batcher;
pub mod reward;

pub use batcher::SettlementBatcher;
pub use reward::RewardCalculator;
