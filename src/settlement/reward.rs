use crate::{
    error::RewardError,
    ledger::models::{RewardInstruction, TransferEvent},
};

/// Converts incoming lamports into reward token base units at a fixed ratio
#[derive(Debug, Clone, Copy)]
pub struct RewardCalculator {
    ratio: u64,
}

impl RewardCalculator {
    pub fn new(ratio: u64) -> Self {
        Self { ratio }
    }

    pub fn ratio(&self) -> u64 {
        self.ratio
    }

    /// `lamports * ratio`, exact or an error; never wraps or saturates
    pub fn reward_for(&self, lamports: u64) -> Result<u64, RewardError> {
        lamports
            .checked_mul(self.ratio)
            .ok_or(RewardError::Overflow {
                amount: lamports,
                ratio: self.ratio,
            })
    }

    pub fn instruction_for(&self, event: &TransferEvent) -> Result<RewardInstruction, RewardError> {
        Ok(RewardInstruction {
            recipient: event.sender,
            amount: self.reward_for(event.lamports)?,
            source_signature: event.signature.clone(),
        })
    }
}
