use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Signature};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use std::sync::Arc;
use tracing::info;

use crate::{
    chain::LedgerClient,
    error::{AppResult, SettlementError},
    ledger::models::RewardInstruction,
};

/// Packs every reward of a cycle into one transaction and submits it
///
/// INVARIANT: a batch is submitted whole or not at all.
pub struct SettlementBatcher {
    client: Arc<dyn LedgerClient>,
    mint: Pubkey,
    max_rewards: usize,
}

impl SettlementBatcher {
    pub fn new(client: Arc<dyn LedgerClient>, mint: Pubkey, max_rewards: usize) -> Self {
        Self {
            client,
            mint,
            max_rewards,
        }
    }

    /// Two instructions per reward: create the recipient's token account if
    /// missing, then transfer from the authority's token account.
    pub fn build_instructions(&self, rewards: &[RewardInstruction]) -> AppResult<Vec<Instruction>> {
        let authority = self.client.authority();
        let token_program = spl_token::id();
        let source = get_associated_token_address(&authority, &self.mint);

        let mut instructions = Vec::with_capacity(rewards.len() * 2);
        for reward in rewards {
            let destination = get_associated_token_address(&reward.recipient, &self.mint);

            instructions.push(create_associated_token_account_idempotent(
                &authority,
                &reward.recipient,
                &self.mint,
                &token_program,
            ));

            let transfer = spl_token::instruction::transfer(
                &token_program,
                &source,
                &destination,
                &authority,
                &[],
                reward.amount,
            )
            .map_err(|e| SettlementError::InvalidInstruction(format!("{:?}", e)))?;
            instructions.push(transfer);
        }

        Ok(instructions)
    }

    /// Submit all rewards as one transaction. `None` when there is nothing to pay.
    pub async fn settle(&self, rewards: &[RewardInstruction]) -> AppResult<Option<Signature>> {
        if rewards.is_empty() {
            return Ok(None);
        }

        if rewards.len() > self.max_rewards {
            return Err(SettlementError::BatchTooLarge {
                count: rewards.len(),
                max: self.max_rewards,
            }
            .into());
        }

        let instructions = self.build_instructions(rewards)?;
        info!(
            "📤 Submitting {} rewards ({} instructions)",
            rewards.len(),
            instructions.len()
        );

        let signature = self.client.submit_transaction(&instructions).await?;
        Ok(Some(signature))
    }
}
