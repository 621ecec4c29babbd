use serde::Deserialize;
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use std::{collections::HashSet, str::FromStr};
use tracing::{debug, warn};

use crate::{
    chain::{FetchedInstruction, FetchedTransaction},
    ledger::models::TransferEvent,
};

/// System program instruction types that move lamports between wallets
const NATIVE_TRANSFER_TYPES: [&str; 2] = ["transfer", "transferWithSeed"];

#[derive(Debug, Deserialize)]
struct ParsedSystemInstruction {
    #[serde(rename = "type")]
    kind: String,
    info: Value,
}

#[derive(Debug, Deserialize)]
struct TransferInfo {
    source: String,
    destination: String,
    lamports: u64,
}

/// Turns fetched transactions into incoming transfer events for one account
pub struct TransferExtractor {
    monitored: Pubkey,
    min_lamports: u64,
    system_program: String,
}

impl TransferExtractor {
    pub fn new(monitored: Pubkey, min_lamports: u64) -> Self {
        Self {
            monitored,
            min_lamports,
            system_program: solana_system_interface::program::ID.to_string(),
        }
    }

    /// Events in transaction order, then instruction order. Anything that is
    /// not a qualifying native transfer is dropped without error.
    pub fn extract(&self, slot: u64, transactions: &[FetchedTransaction]) -> Vec<TransferEvent> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for transaction in transactions {
            if !seen.insert(transaction.signature.as_str()) {
                debug!("Skipping repeated transaction {}", transaction.signature);
                continue;
            }

            if !transaction.succeeded {
                continue;
            }

            for instruction in &transaction.instructions {
                if let Some((sender, lamports)) = self.incoming_transfer(instruction) {
                    events.push(TransferEvent {
                        sender,
                        lamports,
                        signature: transaction.signature.clone(),
                        slot,
                    });
                }
            }
        }

        events
    }

    fn incoming_transfer(&self, instruction: &FetchedInstruction) -> Option<(Pubkey, u64)> {
        if instruction.program_id != self.system_program {
            return None;
        }

        let parsed: ParsedSystemInstruction =
            serde_json::from_value(instruction.parsed.clone()?).ok()?;
        if !NATIVE_TRANSFER_TYPES.contains(&parsed.kind.as_str()) {
            return None;
        }

        let info: TransferInfo = serde_json::from_value(parsed.info).ok()?;
        let destination = Pubkey::from_str(&info.destination).ok()?;
        if destination != self.monitored {
            return None;
        }

        if info.lamports < self.min_lamports {
            debug!(
                "Ignoring dust transfer of {} lamports from {}",
                info.lamports, info.source
            );
            return None;
        }

        match Pubkey::from_str(&info.source) {
            Ok(sender) => Some((sender, info.lamports)),
            Err(_) => {
                warn!("Transfer with unparseable source {}", info.source);
                None
            }
        }
    }
}
