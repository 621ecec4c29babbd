use async_trait::async_trait;
use futures::StreamExt;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_client::GetConfirmedSignaturesForAddress2Config,
    rpc_config::{
        CommitmentConfig, RpcAccountInfoConfig, RpcBlockConfig, RpcTransactionConfig,
    },
    rpc_request::{RpcError, RpcRequest},
};
use serde_json::{json, Value};
use solana_sdk::{
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use solana_transaction_status_client_types::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, TransactionDetails,
    UiInstruction, UiMessage, UiParsedInstruction, UiTransactionEncoding,
};
use std::{collections::BTreeSet, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    models::*,
    traits::LedgerClient,
};
use crate::error::{AppError, AppResult, LedgerError, SettlementError};

/// Largest page `getSignaturesForAddress` serves
const SIGNATURE_PAGE_LIMIT: usize = 1000;

/// Skipped slot, block not available, long-term storage miss
const BLOCK_UNAVAILABLE_CODES: [i64; 3] = [-32004, -32007, -32009];

#[derive(Debug, Clone)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub commitment: CommitmentConfig,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for SolanaConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            ws_url: "ws://127.0.0.1:8900".to_string(),
            commitment: CommitmentConfig::confirmed(),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

pub struct SolanaLedgerClient {
    config: SolanaConfig,
    client: RpcClient,
    authority: Arc<Keypair>,
}

impl SolanaLedgerClient {
    pub fn new(config: SolanaConfig, authority: Keypair) -> Self {
        let client = RpcClient::new_with_commitment(config.rpc_url.clone(), config.commitment);

        Self {
            config,
            client,
            authority: Arc::new(authority),
        }
    }

    fn transaction_config(&self) -> RpcTransactionConfig {
        RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::JsonParsed),
            commitment: Some(self.config.commitment),
            max_supported_transaction_version: Some(0),
        }
    }

    async fn fetch_one(&self, signature: &Signature) -> AppResult<Option<FetchedTransaction>> {
        let response: Value = self
            .client
            .send(
                RpcRequest::GetTransaction,
                json!([signature.to_string(), self.transaction_config()]),
            )
            .await
            .map_err(|e| rpc_error("getTransaction", e))?;

        Ok(parse_transaction_response(signature, response)?)
    }

    async fn simulate(&self, transaction: &Transaction) -> AppResult<()> {
        let result = self
            .client
            .simulate_transaction(transaction)
            .await
            .map_err(|e| SettlementError::Rejected(format!("Simulation error: {}", e)))?;

        if let Some(err) = result.value.err {
            return Err(SettlementError::Rejected(format!(
                "Transaction would fail: {:?}",
                err
            ))
            .into());
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerClient for SolanaLedgerClient {
    async fn subscribe_account_changes(
        &self,
        address: Pubkey,
        buffer: usize,
    ) -> AppResult<mpsc::Receiver<ChangeNotification>> {
        let (sender, receiver) = mpsc::channel(buffer);

        tokio::spawn(forward_account_changes(
            self.config.clone(),
            address,
            sender,
        ));

        Ok(receiver)
    }

    async fn slots_with_activity(
        &self,
        address: &Pubkey,
        after: u64,
        through: u64,
    ) -> AppResult<Vec<u64>> {
        let mut slots = BTreeSet::new();
        let mut before = None;

        // History is returned newest first; page back until `after` is passed
        loop {
            let config = GetConfirmedSignaturesForAddress2Config {
                before,
                until: None,
                limit: Some(SIGNATURE_PAGE_LIMIT),
                commitment: Some(self.config.commitment),
            };
            let page = self
                .client
                .get_signatures_for_address_with_config(address, config)
                .await
                .map_err(|e| rpc_error("getSignaturesForAddress", e))?;

            slots.extend(
                page.iter()
                    .map(|entry| entry.slot)
                    .filter(|slot| *slot > after && *slot <= through),
            );

            let Some(oldest) = page.last() else { break };
            if page.len() < SIGNATURE_PAGE_LIMIT || oldest.slot <= after {
                break;
            }

            before = Some(Signature::from_str(&oldest.signature).map_err(|_| {
                LedgerError::Undecodable {
                    signature: oldest.signature.clone(),
                    message: "malformed signature in address history".to_string(),
                }
            })?);
        }

        Ok(slots.into_iter().collect())
    }

    async fn current_slot(&self) -> AppResult<u64> {
        let slot = self
            .client
            .get_slot()
            .await
            .map_err(|e| rpc_error("getSlot", e))?;

        Ok(slot)
    }

    async fn list_transaction_signatures(&self, slot: u64) -> AppResult<Vec<Signature>> {
        let config = RpcBlockConfig {
            encoding: None,
            transaction_details: Some(TransactionDetails::Signatures),
            rewards: Some(false),
            commitment: Some(self.config.commitment),
            max_supported_transaction_version: Some(0),
        };

        let block = match self.client.get_block_with_config(slot, config).await {
            Ok(block) => block,
            Err(e) if is_block_unavailable(&e) => {
                return Err(LedgerError::BlockUnavailable(slot).into());
            }
            Err(e) => return Err(rpc_error("getBlock", e).into()),
        };

        block
            .signatures
            .unwrap_or_default()
            .iter()
            .map(|raw| {
                Signature::from_str(raw).map_err(|_| {
                    LedgerError::Undecodable {
                        signature: raw.clone(),
                        message: "malformed signature in block".to_string(),
                    }
                    .into()
                })
            })
            .collect()
    }

    async fn fetch_parsed_transactions(
        &self,
        signatures: &[Signature],
    ) -> AppResult<Vec<Option<FetchedTransaction>>> {
        // One bulk round: every lookup of the batch is in flight at once
        futures::future::try_join_all(signatures.iter().map(|sig| self.fetch_one(sig))).await
    }

    async fn submit_transaction(&self, instructions: &[Instruction]) -> AppResult<Signature> {
        let recent_blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .map_err(|e| rpc_error("getLatestBlockhash", e))?;

        let message = Message::new(instructions, Some(&self.authority.pubkey()));
        let transaction = Transaction::new(&[&*self.authority], message, recent_blockhash);

        self.simulate(&transaction).await?;

        let signature = self
            .client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| match e.kind() {
                // Refused by preflight or by the runtime, nothing landed
                ClientErrorKind::TransactionError(_)
                | ClientErrorKind::RpcError(RpcError::RpcResponseError { .. }) => {
                    AppError::from(SettlementError::Rejected(format!("Send failed: {}", e)))
                }
                _ => rpc_error("sendTransaction", e).into(),
            })?;

        info!("✅ Transaction confirmed on-chain: {}", signature);
        Ok(signature)
    }

    async fn get_account_balance(&self, address: &Pubkey) -> AppResult<u64> {
        let balance = self
            .client
            .get_balance(address)
            .await
            .map_err(|e| rpc_error("getBalance", e))?;

        Ok(balance)
    }

    fn authority(&self) -> Pubkey {
        self.authority.pubkey()
    }
}

/// Keep an `accountSubscribe` stream alive and push every change into `sender`.
/// Reconnects with exponential backoff until the receiving side is dropped.
async fn forward_account_changes(
    config: SolanaConfig,
    address: Pubkey,
    sender: mpsc::Sender<ChangeNotification>,
) {
    let mut backoff = config.reconnect_min;

    while !sender.is_closed() {
        match PubsubClient::new(&config.ws_url).await {
            Ok(client) => {
                let subscribe_config = RpcAccountInfoConfig {
                    commitment: Some(config.commitment),
                    ..Default::default()
                };

                match client.account_subscribe(&address, Some(subscribe_config)).await {
                    Ok((mut stream, unsubscribe)) => {
                        info!("📡 Subscribed to account changes of {}", address);
                        backoff = config.reconnect_min;

                        while let Some(response) = stream.next().await {
                            let notification = ChangeNotification {
                                slot: response.context.slot,
                                snapshot: AccountSnapshot {
                                    lamports: response.value.lamports,
                                    owner: response.value.owner.clone(),
                                },
                            };

                            if sender.send(notification).await.is_err() {
                                unsubscribe().await;
                                return;
                            }
                        }

                        unsubscribe().await;
                        warn!("Account subscription for {} ended", address);
                    }
                    Err(e) => error!("accountSubscribe for {} failed: {}", address, e),
                }

                if let Err(e) = client.shutdown().await {
                    debug!("Pubsub shutdown error: {}", e);
                }
            }
            Err(e) => error!("Failed to connect to {}: {}", config.ws_url, e),
        }

        if sender.is_closed() {
            break;
        }

        warn!("Reconnecting account subscription in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

fn rpc_error(operation: &'static str, error: ClientError) -> LedgerError {
    LedgerError::Rpc {
        operation,
        message: error.to_string(),
    }
}

fn is_block_unavailable(error: &ClientError) -> bool {
    matches!(
        error.kind(),
        ClientErrorKind::RpcError(RpcError::RpcResponseError { code, .. })
            if BLOCK_UNAVAILABLE_CODES.contains(code)
    )
}

/// `null` means the node has not indexed the transaction yet; anything else
/// that does not decode is a malformed response
fn parse_transaction_response(
    signature: &Signature,
    response: Value,
) -> Result<Option<FetchedTransaction>, LedgerError> {
    let confirmed: Option<EncodedConfirmedTransactionWithStatusMeta> =
        serde_json::from_value(response).map_err(|e| LedgerError::Undecodable {
            signature: signature.to_string(),
            message: e.to_string(),
        })?;

    match confirmed {
        Some(confirmed) => decode_transaction(signature, confirmed).map(Some),
        None => {
            debug!("Transaction {} not available yet", signature);
            Ok(None)
        }
    }
}

fn decode_transaction(
    signature: &Signature,
    confirmed: EncodedConfirmedTransactionWithStatusMeta,
) -> Result<FetchedTransaction, LedgerError> {
    let undecodable = |message: &str| LedgerError::Undecodable {
        signature: signature.to_string(),
        message: message.to_string(),
    };

    let succeeded = confirmed
        .transaction
        .meta
        .as_ref()
        .map(|meta| meta.err.is_none())
        .unwrap_or(true);

    let ui_transaction = match confirmed.transaction.transaction {
        EncodedTransaction::Json(ui_transaction) => ui_transaction,
        _ => return Err(undecodable("expected jsonParsed encoding")),
    };

    let message = match ui_transaction.message {
        UiMessage::Parsed(message) => message,
        UiMessage::Raw(_) => return Err(undecodable("expected a parsed message")),
    };

    let instructions = message
        .instructions
        .into_iter()
        .map(|instruction| match instruction {
            UiInstruction::Parsed(UiParsedInstruction::Parsed(parsed)) => FetchedInstruction {
                program_id: parsed.program_id,
                parsed: Some(parsed.parsed),
            },
            UiInstruction::Parsed(UiParsedInstruction::PartiallyDecoded(partial)) => {
                FetchedInstruction {
                    program_id: partial.program_id,
                    parsed: None,
                }
            }
            UiInstruction::Compiled(compiled) => FetchedInstruction {
                program_id: message
                    .account_keys
                    .get(compiled.program_id_index as usize)
                    .map(|key| key.pubkey.clone())
                    .unwrap_or_default(),
                parsed: None,
            },
        })
        .collect();

    Ok(FetchedTransaction {
        signature: signature.to_string(),
        slot: confirmed.slot,
        succeeded,
        instructions,
    })
}
