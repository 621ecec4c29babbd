use futures::{stream, Stream, StreamExt, TryStreamExt};
use solana_sdk::signature::Signature;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    chain::{FetchedTransaction, LedgerClient},
    error::{AppError, AppResult, LedgerError},
};

/// Pulls full transaction bodies in bounded batches, pausing between
/// consecutive batch requests to stay under the node's rate limits.
pub struct BatchedFetcher {
    client: Arc<dyn LedgerClient>,
    batch_size: usize,
    delay: Duration,
}

impl BatchedFetcher {
    pub fn new(client: Arc<dyn LedgerClient>, batch_size: usize, delay: Duration) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            delay,
        }
    }

    /// Lazy stream of bodies in input order. Nothing is requested until polled
    /// and each call fetches again from scratch.
    pub fn stream<'a>(
        &'a self,
        signatures: &'a [Signature],
    ) -> impl Stream<Item = AppResult<FetchedTransaction>> + 'a {
        stream::iter(signatures.chunks(self.batch_size).enumerate())
            .then(move |(index, batch)| async move {
                if index > 0 && !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.fetch_batch(index, batch).await
            })
            .map_ok(|transactions| stream::iter(transactions.into_iter().map(Ok::<_, AppError>)))
            .try_flatten()
    }

    /// All bodies or the first failure; partial results are discarded
    pub async fn fetch_all(&self, signatures: &[Signature]) -> AppResult<Vec<FetchedTransaction>> {
        self.stream(signatures).try_collect().await
    }

    async fn fetch_batch(
        &self,
        index: usize,
        batch: &[Signature],
    ) -> AppResult<Vec<FetchedTransaction>> {
        debug!("Fetching batch {} ({} signatures)", index, batch.len());

        let bodies = self.client.fetch_parsed_transactions(batch).await?;
        if bodies.len() != batch.len() {
            return Err(AppError::Internal(format!(
                "Requested {} transactions, received {}",
                batch.len(),
                bodies.len()
            )));
        }

        batch
            .iter()
            .zip(bodies)
            .map(|(signature, body)| {
                body.ok_or_else(|| LedgerError::TransactionUnavailable(signature.to_string()).into())
            })
            .collect()
    }
}
