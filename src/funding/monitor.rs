use solana_sdk::pubkey::Pubkey;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{extractor::TransferExtractor, fetcher::BatchedFetcher};
use crate::{
    chain::{AccountSnapshot, ChangeNotification, LedgerClient},
    config::Config,
    error::{AppError, AppResult, LedgerError},
    ledger::{
        models::{to_ui_amount, ProcessingRecord, ProcessingStatus, RecordKey, TransferEvent},
        ProcessingJournal,
    },
    settlement::{RewardCalculator, SettlementBatcher},
};

/// Tunables of the watcher, resolved from configuration at startup
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub monitored: Pubkey,
    pub mint: Pubkey,
    pub reward_decimals: u32,
    pub conversion_ratio: u64,
    pub min_transfer_lamports: u64,
    pub fetch_batch_size: usize,
    pub fetch_delay: Duration,
    pub max_rewards_per_transaction: usize,
    pub cycle_timeout: Duration,
    pub notification_buffer: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &Config, authority: &Pubkey) -> AppResult<Self> {
        Ok(Self {
            monitored: config.monitored_pubkey(authority)?,
            mint: config.reward_mint_pubkey()?,
            reward_decimals: config.reward_decimals,
            conversion_ratio: config.conversion_ratio,
            min_transfer_lamports: config.min_transfer_lamports,
            fetch_batch_size: config.fetch_batch_size,
            fetch_delay: config.fetch_delay(),
            max_rewards_per_transaction: config.max_rewards_per_transaction,
            cycle_timeout: config.cycle_timeout(),
            notification_buffer: config.notification_buffer,
        })
    }
}

/// How a cycle ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Settled {
        settlement_id: String,
        rewards: usize,
    },
    /// Nothing qualifying in the slot; recorded as a settled no-op
    NoTransfers,
    /// The slot was completed by an earlier run
    AlreadySettled,
    /// An earlier attempt may have paid without recording it; left for the operator
    InDoubt,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub completed: Vec<u64>,
    pub failed: Vec<u64>,
    pub in_doubt: Vec<u64>,
}

/// Watches the monitored account and pays a reward for every incoming transfer
///
/// Notifications are consumed one at a time from a single queue, so cycles
/// never overlap and the journal needs no locking.
pub struct TransferMonitor {
    client: Arc<dyn LedgerClient>,
    journal: Arc<ProcessingJournal>,
    fetcher: BatchedFetcher,
    extractor: TransferExtractor,
    calculator: RewardCalculator,
    batcher: SettlementBatcher,
    settings: MonitorSettings,
    last_seen: u64,
}

impl TransferMonitor {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        journal: Arc<ProcessingJournal>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            fetcher: BatchedFetcher::new(
                client.clone(),
                settings.fetch_batch_size,
                settings.fetch_delay,
            ),
            extractor: TransferExtractor::new(settings.monitored, settings.min_transfer_lamports),
            calculator: RewardCalculator::new(settings.conversion_ratio),
            batcher: SettlementBatcher::new(
                client.clone(),
                settings.mint,
                settings.max_rewards_per_transaction,
            ),
            client,
            journal,
            settings,
            last_seen: 0,
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Load the acknowledged slot; `start_slot` only ever moves it forward
    pub async fn resume(&mut self, start_slot: Option<u64>) -> AppResult<u64> {
        let persisted = self.journal.last_seen().await?;
        self.last_seen = persisted.max(start_slot.unwrap_or(0));

        info!(
            "⏯️  Resuming after slot {} (persisted: {})",
            self.last_seen, persisted
        );
        Ok(self.last_seen)
    }

    /// Consume notifications until shutdown is signalled. A cycle in flight
    /// always runs to completion before shutdown is observed.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut notifications = self
            .client
            .subscribe_account_changes(self.settings.monitored, self.settings.notification_buffer)
            .await?;

        info!(
            "👀 Watching {} for incoming transfers (min {} lamports, ratio {})",
            self.settings.monitored,
            self.settings.min_transfer_lamports,
            self.calculator.ratio()
        );

        // Changes made while the watcher was down never produce a notification
        match self.client.current_slot().await {
            Ok(current) => {
                if let Err(e) = self.backfill(current).await {
                    warn!("Startup catch-up failed, the next change retries it: {}", e);
                }
            }
            Err(e) => warn!("Could not read the current slot, catching up with the next change: {}", e),
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("🛑 Shutdown requested, watcher stopping after slot {}", self.last_seen);
                    return Ok(());
                }
                next = notifications.recv() => match next {
                    Some(notification) => self.handle_notification(notification).await,
                    None => return Err(LedgerError::StreamClosed.into()),
                },
            }
        }
    }

    /// One notification, one cycle, preceded by any slots whose own
    /// notification was lost. Failures are recorded, never propagated.
    pub async fn handle_notification(&mut self, notification: ChangeNotification) {
        let slot = notification.slot;
        if slot <= self.last_seen {
            debug!(
                "Skipping stale notification for slot {} (last seen {})",
                slot, self.last_seen
            );
            return;
        }

        info!("🔔 Account change detected in slot {}", slot);

        // The next notification covers this slot again, since lastSeen stays put
        if let Err(e) = self.backfill(slot - 1).await {
            warn!(
                "Could not look up slots missed before {}, retrying with the next change: {}",
                slot, e
            );
            return;
        }

        // The outcome is already journaled; progress continues either way
        let _ = self.execute_cycle(slot).await;
        self.advance(slot).await;

        self.log_balance(&notification.snapshot).await;
    }

    /// Run a cycle for every slot in `(last_seen, through]` that touched the
    /// monitored account. A journal that never acknowledged a slot has no gap.
    async fn backfill(&mut self, through: u64) -> AppResult<()> {
        if self.last_seen == 0 || through <= self.last_seen {
            return Ok(());
        }

        let slots = self
            .client
            .slots_with_activity(&self.settings.monitored, self.last_seen, through)
            .await?;

        if !slots.is_empty() {
            info!(
                "⏪ Backfilling {} slots missed between {} and {}",
                slots.len(),
                self.last_seen,
                through
            );
        }

        for slot in slots {
            if slot <= self.last_seen || slot > through {
                continue;
            }
            let _ = self.execute_cycle(slot).await;
            self.advance(slot).await;
        }

        self.advance(through).await;
        Ok(())
    }

    async fn advance(&mut self, slot: u64) {
        self.last_seen = slot;
        if let Err(e) = self.journal.set_last_seen(slot).await {
            error!("Failed to persist last seen slot {}: {}", slot, e);
        }
    }

    /// Re-run cycles for specific slots without moving the acknowledged slot
    pub async fn replay(&self, slots: &[u64]) -> ReplaySummary {
        let mut summary = ReplaySummary::default();

        for &slot in slots {
            match self.execute_cycle(slot).await {
                Ok(CycleOutcome::InDoubt) => summary.in_doubt.push(slot),
                Ok(_) => {
                    if let Err(e) = self.journal.remove_failed_slot(slot).await {
                        error!("Failed to clear slot {} from the failure list: {}", slot, e);
                    }
                    summary.completed.push(slot);
                }
                Err(_) => summary.failed.push(slot),
            }
        }

        summary
    }

    /// Replay every slot currently on the failure list
    pub async fn replay_failed(&self) -> AppResult<ReplaySummary> {
        let slots = self.journal.failed_slots().await?;
        info!("🔁 Replaying {} failed slots", slots.len());
        Ok(self.replay(&slots).await)
    }

    /// Run a cycle under the timeout and journal its failure
    async fn execute_cycle(&self, slot: u64) -> AppResult<CycleOutcome> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", slot, %cycle_id);

        async {
            let timeout = self.settings.cycle_timeout;
            let result = match tokio::time::timeout(timeout, self.run_cycle(slot, cycle_id)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(timeout)),
            };

            match &result {
                Ok(CycleOutcome::Settled {
                    settlement_id,
                    rewards,
                }) => info!("✅ Paid {} rewards, tx {}", rewards, settlement_id),
                Ok(CycleOutcome::NoTransfers) => info!("✓ No qualifying transfers"),
                Ok(CycleOutcome::AlreadySettled) => info!("⏭️ Slot already settled"),
                Ok(CycleOutcome::InDoubt) => {
                    warn!("⚠️ Slot has an unfinished settlement attempt, needs manual review");
                    if let Err(e) = self.journal.push_failed_slot(slot).await {
                        error!("Failed to record in-doubt slot: {}", e);
                    }
                }
                Err(e) => {
                    error!("❌ Cycle failed: {}", e);
                    self.record_failure(slot, cycle_id, e).await;
                }
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn run_cycle(&self, slot: u64, cycle_id: Uuid) -> AppResult<CycleOutcome> {
        if let Some(existing) = self.journal.record(&RecordKey::Slot(slot)).await? {
            match existing.status {
                ProcessingStatus::Settled => return Ok(CycleOutcome::AlreadySettled),
                ProcessingStatus::Pending => return Ok(CycleOutcome::InDoubt),
                ProcessingStatus::Failed => {
                    info!("Retrying slot that previously failed: {:?}", existing.error)
                }
            }
        }

        let signatures = self.client.list_transaction_signatures(slot).await?;
        debug!("{} transactions in slot", signatures.len());

        let transactions = self.fetcher.fetch_all(&signatures).await?;
        let events = self.extractor.extract(slot, &transactions);

        let mut payable: Vec<Vec<TransferEvent>> = Vec::new();
        for group in group_by_transaction(events) {
            let signature = group[0].signature.clone();
            match self.journal.record(&RecordKey::Transfer(signature.clone())).await? {
                Some(record) if record.is_settled() => {
                    warn!("Transfer {} was already rewarded, skipping", signature);
                }
                Some(record) if record.status == ProcessingStatus::Pending => {
                    return Ok(CycleOutcome::InDoubt);
                }
                _ => payable.push(group),
            }
        }

        if payable.is_empty() {
            self.journal
                .write_record(&ProcessingRecord::no_op(slot, cycle_id))
                .await?;
            return Ok(CycleOutcome::NoTransfers);
        }

        let rewards = payable
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|event| self.calculator.instruction_for(event))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (event, reward) in payable.iter().flatten().zip(rewards.iter().flatten()) {
            info!(
                "Receive {} SOL from {} → reward {} tokens",
                event.sol(),
                event.sender,
                to_ui_amount(reward.amount, self.settings.reward_decimals)
            );
        }

        // One audit record per source transaction, holding all of its transfers
        let transfer_records: Vec<ProcessingRecord> = payable
            .iter()
            .zip(&rewards)
            .map(|(group, group_rewards)| {
                ProcessingRecord::pending(
                    &RecordKey::Transfer(group[0].signature.clone()),
                    cycle_id,
                    slot,
                    group.clone(),
                    group_rewards.clone(),
                )
            })
            .collect();
        let slot_record = ProcessingRecord::pending(
            &RecordKey::Slot(slot),
            cycle_id,
            slot,
            payable.into_iter().flatten().collect(),
            rewards.into_iter().flatten().collect(),
        );

        for record in &transfer_records {
            self.journal.write_record(record).await?;
        }
        self.journal.write_record(&slot_record).await?;

        let submitted = self.batcher.settle(&slot_record.rewards).await.and_then(|signature| {
            signature.ok_or_else(|| AppError::Internal("Non-empty batch was not submitted".into()))
        });

        match submitted {
            Ok(signature) => {
                let settlement_id = signature.to_string();
                for record in transfer_records {
                    self.journal
                        .write_record(&record.into_settled(settlement_id.clone()))
                        .await?;
                }

                let rewards = slot_record.rewards.len();
                self.journal
                    .write_record(&slot_record.into_settled(settlement_id.clone()))
                    .await?;

                Ok(CycleOutcome::Settled {
                    settlement_id,
                    rewards,
                })
            }
            Err(e @ AppError::Settlement(_)) => {
                // Refused before or by the ledger, nothing was paid
                for record in transfer_records {
                    if let Err(write_err) =
                        self.journal.write_record(&record.into_failed(e.to_string())).await
                    {
                        error!("Failed to mark transfer as failed: {}", write_err);
                    }
                }
                Err(e)
            }
            // Outcome unknown: transfer records stay pending so no retry pays them twice
            Err(e) => Err(e),
        }
    }

    async fn record_failure(&self, slot: u64, cycle_id: Uuid, error: &AppError) {
        let mut message = format!("{}: {}", error.kind(), error);
        if !error.is_retryable() {
            error!(
                "🚫 Slot {} fails the same way on every replay, its transfers need manual settlement",
                slot
            );
            message.push_str(" (permanent)");
        }
        let record = ProcessingRecord::failed_slot(slot, cycle_id, message);

        match self.journal.write_record(&record).await {
            Ok(()) | Err(AppError::AlreadySettled { .. }) => {}
            Err(e) => error!("Failed to record failure of slot {}: {}", slot, e),
        }

        if let Err(e) = self.journal.push_failed_slot(slot).await {
            error!("Failed to add slot {} to the failure list: {}", slot, e);
        }
    }

    async fn log_balance(&self, snapshot: &AccountSnapshot) {
        let lamports = match self.client.get_account_balance(&self.settings.monitored).await {
            Ok(lamports) => lamports,
            Err(e) => {
                warn!("Balance lookup failed, using notification snapshot: {}", e);
                snapshot.lamports
            }
        };

        info!("💰 Total SOL: {}", to_ui_amount(lamports, 9));
    }
}

/// Split extracted events into runs sharing a source transaction. The
/// extractor emits a transaction's transfers contiguously.
fn group_by_transaction(events: Vec<TransferEvent>) -> Vec<Vec<TransferEvent>> {
    let mut groups: Vec<Vec<TransferEvent>> = Vec::new();
    for event in events {
        match groups.last_mut() {
            Some(group) if group[0].signature == event.signature => group.push(event),
            _ => groups.push(vec![event]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::testing::*,
        ledger::{models::LAMPORTS_PER_SOL, MemoryKvStore},
    };
    use spl_token::instruction::TokenInstruction;

    const THRESHOLD: u64 = 10_000;
    const RATIO: u64 = 3;

    struct Harness {
        monitored: Pubkey,
        ledger: Arc<ScriptedLedger>,
        journal: Arc<ProcessingJournal>,
        monitor: TransferMonitor,
    }

    fn settings(monitored: Pubkey) -> MonitorSettings {
        MonitorSettings {
            monitored,
            mint: Pubkey::new_unique(),
            reward_decimals: 9,
            conversion_ratio: RATIO,
            min_transfer_lamports: THRESHOLD,
            fetch_batch_size: 2,
            fetch_delay: Duration::ZERO,
            max_rewards_per_transaction: 10,
            cycle_timeout: Duration::from_secs(5),
            notification_buffer: 8,
        }
    }

    fn harness() -> Harness {
        let monitored = Pubkey::new_unique();
        let ledger = Arc::new(ScriptedLedger::new(monitored));
        let journal = Arc::new(ProcessingJournal::new(Arc::new(MemoryKvStore::new())));
        let monitor = TransferMonitor::new(ledger.clone(), journal.clone(), settings(monitored));

        Harness {
            monitored,
            ledger,
            journal,
            monitor,
        }
    }

    fn transfer_amounts(instructions: &[solana_sdk::instruction::Instruction]) -> Vec<u64> {
        instructions
            .iter()
            .filter(|ix| ix.program_id == spl_token::id())
            .map(|ix| match TokenInstruction::unpack(&ix.data).unwrap() {
                TokenInstruction::Transfer { amount } => amount,
                other => panic!("unexpected instruction {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_normal_flow_pays_one_reward() {
        let mut h = harness();
        let sender = Pubkey::new_unique();
        h.ledger.add_block(
            100,
            vec![transfer_tx(&signature(1), 100, &sender, &h.monitored, 1_000_000)],
        );

        h.monitor.handle_notification(notification(100)).await;

        let submissions = h.ledger.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 1);
        assert_eq!(transfer_amounts(&submissions[0]), vec![3_000_000]);

        let record = h.journal.record(&RecordKey::Slot(100)).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Settled);
        assert!(record.settlement_id.is_some());
        assert_eq!(record.rewards[0].recipient, sender);
        assert_eq!(record.rewards[0].amount, 3_000_000);

        let transfer = h
            .journal
            .record(&RecordKey::Transfer(signature(1).to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.status, ProcessingStatus::Settled);
        assert_eq!(transfer.settlement_id, record.settlement_id);

        assert_eq!(h.monitor.last_seen(), 100);
        assert_eq!(h.journal.last_seen().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_dust_is_a_no_op_cycle() {
        let mut h = harness();
        h.ledger.add_block(
            7,
            vec![transfer_tx(&signature(1), 7, &Pubkey::new_unique(), &h.monitored, 5_000)],
        );

        h.monitor.handle_notification(notification(7)).await;

        assert_eq!(h.ledger.submission_count(), 0);
        let record = h.journal.record(&RecordKey::Slot(7)).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Settled);
        assert_eq!(record.settlement_id, None);
        assert!(h.journal.failed_slots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_unavailability_fails_cycle_but_advances() {
        let mut h = harness();
        let sender = Pubkey::new_unique();
        h.ledger.add_block(
            12,
            vec![
                transfer_tx(&signature(1), 12, &sender, &h.monitored, 50_000),
                transfer_tx(&signature(2), 12, &sender, &h.monitored, 60_000),
            ],
        );
        h.ledger.add_unavailable(12, signature(3));

        h.monitor.handle_notification(notification(12)).await;

        assert_eq!(h.ledger.submission_count(), 0);
        let record = h.journal.record(&RecordKey::Slot(12)).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(record.error.unwrap().starts_with("unavailable"));
        assert_eq!(h.journal.failed_slots().await.unwrap(), vec![12]);
        assert_eq!(h.monitor.last_seen(), 12);

        // the next change is processed normally
        h.ledger.add_block(
            13,
            vec![transfer_tx(&signature(4), 13, &sender, &h.monitored, 70_000)],
        );
        h.monitor.handle_notification(notification(13)).await;
        assert_eq!(h.ledger.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_multiple_senders_share_one_settlement() {
        let mut h = harness();
        let (a, b, c) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());
        h.ledger.add_block(
            40,
            vec![
                transfer_tx(&signature(1), 40, &a, &h.monitored, 10_000),
                transfer_tx(&signature(2), 40, &b, &h.monitored, 20_000),
                transfer_tx(&signature(3), 40, &c, &h.monitored, 30_000),
            ],
        );

        h.monitor.handle_notification(notification(40)).await;

        let submissions = h.ledger.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 1);
        assert_eq!(transfer_amounts(&submissions[0]), vec![30_000, 60_000, 90_000]);

        let slot_record = h.journal.record(&RecordKey::Slot(40)).await.unwrap().unwrap();
        let recipients: Vec<Pubkey> = slot_record.rewards.iter().map(|r| r.recipient).collect();
        assert_eq!(recipients, vec![a, b, c]);

        for seed in 1..=3 {
            let record = h
                .journal
                .record(&RecordKey::Transfer(signature(seed).to_string()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.settlement_id, slot_record.settlement_id);
        }
    }

    #[tokio::test]
    async fn test_rejected_submission_settles_nothing() {
        let mut h = harness();
        h.ledger.reject_submissions(true);
        h.ledger.add_block(
            21,
            vec![
                transfer_tx(&signature(1), 21, &Pubkey::new_unique(), &h.monitored, 50_000),
                transfer_tx(&signature(2), 21, &Pubkey::new_unique(), &h.monitored, 50_000),
            ],
        );

        h.monitor.handle_notification(notification(21)).await;

        let record = h.journal.record(&RecordKey::Slot(21)).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        for seed in 1..=2 {
            let transfer = h
                .journal
                .record(&RecordKey::Transfer(signature(seed).to_string()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(transfer.status, ProcessingStatus::Failed);
        }
        assert_eq!(h.journal.failed_slots().await.unwrap(), vec![21]);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_notifications_are_skipped() {
        let mut h = harness();
        h.ledger.add_block(
            50,
            vec![transfer_tx(&signature(1), 50, &Pubkey::new_unique(), &h.monitored, 50_000)],
        );

        h.monitor.handle_notification(notification(50)).await;
        h.monitor.handle_notification(notification(50)).await;
        h.monitor.handle_notification(notification(49)).await;

        assert_eq!(h.ledger.submission_count(), 1);
        assert_eq!(h.monitor.last_seen(), 50);
    }

    #[tokio::test]
    async fn test_restart_with_stale_pointer_does_not_pay_twice() {
        let mut h = harness();
        h.ledger.add_block(
            60,
            vec![transfer_tx(&signature(1), 60, &Pubkey::new_unique(), &h.monitored, 50_000)],
        );
        h.monitor.handle_notification(notification(60)).await;
        assert_eq!(h.ledger.submission_count(), 1);

        // a fresh process that lost its pointer sees the same change again
        let mut restarted =
            TransferMonitor::new(h.ledger.clone(), h.journal.clone(), settings(h.monitored));
        restarted.handle_notification(notification(60)).await;

        assert_eq!(h.ledger.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_transfer_is_left_in_doubt() {
        let mut h = harness();
        let sender = Pubkey::new_unique();
        h.ledger.add_block(
            70,
            vec![transfer_tx(&signature(1), 70, &sender, &h.monitored, 50_000)],
        );
        h.journal
            .write_record(&ProcessingRecord::pending(
                &RecordKey::Transfer(signature(1).to_string()),
                Uuid::new_v4(),
                69,
                vec![],
                vec![],
            ))
            .await
            .unwrap();

        h.monitor.handle_notification(notification(70)).await;

        assert_eq!(h.ledger.submission_count(), 0);
        assert_eq!(h.journal.failed_slots().await.unwrap(), vec![70]);
    }

    #[tokio::test]
    async fn test_overflowing_reward_fails_cycle() {
        let mut h = harness();
        h.ledger.add_block(
            80,
            vec![transfer_tx(&signature(1), 80, &Pubkey::new_unique(), &h.monitored, u64::MAX)],
        );

        h.monitor.handle_notification(notification(80)).await;

        assert_eq!(h.ledger.submission_count(), 0);
        let record = h.journal.record(&RecordKey::Slot(80)).await.unwrap().unwrap();
        assert!(record.error.unwrap().starts_with("reward"));
    }

    #[tokio::test]
    async fn test_replay_clears_recovered_slots() {
        let mut h = harness();
        let sender = Pubkey::new_unique();
        h.ledger.reject_submissions(true);
        h.ledger.add_block(
            90,
            vec![transfer_tx(&signature(1), 90, &sender, &h.monitored, LAMPORTS_PER_SOL)],
        );
        h.monitor.handle_notification(notification(90)).await;
        assert_eq!(h.journal.failed_slots().await.unwrap(), vec![90]);

        h.ledger.reject_submissions(false);
        let summary = h.monitor.replay(&[90, 91]).await;

        assert_eq!(summary.completed, vec![90]);
        assert_eq!(summary.failed, vec![91]);
        assert_eq!(h.ledger.submission_count(), 1);
        assert_eq!(h.journal.failed_slots().await.unwrap(), vec![91]);
        assert_eq!(h.monitor.last_seen(), 90);
    }

    #[tokio::test]
    async fn test_resume_prefers_higher_start_slot() {
        let mut h = harness();
        h.journal.set_last_seen(500).await.unwrap();

        assert_eq!(h.monitor.resume(None).await.unwrap(), 500);
        assert_eq!(h.monitor.resume(Some(400)).await.unwrap(), 500);
        assert_eq!(h.monitor.resume(Some(900)).await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_run_processes_queue_serially() {
        let mut h = harness();
        for (seed, slot) in [(1u8, 5u64), (2, 6)] {
            h.ledger.add_block(
                slot,
                vec![transfer_tx(&signature(seed), slot, &Pubkey::new_unique(), &h.monitored, 50_000)],
            );
            h.ledger.push_notification(notification(slot));
        }
        h.ledger.push_notification(notification(5));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = h.monitor.run(shutdown_rx).await.unwrap_err();

        assert!(matches!(err, AppError::Ledger(LedgerError::StreamClosed)));
        assert_eq!(h.ledger.submission_count(), 2);
        assert_eq!(h.monitor.last_seen(), 6);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut h = harness();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        h.monitor.run(shutdown_rx).await.unwrap();
        assert_eq!(h.monitor.last_seen(), 0);
    }

    #[tokio::test]
    async fn test_two_transfers_in_one_transaction_share_one_record() {
        let mut h = harness();
        let (a, b) = (Pubkey::new_unique(), Pubkey::new_unique());
        let mut tx = transfer_tx(&signature(2), 30, &a, &h.monitored, 20_000);
        tx.instructions
            .push(transfer_instruction(&b, &h.monitored, 40_000));
        h.ledger.add_block(30, vec![tx]);

        h.monitor.handle_notification(notification(30)).await;

        let submissions = h.ledger.submissions.lock().unwrap().clone();
        assert_eq!(submissions.len(), 1);
        assert_eq!(transfer_amounts(&submissions[0]), vec![60_000, 120_000]);

        let slot_record = h.journal.record(&RecordKey::Slot(30)).await.unwrap().unwrap();
        assert_eq!(slot_record.status, ProcessingStatus::Settled);
        assert!(slot_record.settlement_id.is_some());
        assert!(h.journal.failed_slots().await.unwrap().is_empty());

        let transfer = h
            .journal
            .record(&RecordKey::Transfer(signature(2).to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.status, ProcessingStatus::Settled);
        assert_eq!(transfer.events.len(), 2);
        assert_eq!(transfer.rewards.len(), 2);
        assert_eq!(transfer.settlement_id, slot_record.settlement_id);

        // replaying keeps the payout on record and pays nothing more
        let summary = h.monitor.replay(&[30]).await;
        assert_eq!(summary.completed, vec![30]);
        assert_eq!(h.ledger.submission_count(), 1);
        let after = h.journal.record(&RecordKey::Slot(30)).await.unwrap().unwrap();
        assert_eq!(after.settlement_id, slot_record.settlement_id);
    }

    #[test]
    fn test_group_by_transaction_keeps_order() {
        let event = |seed: u8| TransferEvent {
            sender: Pubkey::new_unique(),
            lamports: 10_000,
            signature: signature(seed).to_string(),
            slot: 1,
        };

        let groups = group_by_transaction(vec![event(1), event(1), event(2), event(3), event(3)]);

        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 2]);
        assert_eq!(groups[1][0].signature, signature(2).to_string());
    }

    #[tokio::test]
    async fn test_slots_between_notifications_are_backfilled() {
        let mut h = harness();
        let (a, b, c) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());
        h.ledger.add_block(
            10,
            vec![transfer_tx(&signature(1), 10, &a, &h.monitored, 10_000)],
        );
        h.ledger.add_block(
            12,
            vec![transfer_tx(&signature(2), 12, &b, &h.monitored, 20_000)],
        );
        h.ledger.add_block(
            15,
            vec![transfer_tx(&signature(3), 15, &c, &h.monitored, 30_000)],
        );

        h.monitor.handle_notification(notification(10)).await;
        // the change in slot 12 was never announced
        h.monitor.handle_notification(notification(15)).await;

        let submissions = h.ledger.submissions.lock().unwrap().clone();
        let amounts: Vec<Vec<u64>> = submissions.iter().map(|ix| transfer_amounts(ix)).collect();
        assert_eq!(amounts, vec![vec![30_000], vec![60_000], vec![90_000]]);

        let gap = h.journal.record(&RecordKey::Slot(12)).await.unwrap().unwrap();
        assert_eq!(gap.status, ProcessingStatus::Settled);
        assert_eq!(gap.rewards[0].recipient, b);
        assert_eq!(h.monitor.last_seen(), 15);
        assert_eq!(h.journal.last_seen().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_failed_gap_lookup_defers_to_next_change() {
        let mut h = harness();
        h.journal.set_last_seen(10).await.unwrap();
        h.monitor.resume(None).await.unwrap();
        h.ledger.add_block(
            12,
            vec![transfer_tx(&signature(1), 12, &Pubkey::new_unique(), &h.monitored, 50_000)],
        );
        h.ledger.add_block(
            15,
            vec![transfer_tx(&signature(2), 15, &Pubkey::new_unique(), &h.monitored, 50_000)],
        );
        h.ledger.add_block(16, vec![]);

        h.ledger.fail_activity_lookup(true);
        h.monitor.handle_notification(notification(15)).await;
        assert_eq!(h.ledger.submission_count(), 0);
        assert_eq!(h.monitor.last_seen(), 10);

        h.ledger.fail_activity_lookup(false);
        h.monitor.handle_notification(notification(16)).await;

        assert_eq!(h.ledger.submission_count(), 2);
        assert_eq!(h.monitor.last_seen(), 16);
        for slot in [12, 15, 16] {
            let record = h.journal.record(&RecordKey::Slot(slot)).await.unwrap().unwrap();
            assert_eq!(record.status, ProcessingStatus::Settled, "slot {}", slot);
        }
    }

    #[tokio::test]
    async fn test_run_catches_up_on_changes_made_while_down() {
        let mut h = harness();
        h.journal.set_last_seen(10).await.unwrap();
        h.monitor.resume(None).await.unwrap();
        h.ledger.add_block(
            14,
            vec![transfer_tx(&signature(1), 14, &Pubkey::new_unique(), &h.monitored, 50_000)],
        );
        h.ledger.set_current_slot(20);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = h.monitor.run(shutdown_rx).await.unwrap_err();

        assert!(matches!(err, AppError::Ledger(LedgerError::StreamClosed)));
        assert_eq!(h.ledger.submission_count(), 1);
        assert_eq!(h.monitor.last_seen(), 20);
    }

    #[tokio::test]
    async fn test_oversized_slot_is_flagged_permanent() {
        let monitored = Pubkey::new_unique();
        let ledger = Arc::new(ScriptedLedger::new(monitored));
        let journal = Arc::new(ProcessingJournal::new(Arc::new(MemoryKvStore::new())));
        let mut tight = settings(monitored);
        tight.max_rewards_per_transaction = 2;
        let mut monitor = TransferMonitor::new(ledger.clone(), journal.clone(), tight);

        ledger.add_block(
            50,
            (1..=3)
                .map(|seed| {
                    transfer_tx(&signature(seed), 50, &Pubkey::new_unique(), &monitored, 50_000)
                })
                .collect(),
        );

        monitor.handle_notification(notification(50)).await;

        assert_eq!(ledger.submission_count(), 0);
        let record = journal.record(&RecordKey::Slot(50)).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(record.error.unwrap().ends_with("(permanent)"));
        assert_eq!(journal.failed_slots().await.unwrap(), vec![50]);
    }
}
