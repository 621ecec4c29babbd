use solana_sdk::signature::Signer;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    chain::{SolanaConfig, SolanaLedgerClient},
    config::Config,
    error::AppResult,
    funding::{MonitorSettings, TransferMonitor},
    ledger::{PgKvStore, ProcessingJournal},
};

/// Connect to the database and wrap it in the processing journal
pub async fn initialize_journal(config: &Config) -> AppResult<Arc<ProcessingJournal>> {
    let pool = initialize_database(&config.database_url).await?;
    Ok(Arc::new(ProcessingJournal::new(Arc::new(PgKvStore::new(pool)))))
}

pub async fn initialize_monitor(config: &Config) -> AppResult<TransferMonitor> {
    info!("Initializing watcher components ...");

    let journal = initialize_journal(config).await?;

    let keypair = config.load_authority_keypair()?;
    let authority = keypair.pubkey();
    info!("🔑 Reward authority: {}", authority);

    let settings = MonitorSettings::from_config(config, &authority)?;

    let solana_config = SolanaConfig {
        rpc_url: config.rpc_url.clone(),
        ws_url: config.websocket_url(),
        commitment: config.commitment.to_config(),
        ..SolanaConfig::default()
    };
    info!(
        "✅ Solana client configured: {} ({:?})",
        solana_config.rpc_url, config.commitment
    );
    let client = Arc::new(SolanaLedgerClient::new(solana_config, keypair));

    info!(
        "✅ Reward mint {} ({} decimals), up to {} rewards per transaction",
        settings.mint, settings.reward_decimals, settings.max_rewards_per_transaction
    );

    Ok(TransferMonitor::new(client, journal, settings))
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
