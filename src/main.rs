mod bootstrap;
mod chain;
mod config;
mod error;
mod funding;
mod ledger;
mod settlement;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::Config,
    ledger::models::RecordKey,
};

/// Rewards every incoming SOL transfer to a watched account with SPL tokens
#[derive(Parser, Debug)]
#[command(name = "watcher")]
#[command(about = "Watches an account for incoming transfers and pays token rewards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow account changes and settle rewards (default)
    Watch,
    /// Re-run processing for specific slots
    Replay {
        /// Slots to process again
        #[arg(required_unless_present = "failed")]
        slots: Vec<u64>,

        /// Replay every slot on the failure list
        #[arg(long, conflicts_with = "slots")]
        failed: bool,
    },
    /// Show the acknowledged slot and the failure list
    Status,
}

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,reward_relay=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load().context("invalid watcher configuration")?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => run_watcher(config).await,
        Command::Replay { slots, failed } => run_replay(config, slots, failed).await,
        Command::Status => show_status(config).await,
    }
}

async fn run_watcher(config: Config) -> anyhow::Result<()> {
    info!("🚀 Starting transfer watcher");

    let mut monitor = bootstrap::initialize_monitor(&config)
        .await
        .context("failed to initialize watcher")?;
    monitor.resume(config.start_slot).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received Ctrl+C, finishing current cycle");
        let _ = shutdown_tx.send(true);
    });

    monitor.run(shutdown_rx).await?;

    info!("👋 Watcher stopped at slot {}", monitor.last_seen());
    Ok(())
}

async fn run_replay(config: Config, slots: Vec<u64>, failed: bool) -> anyhow::Result<()> {
    let monitor = bootstrap::initialize_monitor(&config)
        .await
        .context("failed to initialize watcher")?;

    let summary = if failed {
        monitor.replay_failed().await?
    } else {
        monitor.replay(&slots).await
    };

    info!("Replay completed for slots {:?}", summary.completed);
    if !summary.in_doubt.is_empty() {
        warn!(
            "Slots {:?} have unfinished settlement attempts, check them before retrying",
            summary.in_doubt
        );
    }
    if !summary.failed.is_empty() {
        anyhow::bail!("replay failed for slots {:?}", summary.failed);
    }

    Ok(())
}

async fn show_status(config: Config) -> anyhow::Result<()> {
    let journal = bootstrap::initialize_journal(&config).await?;

    let last_seen = journal.last_seen().await?;
    let failed = journal.failed_slots().await?;

    println!("Last acknowledged slot: {}", last_seen);
    println!("Failed slots: {}", failed.len());

    for slot in failed {
        match journal.record(&RecordKey::Slot(slot)).await? {
            Some(record) => println!(
                "  {} [{}] cycle {} {}",
                record.key,
                record.status,
                record.cycle_id,
                record.error.unwrap_or_default()
            ),
            None => println!("  slot_{} [no record]", slot),
        }
    }

    Ok(())
}
