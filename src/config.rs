use std::{path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;
use solana_client::rpc_config::CommitmentConfig;
use solana_sdk::{pubkey::Pubkey, signature::Keypair};
use validator::Validate;

use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn to_config(self) -> CommitmentConfig {
        match self {
            Commitment::Processed => CommitmentConfig::processed(),
            Commitment::Confirmed => CommitmentConfig::confirmed(),
            Commitment::Finalized => CommitmentConfig::finalized(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct Config {
    #[serde(default = "default_rpc_url")]
    #[validate(url)]
    pub rpc_url: String,

    /// Websocket endpoint; derived from `rpc_url` when unset
    #[serde(default)]
    pub ws_url: Option<String>,

    #[serde(default)]
    pub commitment: Commitment,

    #[validate(length(min = 1))]
    pub database_url: String,

    /// JSON byte-array keypair (solana-keygen format)
    pub authority_keypair_path: PathBuf,

    /// Account to watch; the authority's own address when unset
    #[serde(default)]
    pub monitored_address: Option<String>,

    pub reward_mint: String,

    #[serde(default = "default_reward_decimals")]
    #[validate(range(max = 18))]
    pub reward_decimals: u32,

    /// Reward base units paid per incoming lamport
    #[validate(range(min = 1))]
    pub conversion_ratio: u64,

    #[validate(range(min = 1))]
    pub min_transfer_lamports: u64,

    #[serde(default = "default_fetch_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub fetch_batch_size: usize,

    #[serde(default = "default_fetch_delay_ms")]
    pub fetch_delay_ms: u64,

    /// Each reward is an idempotent ATA creation plus a token transfer; the
    /// packet size limit is reached a little above 12 of them.
    #[serde(default = "default_max_rewards_per_transaction")]
    #[validate(range(min = 1, max = 12))]
    pub max_rewards_per_transaction: usize,

    #[serde(default = "default_cycle_timeout_secs")]
    #[validate(range(min = 1))]
    pub cycle_timeout_secs: u64,

    #[serde(default = "default_notification_buffer")]
    #[validate(range(min = 1))]
    pub notification_buffer: usize,

    /// Lower bound for the last acknowledged slot at startup
    #[serde(default)]
    pub start_slot: Option<u64>,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8899".to_string()
}

fn default_reward_decimals() -> u32 {
    9
}

fn default_fetch_batch_size() -> usize {
    100
}

fn default_fetch_delay_ms() -> u64 {
    500
}

fn default_max_rewards_per_transaction() -> usize {
    10
}

fn default_cycle_timeout_secs() -> u64 {
    120
}

fn default_notification_buffer() -> usize {
    64
}

impl Config {
    /// Load from `watcher.toml` (optional) overridden by `WATCHER_*` variables
    pub fn load() -> AppResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("watcher").required(false))
            .add_source(config::Environment::with_prefix("WATCHER").try_parsing(true));

        Self::from_builder(builder)
    }

    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> AppResult<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        // Fail fast on malformed addresses rather than at the first cycle
        config.reward_mint_pubkey()?;
        if let Some(address) = &config.monitored_address {
            parse_pubkey("monitored_address", address)?;
        }

        Ok(config)
    }

    pub fn websocket_url(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }

        let url = if let Some(rest) = self.rpc_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.rpc_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.rpc_url.clone()
        };

        url.replace(":8899", ":8900")
    }

    pub fn reward_mint_pubkey(&self) -> AppResult<Pubkey> {
        parse_pubkey("reward_mint", &self.reward_mint)
    }

    pub fn monitored_pubkey(&self, authority: &Pubkey) -> AppResult<Pubkey> {
        match &self.monitored_address {
            Some(address) => parse_pubkey("monitored_address", address),
            None => Ok(*authority),
        }
    }

    pub fn load_authority_keypair(&self) -> AppResult<Keypair> {
        let path = &self.authority_keypair_path;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read keypair {}: {}", path.display(), e))
        })?;
        let bytes: Vec<u8> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("Keypair {} is not a byte array: {}", path.display(), e))
        })?;

        Keypair::try_from(bytes.as_slice()).map_err(|e| {
            AppError::Config(format!("Invalid keypair {}: {}", path.display(), e))
        })
    }

    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

fn parse_pubkey(field: &str, value: &str) -> AppResult<Pubkey> {
    Pubkey::from_str(value)
        .map_err(|_| AppError::Config(format!("{} is not a valid address: {}", field, value)))
}
