pub mod models;
pub mod solana;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use models::{AccountSnapshot, ChangeNotification, FetchedInstruction, FetchedTransaction};
pub use solana::{SolanaConfig, SolanaLedgerClient};
pub use traits::LedgerClient;
