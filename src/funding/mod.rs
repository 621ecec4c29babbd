// Detection of incoming payments and the per-slot processing cycle
pub mod extractor;
pub mod fetcher;
pub mod monitor;

pub use extractor::TransferExtractor;
pub use fetcher::BatchedFetcher;
pub use monitor::{CycleOutcome, MonitorSettings, ReplaySummary, TransferMonitor};
