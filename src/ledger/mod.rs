pub mod models;
pub mod repository;

pub use repository::{KvStore, MemoryKvStore, PgKvStore, ProcessingJournal};
