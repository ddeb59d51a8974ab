//! Storage backends
//!
//! - `duckdb`: the observation store
//! - `sqlite`: checkpoints, series registry and run history
//! - `memory`: in-process stores for dry runs and tests

pub mod duckdb;
pub mod memory;
pub mod sqlite;

pub use self::duckdb::DuckDb;
pub use self::memory::{MemoryCheckpointStore, MemoryObservationStore};
pub use self::sqlite::SqliteDb;
