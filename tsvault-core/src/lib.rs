//! tsvault Core - Time-Series Storage Engine
//!
//! Turns streams of `(timestamp, value)` samples, tagged with a metric name
//! and labels, into durable compressed blocks and serves range queries back.
//!
//! # Architecture
//!
//! - **Codec**: delta-of-delta timestamps and XOR values, then zstd
//! - **Series Index**: fingerprint IDs plus an inverted label index
//! - **WAL + Batch Writer**: durability before acknowledgment, per-tenant batches
//! - **Query Cache**: LRU with TTL, cleared on every write
//! - **Storage Engine**: one-hour blocks in an ordered key-value store

pub mod batch;
pub mod cache;
pub mod compression;
pub mod context;
pub mod index;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod wal;

mod error;
mod types;

pub use context::Context;
pub use error::{Result, TsError};
pub use storage::{Database, Storage, StorageConfig};
pub use types::*;

/// tsvault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Background WAL sync interval
    pub const WAL_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

    /// Buffered write requests that force a batch flush
    pub const BATCH_SIZE: usize = 1000;

    /// Background batch flush interval
    pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

    /// Cached query results
    pub const CACHE_CAPACITY: usize = 1000;

    /// Lifetime of a cached query result
    pub const CACHE_TTL: Duration = Duration::from_secs(60);

    /// Block retention (30 days)
    pub const RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

    /// Store log size below which it is never compacted (4MB)
    pub const STORE_COMPACTION_MIN_BYTES: u64 = 4 * 1024 * 1024;
}
