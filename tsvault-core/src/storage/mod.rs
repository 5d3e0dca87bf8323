//! Storage engine - coordinates all storage components

mod block;
mod database;
mod engine;

pub use block::{block_key, block_start, parse_label_selectors, BlockPayload, BLOCK_DURATION};
pub use database::Database;
pub use engine::StorageEngine;

use crate::compression::CompressionLevel;
use crate::context::Context;
use crate::{QueryRequest, QueryResult, Result, TsError, WriteRequest};
use std::path::PathBuf;
use std::time::Duration;

/// Anything that accepts writes and answers queries.
///
/// The engine and every decorator around it (batching, caching) implement
/// this, so they compose in any order.
pub trait Storage: Send + Sync {
    fn write(&self, ctx: &Context, req: WriteRequest) -> Result<()>;

    fn query(&self, ctx: &Context, req: &QueryRequest) -> Result<QueryResult>;

    /// Flush and release resources
    fn close(&self) -> Result<()>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory
    pub path: PathBuf,
    /// Keep blocks in memory instead of `<path>/blocks`
    pub in_memory: bool,
    /// Codec level, 1 (fastest) to 4 (best)
    pub compression_level: i32,
    /// Log writes ahead and batch them
    pub enable_wal: bool,
    /// Background WAL sync interval
    pub wal_flush_interval: Duration,
    /// Buffered requests that trigger an immediate batch flush
    pub batch_size: usize,
    /// Background batch flush interval
    pub batch_flush_interval: Duration,
    /// Cached query results; 0 disables the cache
    pub cache_capacity: usize,
    /// Lifetime of a cached result
    pub cache_ttl: Duration,
    /// Blocks older than this are deleted
    pub retention: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
            in_memory: false,
            compression_level: CompressionLevel::Default.as_level(),
            enable_wal: true,
            wal_flush_interval: crate::config::WAL_FLUSH_INTERVAL,
            batch_size: crate::config::BATCH_SIZE,
            batch_flush_interval: crate::config::BATCH_FLUSH_INTERVAL,
            cache_capacity: crate::config::CACHE_CAPACITY,
            cache_ttl: crate::config::CACHE_TTL,
            retention: crate::config::RETENTION,
        }
    }
}

impl StorageConfig {
    /// Configuration rooted at `path` with defaults elsewhere
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Reject settings the storage cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(TsError::Config("storage path must not be empty".into()));
        }
        CompressionLevel::from_level(self.compression_level)?;
        if self.retention.is_zero() {
            return Err(TsError::Config("retention must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(TsError::Config("batch size must be positive".into()));
        }
        if self.wal_flush_interval.is_zero() || self.batch_flush_interval.is_zero() {
            return Err(TsError::Config("flush intervals must be positive".into()));
        }
        if self.cache_capacity > 0 && self.cache_ttl.is_zero() {
            return Err(TsError::Config("cache TTL must be positive when caching".into()));
        }
        Ok(())
    }
}
