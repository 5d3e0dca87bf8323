//! Database - assembles and recovers the storage stack

use super::{Storage, StorageConfig, StorageEngine};
use crate::batch::{BatchConfig, BatchWriter};
use crate::cache::{CacheStats, CachedStorage};
use crate::compression::CompressionLevel;
use crate::context::Context;
use crate::store::{FileStore, KvStore, MemoryStore};
use crate::wal::{replay_wal, Wal, WalConfig};
use crate::{QueryRequest, QueryResult, Result, WriteRequest};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// An opened storage stack.
///
/// Layers, outermost first: `BatchWriter` with its WAL (when `enable_wal`),
/// `CachedStorage` (when `cache_capacity > 0`), `StorageEngine`.
pub struct Database {
    config: StorageConfig,
    engine: Arc<StorageEngine>,
    batch: Option<Arc<BatchWriter>>,
    cached: Option<Arc<CachedStorage>>,
    storage: Arc<dyn Storage>,
}

impl Database {
    /// Open the database at `config.path`, replaying any WAL left behind
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let level = CompressionLevel::from_level(config.compression_level)?;
        std::fs::create_dir_all(&config.path)?;

        let store: Arc<dyn KvStore> = if config.in_memory {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(FileStore::open(config.path.join("blocks").join("data.log"))?)
        };

        let engine = Arc::new(StorageEngine::new(store, level).with_retention(config.retention));
        engine.load_index()?;

        // Recover straight into the engine, before a new segment exists
        let wal_dir = Self::wal_dir(&config);
        let ctx = Context::background();
        let stats = replay_wal(&wal_dir, |req| engine.write(&ctx, req))?;
        if stats.entries > 0 {
            info!(
                "Recovered {} WAL entries from {} segments",
                stats.entries, stats.segments
            );
        }
        engine.save_index()?;
        engine.enforce_retention(Utc::now().timestamp())?;

        let mut storage: Arc<dyn Storage> = engine.clone();

        // Below the batch writer, so the cache is cleared when a batch lands
        let cached = if config.cache_capacity > 0 {
            let cached = Arc::new(CachedStorage::new(
                storage.clone(),
                config.cache_capacity,
                config.cache_ttl,
            ));
            storage = cached.clone();
            Some(cached)
        } else {
            None
        };

        let batch = if config.enable_wal {
            let wal = Arc::new(Wal::open(WalConfig {
                dir: wal_dir,
                flush_interval: config.wal_flush_interval,
            })?);
            let writer = Arc::new(BatchWriter::new(
                storage.clone(),
                Some(wal),
                BatchConfig {
                    buffer_size: config.batch_size,
                    flush_interval: config.batch_flush_interval,
                },
            )?);
            storage = writer.clone();
            Some(writer)
        } else {
            None
        };

        info!(
            "Opened database at {:?}: {} series, wal={}, cache={}",
            config.path,
            engine.series_count(),
            config.enable_wal,
            config.cache_capacity
        );

        Ok(Self {
            config,
            engine,
            batch,
            cached,
            storage,
        })
    }

    fn wal_dir(config: &StorageConfig) -> PathBuf {
        config.path.join("wal")
    }

    pub fn write(&self, ctx: &Context, req: WriteRequest) -> Result<()> {
        self.storage.write(ctx, req)
    }

    pub fn query(&self, ctx: &Context, req: &QueryRequest) -> Result<QueryResult> {
        self.storage.query(ctx, req)
    }

    /// Sync the WAL and apply buffered writes
    pub fn flush(&self) -> Result<()> {
        if let Some(batch) = &self.batch {
            if let Some(wal) = batch.wal() {
                wal.flush()?;
            }
            batch.flush()?;
        }
        Ok(())
    }

    /// Close every layer; the index snapshot is saved by the engine
    pub fn close(&self) -> Result<()> {
        self.storage.close()?;
        info!("Closed database at {:?}", self.config.path);
        Ok(())
    }

    /// The composed storage stack
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn series_count(&self) -> usize {
        self.engine.series_count()
    }

    /// Label names used by a tenant's series
    pub fn label_names(&self, tenant_id: &str) -> Result<Vec<String>> {
        self.engine.label_names(tenant_id)
    }

    /// Values of `name` across a tenant's series
    pub fn label_values(&self, tenant_id: &str, name: &str) -> Result<Vec<String>> {
        self.engine.label_values(tenant_id, name)
    }

    /// Writes buffered in the batch writer
    pub fn pending_writes(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.pending())
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cached.as_ref().map(|c| c.cache_stats())
    }

    pub fn cache_hit_rate(&self) -> Option<f64> {
        self.cached.as_ref().map(|c| c.hit_rate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metric, Sample, Series, TsError};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(path: &std::path::Path) -> StorageConfig {
        StorageConfig {
            // Background timers stay out of the way; tests flush explicitly
            wal_flush_interval: Duration::from_secs(3600),
            batch_flush_interval: Duration::from_secs(3600),
            ..StorageConfig::with_path(path)
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn request(tenant: &str, ts: i64, value: f64) -> WriteRequest {
        WriteRequest::new(
            tenant,
            vec![Series::new(
                Metric::new("temperature").with_label("room", "lab"),
                vec![Sample::new(ts, value)],
            )],
        )
    }

    #[test]
    fn test_open_write_flush_query() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(config(temp_dir.path())).unwrap();
        let ctx = Context::background();
        let ts = now();

        db.write(&ctx, request("t1", ts, 21.5)).unwrap();
        assert_eq!(db.pending_writes(), 1);

        db.flush().unwrap();
        assert_eq!(db.pending_writes(), 0);

        let result = db
            .query(&ctx, &QueryRequest::new("t1", "temperature", ts - 60, ts + 60))
            .unwrap();
        assert_eq!(result.series[0].samples, vec![Sample::new(ts, 21.5)]);
        assert_eq!(db.series_count(), 1);
        assert_eq!(db.label_values("t1", "room").unwrap(), vec!["lab".to_string()]);
        assert!(db.label_values("t2", "room").unwrap().is_empty());

        db.close().unwrap();
    }

    #[test]
    fn test_query_before_flush_not_served_stale() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(config(temp_dir.path())).unwrap();
        let ctx = Context::background();
        let ts = now();
        let query = QueryRequest::new("t1", "temperature", ts - 60, ts + 60);

        db.write(&ctx, request("t1", ts, 19.0)).unwrap();
        // Still buffered, and the empty answer gets cached
        assert!(db.query(&ctx, &query).unwrap().is_empty());
        assert_eq!(db.cache_stats().unwrap().size, 1);

        db.flush().unwrap();
        assert_eq!(db.cache_stats().unwrap().size, 0);
        let result = db.query(&ctx, &query).unwrap();
        assert_eq!(result.series[0].samples, vec![Sample::new(ts, 19.0)]);

        db.close().unwrap();
    }

    #[test]
    fn test_unflushed_writes_recovered_from_wal() {
        let temp_dir = TempDir::new().unwrap();
        let ts = now();

        {
            let db = Database::open(config(temp_dir.path())).unwrap();
            db.write(&Context::background(), request("t1", ts, 1.0)).unwrap();
            // Sync the WAL only; the batch never reaches the engine
            db.batch.as_ref().unwrap().wal().unwrap().flush().unwrap();
        }

        let db = Database::open(config(temp_dir.path())).unwrap();
        let result = db
            .query(
                &Context::background(),
                &QueryRequest::new("t1", "temperature", ts - 1, ts + 1),
            )
            .unwrap();
        assert_eq!(result.sample_count(), 1);
        db.close().unwrap();
    }

    #[test]
    fn test_in_memory_without_wal_or_cache() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(StorageConfig {
            in_memory: true,
            enable_wal: false,
            cache_capacity: 0,
            ..config(temp_dir.path())
        })
        .unwrap();
        let ctx = Context::background();
        let ts = now();

        // Applied synchronously without a batch writer
        db.write(&ctx, request("t1", ts, 3.0)).unwrap();
        let result = db
            .query(&ctx, &QueryRequest::new("t1", "temperature", ts, ts))
            .unwrap();
        assert_eq!(result.sample_count(), 1);
        assert!(db.cache_stats().is_none());
        assert!(!temp_dir.path().join("blocks").exists());
        assert!(!temp_dir.path().join("wal").exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = Database::open(StorageConfig {
            compression_level: 9,
            ..config(temp_dir.path())
        });
        assert!(matches!(result, Err(TsError::Config(_))));
    }
}
