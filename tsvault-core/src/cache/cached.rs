//! Caching decorator around any `Storage`

use super::{CacheStats, QueryCache};
use crate::context::Context;
use crate::storage::Storage;
use crate::{QueryRequest, QueryResult, Result, WriteRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Serves repeated queries from a `QueryCache`. Every write clears the cache
/// once it has reached the wrapped storage.
pub struct CachedStorage {
    inner: Arc<dyn Storage>,
    cache: QueryCache,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn Storage>, capacity: usize, ttl: Duration) -> Self {
        Self::with_cache(inner, QueryCache::new(capacity, ttl))
    }

    pub fn with_cache(inner: Arc<dyn Storage>, cache: QueryCache) -> Self {
        Self {
            inner,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Fraction of queries answered from the cache; 0 before any query
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Storage for CachedStorage {
    fn write(&self, ctx: &Context, req: WriteRequest) -> Result<()> {
        ctx.check()?;
        let result = self.inner.write(ctx, req);
        // A failed multi-series write may still have stored some blocks
        self.cache.clear();
        result
    }

    fn query(&self, ctx: &Context, req: &QueryRequest) -> Result<QueryResult> {
        ctx.check()?;

        if let Some(result) = self.cache.get(req) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(tenant = %req.tenant_id, query = %req.query, "Cache hit");
            return Ok(result);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let generation = self.cache.generation();
        let result = self.inner.query(ctx, req)?;
        if !self.cache.put_if_current(req, result.clone(), generation) {
            debug!(tenant = %req.tenant_id, query = %req.query, "Write raced query, not caching");
        }
        Ok(result)
    }

    fn close(&self) -> Result<()> {
        self.cache.clear();
        self.inner.close()
    }
}
