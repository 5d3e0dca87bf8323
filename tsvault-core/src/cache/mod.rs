//! Query result cache
//!
//! A bounded LRU map from query requests to results with a time-to-live on
//! every entry. Writers clear it and bump a generation, so a result read
//! before the clear is never stored after it.

mod cached;

pub use cached::CachedStorage;

use crate::QueryRequest;
use crate::QueryResult;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use xxhash_rust::xxh3::Xxh3;

/// Deterministic identity of a query request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u128);

impl CacheKey {
    /// Hash of exactly tenant, query, start and end
    pub fn new(req: &QueryRequest) -> Self {
        let mut hasher = Xxh3::new();
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart
        hasher.update(&(req.tenant_id.len() as u64).to_le_bytes());
        hasher.update(req.tenant_id.as_bytes());
        hasher.update(&(req.query.len() as u64).to_le_bytes());
        hasher.update(req.query.as_bytes());
        hasher.update(&req.start_time.to_le_bytes());
        hasher.update(&req.end_time.to_le_bytes());
        Self(hasher.digest128())
    }
}

/// Time source for entry freshness
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Cache occupancy snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    /// Entries past their TTL that have not been evicted yet
    pub expired: usize,
}

struct Entry {
    result: QueryResult,
    inserted_at: Instant,
}

struct CacheState {
    entries: LruCache<CacheKey, Entry>,
    /// Bumped by every `clear`
    generation: u64,
}

/// LRU cache of query results with per-entry TTL
pub struct QueryCache {
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        // A zero capacity never stores, so the bound only matters when non-zero
        let bound = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            ttl,
            clock,
            state: Mutex::new(CacheState {
                entries: LruCache::new(bound),
                generation: 0,
            }),
        }
    }

    fn is_expired(&self, inserted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted_at) > self.ttl
    }

    /// Cached result for `req`. Expired entries are evicted and miss.
    pub fn get(&self, req: &QueryRequest) -> Option<QueryResult> {
        let key = CacheKey::new(req);
        let now = self.clock.now();

        let mut state = self.state.lock();
        let inserted_at = state.entries.peek(&key)?.inserted_at;
        if self.is_expired(inserted_at, now) {
            state.entries.pop(&key);
            return None;
        }

        state.entries.get(&key).map(|entry| entry.result.clone())
    }

    /// Insert or refresh the result for `req`
    pub fn put(&self, req: &QueryRequest, result: QueryResult) {
        let mut state = self.state.lock();
        self.insert(&mut state, req, result);
    }

    /// Current generation; pass it to `put_if_current` after reading below the cache
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Like `put`, but dropped when a `clear` happened since `generation` was read.
    /// Returns whether the result was stored.
    pub fn put_if_current(&self, req: &QueryRequest, result: QueryResult, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        self.insert(&mut state, req, result)
    }

    fn insert(&self, state: &mut CacheState, req: &QueryRequest, result: QueryResult) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let entry = Entry {
            result,
            inserted_at: self.clock.now(),
        };
        state.entries.put(CacheKey::new(req), entry);
        true
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.generation = state.generation.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Occupancy; expired entries are counted, not evicted
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let state = self.state.lock();
        let expired = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry.inserted_at, now))
            .count();

        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            expired,
        }
    }
}
