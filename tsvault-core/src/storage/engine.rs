//! Storage engine - block write/read orchestration

use super::block::{
    block_key, block_start, merge_samples, parse_block_key, parse_label_selectors, series_prefix,
    BlockPayload, BLOCK_DURATION,
};
use super::Storage;
use crate::compression::{CompressionLevel, Compressor};
use crate::context::Context;
use crate::index::SeriesIndex;
use crate::store::KvStore;
use crate::{
    QueryRequest, QueryResult, Result, Sample, Series, Timestamp, TsError, WriteRequest,
    METRIC_NAME_LABEL,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Store key of the index snapshot. Shorter than any block key.
const INDEX_KEY: &[u8] = b"\0tsvault/index";

/// Writes series into compressed one-hour blocks and reads them back
pub struct StorageEngine {
    store: Arc<dyn KvStore>,
    index: SeriesIndex,
    compressor: Compressor,
    retention: Duration,
    /// Write exclusive, query shared
    lock: RwLock<()>,
    closed: AtomicBool,
}

impl StorageEngine {
    pub fn new(store: Arc<dyn KvStore>, level: CompressionLevel) -> Self {
        Self {
            store,
            index: SeriesIndex::new(),
            compressor: Compressor::new(level),
            retention: crate::config::RETENTION,
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Age after which `enforce_retention` deletes blocks
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn index(&self) -> &SeriesIndex {
        &self.index
    }

    pub fn series_count(&self) -> usize {
        self.index.series_count()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TsError::Closed("storage engine"));
        }
        Ok(())
    }

    fn write_series(&self, tenant_id: &str, series: &Series) -> Result<()> {
        let series_id = self.index.add_series(&series.metric);

        let Some((min_time, max_time)) = series.time_bounds() else {
            return Ok(());
        };

        let mut blocks: BTreeMap<Timestamp, Vec<Sample>> = BTreeMap::new();
        for sample in &series.samples {
            blocks
                .entry(block_start(sample.timestamp))
                .or_default()
                .push(*sample);
        }

        for (start, samples) in blocks {
            let key = block_key(tenant_id, series_id, start);

            let existing = match self.store.get(&key)? {
                Some(bytes) => BlockPayload::from_bytes(&bytes)?.decode(&self.compressor)?,
                None => Vec::new(),
            };
            let merged = merge_samples(existing, &samples);

            let payload = BlockPayload::encode(&self.compressor, &merged)?;
            self.store.set(&key, &payload.to_bytes()?)?;
        }

        self.index.update_time_range(series_id, min_time, max_time)
    }

    fn read_series(&self, tenant_id: &str, series_id: u64, req: &QueryRequest) -> Result<Vec<Sample>> {
        let range = req.time_range();
        let first = block_start(req.start_time);
        let last = block_start(req.end_time);

        let mut samples = Vec::new();
        for key in self.store.keys_with_prefix(&series_prefix(tenant_id, series_id))? {
            // A longer tenant name can share this prefix
            let Some((tenant, id, start)) = parse_block_key(&key) else {
                continue;
            };
            if tenant != tenant_id.as_bytes() || id != series_id {
                continue;
            }
            if start < first || start > last {
                continue;
            }
            // Deleted between listing and reading
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };

            let block = BlockPayload::from_bytes(&bytes)?.decode(&self.compressor)?;
            samples.push((start, block));
        }

        // Keys order negative block starts after positive ones
        samples.sort_by_key(|(start, _)| *start);

        Ok(samples
            .into_iter()
            .flat_map(|(_, block)| block)
            .filter(|s| range.contains(s.timestamp))
            .collect())
    }

    /// IDs of the series holding at least one block for `tenant_id`
    pub fn tenant_series(&self, tenant_id: &str) -> Result<BTreeSet<u64>> {
        self.check_open()?;
        let mut prefix = tenant_id.as_bytes().to_vec();
        prefix.push(b'/');

        let _guard = self.lock.read();
        let mut ids = BTreeSet::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            if let Some((tenant, id, _)) = parse_block_key(&key) {
                if tenant == tenant_id.as_bytes() {
                    ids.insert(id);
                }
            }
        }
        Ok(ids)
    }

    /// Label names, the metric name label included, of a tenant's series
    pub fn label_names(&self, tenant_id: &str) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for id in self.tenant_series(tenant_id)? {
            if let Some(meta) = self.index.get_series(id) {
                names.insert(METRIC_NAME_LABEL.to_string());
                names.extend(meta.metric.labels.into_keys());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Values of one label across a tenant's series
    pub fn label_values(&self, tenant_id: &str, name: &str) -> Result<Vec<String>> {
        let mut values = BTreeSet::new();
        for id in self.tenant_series(tenant_id)? {
            let Some(meta) = self.index.get_series(id) else {
                continue;
            };
            if name == METRIC_NAME_LABEL {
                values.insert(meta.metric.name);
            } else if let Some(value) = meta.metric.labels.get(name) {
                values.insert(value.clone());
            }
        }
        Ok(values.into_iter().collect())
    }

    /// Delete every block that ended before `now - retention`
    pub fn enforce_retention(&self, now: Timestamp) -> Result<usize> {
        self.check_open()?;
        let retention = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);

        let _guard = self.lock.write();
        let mut deleted = 0;
        for key in self.store.keys()? {
            let Some((_, _, start)) = parse_block_key(&key) else {
                continue;
            };
            if start.saturating_add(BLOCK_DURATION) <= cutoff {
                self.store.delete(&key)?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!("Retention removed {} blocks older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Persist the series index into the store
    pub fn save_index(&self) -> Result<()> {
        self.check_open()?;
        let snapshot = self.index.serialize()?;
        self.store.set(INDEX_KEY, &snapshot)?;
        debug!(
            "Saved index snapshot: {} series, {} bytes",
            self.index.series_count(),
            snapshot.len()
        );
        Ok(())
    }

    /// Replace the in-memory index with the stored snapshot, if any
    pub fn load_index(&self) -> Result<bool> {
        self.check_open()?;
        let Some(snapshot) = self.store.get(INDEX_KEY)? else {
            return Ok(false);
        };
        self.index.replace_with(SeriesIndex::deserialize(&snapshot)?);
        info!("Loaded index snapshot: {} series", self.index.series_count());
        Ok(true)
    }
}

impl Storage for StorageEngine {
    fn write(&self, ctx: &Context, req: WriteRequest) -> Result<()> {
        ctx.check()?;
        self.check_open()?;

        let _guard = self.lock.write();
        for series in &req.series {
            self.write_series(&req.tenant_id, series)?;
        }
        debug!(
            tenant = %req.tenant_id,
            series = req.series.len(),
            samples = req.sample_count(),
            "Wrote request"
        );
        Ok(())
    }

    fn query(&self, ctx: &Context, req: &QueryRequest) -> Result<QueryResult> {
        ctx.check()?;
        self.check_open()?;

        let selectors = parse_label_selectors(&req.query)?;
        if req.start_time > req.end_time {
            return Ok(QueryResult::default());
        }

        let _guard = self.lock.read();
        let mut ids: Vec<u64> = self.index.find_series(&selectors).into_iter().collect();
        ids.sort_unstable();

        let mut result = QueryResult::default();
        for id in ids {
            let Some(meta) = self.index.get_series(id) else {
                continue;
            };
            let samples = self.read_series(&req.tenant_id, id, req)?;
            if !samples.is_empty() {
                result.series.push(Series::new(meta.metric, samples));
            }
        }
        Ok(result)
    }

    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let _guard = self.lock.write();
            self.save_index()?;
            self.closed.store(true, Ordering::Release);
        }
        self.store.close()?;
        info!("Storage engine closed");
        Ok(())
    }
}
