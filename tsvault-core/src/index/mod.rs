//! Series index
//!
//! Maps a metric's identity to a stable series ID (its fingerprint), keeps an
//! inverted `label name -> label value -> series IDs` index for exact-match
//! selection, and tracks the time bounds written for every series.

mod fingerprint;
mod snapshot;

pub use fingerprint::fingerprint;

use crate::{Metric, Result, Timestamp, TsError, METRIC_NAME_LABEL};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Per-series metadata owned by the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    /// Fingerprint of the metric, never changes
    pub id: u64,
    pub metric: Metric,
    /// Smallest timestamp written, 0 while unset
    pub min_time: Timestamp,
    /// Largest timestamp written, 0 while unset
    pub max_time: Timestamp,
}

type Postings = HashSet<u64>;

#[derive(Default)]
struct IndexInner {
    series: HashMap<u64, SeriesMetadata>,
    labels: HashMap<String, HashMap<String, Postings>>,
}

impl IndexInner {
    fn insert(&mut self, meta: SeriesMetadata) {
        let id = meta.id;
        self.post(METRIC_NAME_LABEL, &meta.metric.name, id);
        for (name, value) in &meta.metric.labels {
            self.post(name, value, id);
        }
        self.series.insert(id, meta);
    }

    fn post(&mut self, name: &str, value: &str, id: u64) {
        self.labels
            .entry(name.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(id);
    }
}

/// Thread-safe series index.
///
/// Mutations take the write lock for their whole duration, so readers never
/// observe a series that is only partially posted.
#[derive(Default)]
pub struct SeriesIndex {
    inner: RwLock<IndexInner>,
}

impl SeriesIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric and return its series ID.
    ///
    /// Idempotent: a metric that is already indexed keeps its ID and bounds.
    pub fn add_series(&self, metric: &Metric) -> u64 {
        let id = fingerprint(metric);

        if let Some(existing) = self.inner.read().series.get(&id) {
            if existing.metric != *metric {
                warn!(
                    "Fingerprint collision between {} and {}",
                    existing.metric, metric
                );
            }
            return id;
        }

        let mut inner = self.inner.write();
        // Another writer may have won the race between the two locks
        if inner.series.contains_key(&id) {
            return id;
        }
        inner.insert(SeriesMetadata {
            id,
            metric: metric.clone(),
            min_time: 0,
            max_time: 0,
        });
        id
    }

    /// IDs of every series matching all `selectors` exactly.
    ///
    /// An empty selector set matches every series. No ordering guarantee.
    pub fn find_series(&self, selectors: &HashMap<String, String>) -> HashSet<u64> {
        let inner = self.inner.read();

        if selectors.is_empty() {
            return inner.series.keys().copied().collect();
        }

        let mut buckets = Vec::with_capacity(selectors.len());
        for (name, value) in selectors {
            match inner.labels.get(name).and_then(|values| values.get(value)) {
                Some(bucket) if !bucket.is_empty() => buckets.push(bucket),
                _ => return HashSet::new(),
            }
        }

        // Probe from the smallest bucket so the working set only shrinks
        buckets.sort_by_key(|bucket| bucket.len());
        let Some((smallest, rest)) = buckets.split_first() else {
            return HashSet::new();
        };

        let mut result: HashSet<u64> = (*smallest).clone();
        for bucket in rest {
            result.retain(|id| bucket.contains(id));
            if result.is_empty() {
                break;
            }
        }
        result
    }

    /// Widen the recorded bounds of a series
    pub fn update_time_range(&self, id: u64, min_time: Timestamp, max_time: Timestamp) -> Result<()> {
        let mut inner = self.inner.write();
        let meta = inner.series.get_mut(&id).ok_or(TsError::NotFound(id))?;

        if meta.min_time == 0 || min_time < meta.min_time {
            meta.min_time = min_time;
        }
        if meta.max_time == 0 || max_time > meta.max_time {
            meta.max_time = max_time;
        }
        Ok(())
    }

    /// Metadata for a series
    pub fn get_series(&self, id: u64) -> Option<SeriesMetadata> {
        self.inner.read().series.get(&id).cloned()
    }

    /// Number of indexed series
    pub fn series_count(&self) -> usize {
        self.inner.read().series.len()
    }

    /// All indexed label names, including the metric name label, sorted
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().labels.keys().cloned().collect();
        names.sort();
        names
    }

    /// All values seen for a label name, sorted
    pub fn label_values(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut values: Vec<String> = inner
            .labels
            .get(name)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    /// Drop every series
    pub fn clear(&self) {
        *self.inner.write() = IndexInner::default();
    }

    /// Replace this index's contents with those of `other`
    pub fn replace_with(&self, other: SeriesIndex) {
        *self.inner.write() = other.inner.into_inner();
    }

    /// Every series' metadata, ordered by ID
    fn snapshot_series(&self) -> Vec<SeriesMetadata> {
        let mut series: Vec<SeriesMetadata> =
            self.inner.read().series.values().cloned().collect();
        series.sort_by_key(|meta| meta.id);
        series
    }

    fn from_series(series: Vec<SeriesMetadata>) -> Self {
        let mut inner = IndexInner::default();
        for meta in series {
            inner.insert(meta);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selectors(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn http(method: &str, status: &str) -> Metric {
        Metric::new("http_requests_total")
            .with_label("method", method)
            .with_label("status", status)
    }

    #[test]
    fn test_add_series_idempotent() {
        let index = SeriesIndex::new();
        let metric = http("GET", "200");

        let id1 = index.add_series(&metric);
        index.update_time_range(id1, 100, 200).unwrap();
        let id2 = index.add_series(&metric.clone());

        assert_eq!(id1, id2);
        assert_eq!(index.series_count(), 1);

        let meta = index.get_series(id1).unwrap();
        assert_eq!((meta.min_time, meta.max_time), (100, 200));
    }

    #[test]
    fn test_find_series_intersection() {
        let index = SeriesIndex::new();
        let a = index.add_series(&http("GET", "200"));
        let b = index.add_series(&http("POST", "200"));
        let c = index.add_series(&http("GET", "404"));

        assert_eq!(
            index.find_series(&selectors(&[("method", "GET")])),
            HashSet::from([a, c])
        );
        assert_eq!(
            index.find_series(&selectors(&[("method", "GET"), ("status", "200")])),
            HashSet::from([a])
        );
        assert_eq!(
            index.find_series(&selectors(&[("status", "200")])),
            HashSet::from([a, b])
        );
        assert!(index
            .find_series(&selectors(&[("method", "DELETE")]))
            .is_empty());
        assert!(index
            .find_series(&selectors(&[("missing", "x")]))
            .is_empty());
        assert!(index
            .find_series(&selectors(&[("method", "POST"), ("status", "404")]))
            .is_empty());
    }

    #[test]
    fn test_find_series_by_name_and_all() {
        let index = SeriesIndex::new();
        let a = index.add_series(&http("GET", "200"));
        let up = index.add_series(&Metric::new("up"));

        assert_eq!(
            index.find_series(&selectors(&[(METRIC_NAME_LABEL, "up")])),
            HashSet::from([up])
        );
        assert_eq!(index.find_series(&HashMap::new()), HashSet::from([a, up]));
    }

    #[test]
    fn test_update_time_range_widens_only() {
        let index = SeriesIndex::new();
        let id = index.add_series(&Metric::new("up"));

        index.update_time_range(id, 500, 600).unwrap();
        index.update_time_range(id, 550, 580).unwrap();
        let meta = index.get_series(id).unwrap();
        assert_eq!((meta.min_time, meta.max_time), (500, 600));

        index.update_time_range(id, 400, 700).unwrap();
        let meta = index.get_series(id).unwrap();
        assert_eq!((meta.min_time, meta.max_time), (400, 700));
    }

    #[test]
    fn test_update_time_range_unknown_series() {
        let index = SeriesIndex::new();
        assert!(matches!(
            index.update_time_range(99, 1, 2),
            Err(TsError::NotFound(99))
        ));
        assert!(index.get_series(99).is_none());
    }

    #[test]
    fn test_label_metadata() {
        let index = SeriesIndex::new();
        index.add_series(&http("GET", "200"));
        index.add_series(&http("POST", "500"));

        assert_eq!(
            index.label_names(),
            vec![METRIC_NAME_LABEL.to_string(), "method".into(), "status".into()]
        );
        assert_eq!(index.label_values("method"), vec!["GET", "POST"]);
        assert!(index.label_values("nope").is_empty());

        index.clear();
        assert_eq!(index.series_count(), 0);
        assert!(index.label_names().is_empty());
    }

    #[test]
    fn test_concurrent_add_series() {
        use std::sync::Arc;

        let index = Arc::new(SeriesIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        // Half the metrics are shared between threads
                        let owner = if i % 2 == 0 { "shared".to_string() } else { t.to_string() };
                        index.add_series(&Metric::new("m").with_label("i", i.to_string()).with_label("t", owner));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(index.series_count(), 50 + 8 * 50);
    }
}
