//! Metric fingerprinting

use crate::Metric;
use fnv::FnvHasher;
use std::hash::Hasher;

const SEPARATOR: u8 = 0;

/// FNV-1a 64 over the metric name followed by `\0 key \0 value` for every
/// label in ascending key order.
///
/// Labels live in a `BTreeMap`, so iteration is already sorted and the result
/// does not depend on the order labels were inserted in.
pub fn fingerprint(metric: &Metric) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(metric.name.as_bytes());
    for (key, value) in &metric.labels {
        hasher.write_u8(SEPARATOR);
        hasher.write(key.as_bytes());
        hasher.write_u8(SEPARATOR);
        hasher.write(value.as_bytes());
    }
    hasher.finish()
}
