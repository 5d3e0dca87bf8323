//! WAL entry types and serialization

use crate::{Result, Series, WriteRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single logged write request.
///
/// Stored as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Wall-clock time the request was accepted
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub series: Vec<Series>,
}

impl WalEntry {
    /// Create an entry for a write request
    pub fn from_request(req: &WriteRequest) -> Self {
        Self {
            timestamp: Utc::now(),
            tenant_id: req.tenant_id.clone(),
            series: req.series.clone(),
        }
    }

    /// Serialize as a newline-terminated line
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse one line, without its terminator
    pub fn from_line(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }

    /// The write request this entry logged
    pub fn into_request(self) -> WriteRequest {
        WriteRequest {
            tenant_id: self.tenant_id,
            series: self.series,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metric, Sample, TsError};

    #[test]
    fn test_entry_serialization() {
        let metric = Metric::new("temperature").with_label("sensor", "s1");
        let req = WriteRequest::new(
            "tenant-a",
            vec![Series::new(metric, vec![Sample::new(1_000, 23.5), Sample::new(1_010, f64::NAN)])],
        );

        let entry = WalEntry::from_request(&req);
        let line = entry.to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let decoded = WalEntry::from_line(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded.timestamp, entry.timestamp);

        let recovered = decoded.into_request();
        assert_eq!(recovered.tenant_id, "tenant-a");
        assert_eq!(recovered.series[0].metric, req.series[0].metric);
        assert_eq!(recovered.series[0].samples[0], req.series[0].samples[0]);
        assert!(recovered.series[0].samples[1].value.is_nan());
    }

    #[test]
    fn test_malformed_line() {
        let result = WalEntry::from_line(br#"{"timestamp": "#);
        assert!(matches!(result, Err(TsError::Serialization(_))));
    }
}
