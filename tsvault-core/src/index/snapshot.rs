//! Binary snapshot of the series index
//!
//! Format (little-endian):
//! - 4 bytes: magic `TSIX`
//! - 2 bytes: format version
//! - 4 bytes: series count
//! - per series: id (8), min time (8), max time (8), name (2 + N),
//!   label count (2), then each key and value (2 + N)
//! - 4 bytes: CRC32 of everything before it
//!
//! Only series metadata is written; the inverted label index is rebuilt on
//! load.

use super::{SeriesIndex, SeriesMetadata};
use crate::{Metric, Result, TsError};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"TSIX";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4;
const CHECKSUM_LEN: usize = 4;

impl SeriesIndex {
    /// Encode every series' metadata
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let series = self.snapshot_series();

        let mut buf = Vec::with_capacity(HEADER_LEN + series.len() * 64);
        buf.put_slice(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u32_le(series_count_field(series.len())?);

        for meta in &series {
            buf.put_u64_le(meta.id);
            buf.put_i64_le(meta.min_time);
            buf.put_i64_le(meta.max_time);
            put_str(&mut buf, &meta.metric.name)?;

            let label_count = u16::try_from(meta.metric.labels.len()).map_err(|_| {
                TsError::Encode(format!("series {} has too many labels", meta.id))
            })?;
            buf.put_u16_le(label_count);
            for (key, value) in &meta.metric.labels {
                put_str(&mut buf, key)?;
                put_str(&mut buf, value)?;
            }
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf)
    }

    /// Rebuild an index, including its inverted label index, from a snapshot
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(TsError::Decode("index snapshot too short".into()));
        }

        let (body, mut trailer) = data.split_at(data.len() - CHECKSUM_LEN);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TsError::Decode(format!(
                "index snapshot checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }

        let mut buf = body;
        if &buf[..4] != MAGIC {
            return Err(TsError::Decode("not an index snapshot".into()));
        }
        buf.advance(4);

        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(TsError::Decode(format!(
                "unsupported index snapshot version {}",
                version
            )));
        }

        let count = buf.get_u32_le() as usize;
        let mut series = Vec::with_capacity(count.min(body.len() / 26));
        for _ in 0..count {
            need(&buf, 24)?;
            let id = buf.get_u64_le();
            let min_time = buf.get_i64_le();
            let max_time = buf.get_i64_le();
            let name = get_str(&mut buf)?;

            need(&buf, 2)?;
            let label_count = buf.get_u16_le();
            let mut labels = BTreeMap::new();
            for _ in 0..label_count {
                let key = get_str(&mut buf)?;
                let value = get_str(&mut buf)?;
                labels.insert(key, value);
            }

            series.push(SeriesMetadata {
                id,
                metric: Metric { name, labels },
                min_time,
                max_time,
            });
        }

        if buf.has_remaining() {
            return Err(TsError::Decode(format!(
                "{} trailing bytes in index snapshot",
                buf.remaining()
            )));
        }

        Ok(SeriesIndex::from_series(series))
    }
}

fn series_count_field(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| TsError::Encode(format!("{} series exceed the snapshot limit", len)))
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| TsError::Encode(format!("string of {} bytes exceeds snapshot limit", s.len())))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    need(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len)?;
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|e| TsError::Decode(format!("invalid UTF-8 in index snapshot: {}", e)))?;
    buf.advance(len);
    Ok(s)
}

fn need(buf: &&[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(TsError::Decode("index snapshot truncated".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn populated() -> SeriesIndex {
        let index = SeriesIndex::new();
        let a = index.add_series(
            &Metric::new("http_requests_total")
                .with_label("method", "GET")
                .with_label("status", "200"),
        );
        index.add_series(&Metric::new("up"));
        index.update_time_range(a, 1_000, 5_000).unwrap();
        index
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let index = populated();
        let data = index.serialize().unwrap();
        let restored = SeriesIndex::deserialize(&data).unwrap();

        assert_eq!(restored.series_count(), 2);
        assert_eq!(restored.snapshot_series(), index.snapshot_series());

        // Inverted index was rebuilt
        let selectors = HashMap::from([("method".to_string(), "GET".to_string())]);
        assert_eq!(restored.find_series(&selectors).len(), 1);
        assert_eq!(restored.label_names(), index.label_names());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let index = populated();
        assert_eq!(index.serialize().unwrap(), index.serialize().unwrap());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_series_count_overflow_rejected() {
        assert_eq!(series_count_field(3).unwrap(), 3);
        assert!(matches!(
            series_count_field(u32::MAX as usize + 1),
            Err(TsError::Encode(_))
        ));
    }

    #[test]
    fn test_empty_snapshot() {
        let data = SeriesIndex::new().serialize().unwrap();
        assert_eq!(data.len(), HEADER_LEN + CHECKSUM_LEN);
        assert_eq!(SeriesIndex::deserialize(&data).unwrap().series_count(), 0);
    }

    #[test]
    fn test_corrupted_snapshot_rejected() {
        let mut data = populated().serialize().unwrap();
        data[12] ^= 0xff;
        assert!(matches!(
            SeriesIndex::deserialize(&data),
            Err(TsError::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_snapshot_rejected() {
        let data = populated().serialize().unwrap();
        assert!(SeriesIndex::deserialize(&data[..3]).is_err());

        // Drop a body byte but re-seal the checksum so only framing catches it
        let mut body = data[..data.len() - CHECKSUM_LEN - 1].to_vec();
        let crc = crc32fast::hash(&body);
        body.put_u32_le(crc);
        assert!(matches!(
            SeriesIndex::deserialize(&body),
            Err(TsError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_label_rejected() {
        let index = SeriesIndex::new();
        index.add_series(&Metric::new("m").with_label("k", "v".repeat(70_000)));
        assert!(matches!(index.serialize(), Err(TsError::Encode(_))));
    }
}
