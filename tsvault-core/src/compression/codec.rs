//! Delta-of-delta / XOR block codec

use super::CompressionLevel;
use crate::{Result, TsError};
use bytes::{Buf, BufMut};

const WORD: usize = 8;

/// Encodes and decodes the timestamp and value columns of a block.
///
/// The streams carry no element count; callers must decode with the same
/// count they encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compressor {
    level: CompressionLevel,
}

impl Compressor {
    /// Create a compressor at the given level
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Compress a sequence of timestamps
    pub fn compress_timestamps(&self, timestamps: &[i64]) -> Result<Vec<u8>> {
        let Some((&first, rest)) = timestamps.split_first() else {
            return Ok(Vec::new());
        };

        let mut buf = Vec::with_capacity(timestamps.len() * WORD);
        buf.put_i64_le(first);

        let mut prev = first;
        let mut prev_delta = 0i64;
        for &ts in rest {
            let delta = ts.wrapping_sub(prev);
            buf.put_i64_le(delta.wrapping_sub(prev_delta));
            prev_delta = delta;
            prev = ts;
        }

        self.pack(&buf)
    }

    /// Decompress `count` timestamps
    pub fn decompress_timestamps(&self, data: &[u8], count: usize) -> Result<Vec<i64>> {
        let raw = Self::unpack(data, count)?;
        let mut buf = raw.as_slice();
        let mut timestamps = Vec::with_capacity(count);
        if count == 0 {
            return Ok(timestamps);
        }

        let mut prev = buf.get_i64_le();
        let mut prev_delta = 0i64;
        timestamps.push(prev);
        for _ in 1..count {
            let delta = buf.get_i64_le().wrapping_add(prev_delta);
            prev = prev.wrapping_add(delta);
            prev_delta = delta;
            timestamps.push(prev);
        }

        Ok(timestamps)
    }

    /// Compress a sequence of values
    pub fn compress_values(&self, values: &[f64]) -> Result<Vec<u8>> {
        let Some((first, rest)) = values.split_first() else {
            return Ok(Vec::new());
        };

        let mut buf = Vec::with_capacity(values.len() * WORD);
        let mut prev_bits = first.to_bits();
        buf.put_u64_le(prev_bits);

        for value in rest {
            let bits = value.to_bits();
            buf.put_u64_le(bits ^ prev_bits);
            prev_bits = bits;
        }

        self.pack(&buf)
    }

    /// Decompress `count` values
    pub fn decompress_values(&self, data: &[u8], count: usize) -> Result<Vec<f64>> {
        let raw = Self::unpack(data, count)?;
        let mut buf = raw.as_slice();
        let mut values = Vec::with_capacity(count);
        if count == 0 {
            return Ok(values);
        }

        let mut prev_bits = buf.get_u64_le();
        values.push(f64::from_bits(prev_bits));
        for _ in 1..count {
            prev_bits ^= buf.get_u64_le();
            values.push(f64::from_bits(prev_bits));
        }

        Ok(values)
    }

    fn pack(&self, raw: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(raw, self.level.zstd_level())
            .map_err(|e| TsError::Encode(format!("zstd compression failed: {}", e)))
    }

    /// Undo byte compression and check the word count matches exactly
    fn unpack(data: &[u8], count: usize) -> Result<Vec<u8>> {
        if data.is_empty() {
            if count == 0 {
                return Ok(Vec::new());
            }
            return Err(TsError::Decode(format!(
                "empty stream for {} elements",
                count
            )));
        }

        let raw = zstd::stream::decode_all(data)
            .map_err(|e| TsError::Decode(format!("zstd decompression failed: {}", e)))?;

        let expected = count
            .checked_mul(WORD)
            .ok_or_else(|| TsError::Decode(format!("element count {} too large", count)))?;
        if raw.len() != expected {
            return Err(TsError::Decode(format!(
                "expected {} bytes for {} elements, found {}",
                expected,
                count,
                raw.len()
            )));
        }

        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> Compressor {
        Compressor::new(CompressionLevel::Default)
    }

    #[test]
    fn test_timestamps_roundtrip_regular() {
        let c = compressor();
        let timestamps: Vec<i64> = (0..500).map(|i| 1_700_000_000 + i * 15).collect();

        let data = c.compress_timestamps(&timestamps).unwrap();
        let decoded = c.decompress_timestamps(&data, timestamps.len()).unwrap();
        assert_eq!(decoded, timestamps);

        // Regular sampling collapses to long zero runs
        assert!(data.len() < timestamps.len() * 8 / 10, "got {} bytes", data.len());
    }

    #[test]
    fn test_timestamps_roundtrip_unordered() {
        let c = compressor();
        let timestamps = vec![100, 90, 90, 250, -40, i64::MAX, i64::MIN, 0];

        let data = c.compress_timestamps(&timestamps).unwrap();
        assert_eq!(
            c.decompress_timestamps(&data, timestamps.len()).unwrap(),
            timestamps
        );
    }

    #[test]
    fn test_single_timestamp() {
        let c = compressor();
        let data = c.compress_timestamps(&[42]).unwrap();
        assert_eq!(c.decompress_timestamps(&data, 1).unwrap(), vec![42]);
    }

    #[test]
    fn test_values_bit_exact() {
        let c = compressor();
        let values = vec![
            1.0,
            f64::NAN,
            f64::from_bits(0x7ff8_0000_0000_0001),
            f64::INFINITY,
            f64::NEG_INFINITY,
            -0.0,
            0.0,
            f64::MIN_POSITIVE,
            f64::MAX,
            123.456,
        ];

        let data = c.compress_values(&values).unwrap();
        let decoded = c.decompress_values(&data, values.len()).unwrap();

        let expected: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        let actual: Vec<u64> = decoded.iter().map(|v| v.to_bits()).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_values_roundtrip_drifting() {
        let c = compressor();
        let values: Vec<f64> = (0..1000).map(|i| 20.0 + (i as f64 * 0.1).sin()).collect();

        let data = c.compress_values(&values).unwrap();
        assert_eq!(c.decompress_values(&data, values.len()).unwrap(), values);
    }

    #[test]
    fn test_empty_input() {
        let c = compressor();
        assert!(c.compress_timestamps(&[]).unwrap().is_empty());
        assert!(c.compress_values(&[]).unwrap().is_empty());
        assert!(c.decompress_timestamps(&[], 0).unwrap().is_empty());
        assert!(c.decompress_values(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn test_count_larger_than_stream_fails() {
        let c = compressor();
        let data = c.compress_timestamps(&[1, 2, 3]).unwrap();
        assert!(matches!(
            c.decompress_timestamps(&data, 4),
            Err(TsError::Decode(_))
        ));

        let data = c.compress_values(&[1.0, 2.0]).unwrap();
        assert!(matches!(
            c.decompress_values(&data, 3),
            Err(TsError::Decode(_))
        ));
    }

    #[test]
    fn test_count_smaller_than_stream_fails() {
        let c = compressor();
        let data = c.compress_values(&[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            c.decompress_values(&data, 2),
            Err(TsError::Decode(_))
        ));
    }

    #[test]
    fn test_garbage_fails() {
        let c = compressor();
        assert!(matches!(
            c.decompress_timestamps(&[0xde, 0xad, 0xbe, 0xef], 1),
            Err(TsError::Decode(_))
        ));
        assert!(matches!(
            c.decompress_values(&[], 1),
            Err(TsError::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_frame_fails() {
        let c = compressor();
        let data = c.compress_timestamps(&(0..64).collect::<Vec<i64>>()).unwrap();
        let truncated = &data[..data.len() / 2];
        assert!(c.decompress_timestamps(truncated, 64).is_err());
    }

    #[test]
    fn test_all_levels_decode() {
        let timestamps: Vec<i64> = (0..100).map(|i| i * 10).collect();
        for level in 1..=4 {
            let c = Compressor::new(CompressionLevel::from_level(level).unwrap());
            let data = c.compress_timestamps(&timestamps).unwrap();
            // Decoding does not depend on the level used to encode
            let decoded = compressor().decompress_timestamps(&data, 100).unwrap();
            assert_eq!(decoded, timestamps);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn any_compressor() -> impl Strategy<Value = Compressor> {
            (1..=4i32).prop_map(|level| {
                Compressor::new(CompressionLevel::from_level(level).unwrap())
            })
        }

        proptest! {
            #[test]
            fn test_any_timestamps_roundtrip(
                c in any_compressor(),
                timestamps in prop::collection::vec(any::<i64>(), 0..500),
            ) {
                let data = c.compress_timestamps(&timestamps).unwrap();
                let decoded = c.decompress_timestamps(&data, timestamps.len()).unwrap();
                prop_assert_eq!(decoded, timestamps);
            }

            #[test]
            fn test_any_values_roundtrip_bit_exact(
                c in any_compressor(),
                bits in prop::collection::vec(any::<u64>(), 0..500),
            ) {
                // Raw bit patterns cover NaN payloads, infinities and -0.0
                let values: Vec<f64> = bits.iter().map(|&b| f64::from_bits(b)).collect();
                let data = c.compress_values(&values).unwrap();
                let decoded = c.decompress_values(&data, values.len()).unwrap();
                let decoded_bits: Vec<u64> = decoded.iter().map(|v| v.to_bits()).collect();
                prop_assert_eq!(decoded_bits, bits);
            }
        }
    }
}
