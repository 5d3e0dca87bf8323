//! Time blocks: key layout, payload encoding and selector parsing

use crate::compression::Compressor;
use crate::{Result, Sample, Timestamp, TsError, METRIC_NAME_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Width of a time block in seconds
pub const BLOCK_DURATION: i64 = 3600;

const KEY_SEPARATOR: u8 = b'/';

/// Separator, series ID, separator, block start
const KEY_SUFFIX_LEN: usize = 1 + 8 + 1 + 8;

/// Start of the block containing `ts`, flooring negative timestamps too
pub fn block_start(ts: Timestamp) -> Timestamp {
    ts.div_euclid(BLOCK_DURATION) * BLOCK_DURATION
}

/// Store key: tenant, `/`, big-endian series ID, `/`, big-endian block start
pub fn block_key(tenant_id: &str, series_id: u64, block_start: Timestamp) -> Vec<u8> {
    let mut key = series_prefix(tenant_id, series_id);
    key.extend_from_slice(&block_start.to_be_bytes());
    key
}

/// Common prefix of every block key of one series
pub(crate) fn series_prefix(tenant_id: &str, series_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant_id.len() + KEY_SUFFIX_LEN);
    key.extend_from_slice(tenant_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&series_id.to_be_bytes());
    key.push(KEY_SEPARATOR);
    key
}

/// Split a block key into tenant, series ID and block start.
///
/// Parsed from the end, so tenants may contain the separator.
pub(crate) fn parse_block_key(key: &[u8]) -> Option<(&[u8], u64, Timestamp)> {
    if key.len() < KEY_SUFFIX_LEN {
        return None;
    }
    let (tenant, suffix) = key.split_at(key.len() - KEY_SUFFIX_LEN);
    if suffix[0] != KEY_SEPARATOR || suffix[9] != KEY_SEPARATOR {
        return None;
    }
    let series_id = u64::from_be_bytes(suffix[1..9].try_into().ok()?);
    let start = i64::from_be_bytes(suffix[10..18].try_into().ok()?);
    Some((tenant, series_id, start))
}

/// Value stored under a block key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub count: u32,
    pub timestamps: Vec<u8>,
    pub values: Vec<u8>,
}

impl BlockPayload {
    /// Compress samples already sorted by timestamp
    pub fn encode(compressor: &Compressor, samples: &[Sample]) -> Result<Self> {
        let count = u32::try_from(samples.len())
            .map_err(|_| TsError::Encode(format!("block of {} samples", samples.len())))?;
        let timestamps: Vec<i64> = samples.iter().map(|s| s.timestamp).collect();
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();

        Ok(Self {
            count,
            timestamps: compressor.compress_timestamps(&timestamps)?,
            values: compressor.compress_values(&values)?,
        })
    }

    pub fn decode(&self, compressor: &Compressor) -> Result<Vec<Sample>> {
        let count = self.count as usize;
        let timestamps = compressor.decompress_timestamps(&self.timestamps, count)?;
        let values = compressor.decompress_values(&self.values, count)?;

        Ok(timestamps
            .into_iter()
            .zip(values)
            .map(|(timestamp, value)| Sample::new(timestamp, value))
            .collect())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Unreadable payload bytes are corruption
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| TsError::Decode(format!("block payload: {}", e)))
    }
}

/// Merge `incoming` into `existing`, both in any order.
///
/// Output is sorted by timestamp; for equal timestamps the later sample wins,
/// with `incoming` counting as later than `existing`.
pub(crate) fn merge_samples(existing: Vec<Sample>, incoming: &[Sample]) -> Vec<Sample> {
    let mut all = existing;
    all.extend_from_slice(incoming);
    // Stable, so arrival order survives among equal timestamps
    all.sort_by_key(|s| s.timestamp);

    let mut merged: Vec<Sample> = Vec::with_capacity(all.len());
    for sample in all {
        match merged.last_mut() {
            Some(last) if last.timestamp == sample.timestamp => *last = sample,
            _ => merged.push(sample),
        }
    }
    merged
}

/// Parse `name`, `name{k="v",...}` or `{k="v",...}` into exact-match selectors.
///
/// The metric name becomes a `__name__` selector. It is taken as written, so
/// names stored with dots, dashes or other characters stay queryable.
pub fn parse_label_selectors(query: &str) -> Result<HashMap<String, String>> {
    SelectorParser::new(query).parse()
}

struct SelectorParser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> SelectorParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn error(&self, msg: impl std::fmt::Display) -> TsError {
        TsError::InvalidQuery(format!("{} in {:?}", msg, self.input))
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn identifier(&mut self) -> &'a str {
        let start = match self.chars.peek() {
            Some(&(i, _)) => i,
            None => return "",
        };
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            let valid = c == '_' || c.is_ascii_alphabetic() || (i > start && c.is_ascii_digit());
            if !valid {
                break;
            }
            end = i + c.len_utf8();
            self.chars.next();
        }
        &self.input[start..end]
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            Some((i, c)) => Err(self.error(format!("expected '{}' at {}, found '{}'", expected, i, c))),
            None => Err(self.error(format!("expected '{}' at end", expected))),
        }
    }

    fn quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => return Ok(value),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, c @ ('"' | '\\'))) => value.push(c),
                    Some((i, c)) => {
                        return Err(self.error(format!("unknown escape '\\{}' at {}", c, i)))
                    }
                    None => return Err(self.error("unterminated string")),
                },
                Some((_, c)) => value.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn parse(mut self) -> Result<HashMap<String, String>> {
        let mut selectors = HashMap::new();

        // Everything ahead of the label block is the metric name, verbatim
        let name_end = self.input.find('{').unwrap_or(self.input.len());
        let name = self.input[..name_end].trim();
        if !name.is_empty() {
            selectors.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
        }
        while matches!(self.chars.peek(), Some(&(i, _)) if i < name_end) {
            self.chars.next();
        }

        if matches!(self.chars.peek(), Some((_, '{'))) {
            self.chars.next();
            loop {
                self.skip_whitespace();
                if matches!(self.chars.peek(), Some((_, '}'))) {
                    self.chars.next();
                    break;
                }

                let label = self.identifier();
                if label.is_empty() {
                    return Err(self.error("expected label name"));
                }
                self.expect('=')?;
                let value = self.quoted()?;

                if let Some(previous) = selectors.insert(label.to_string(), value) {
                    if label != METRIC_NAME_LABEL || previous != selectors[label] {
                        return Err(self.error(format!("conflicting selectors for {}", label)));
                    }
                }

                self.skip_whitespace();
                match self.chars.next() {
                    Some((_, ',')) => continue,
                    Some((_, '}')) => break,
                    Some((i, c)) => {
                        return Err(self.error(format!("expected ',' or '}}' at {}, found '{}'", i, c)))
                    }
                    None => return Err(self.error("unterminated selector")),
                }
            }
        }

        self.skip_whitespace();
        if let Some((i, c)) = self.chars.next() {
            return Err(self.error(format!("unexpected '{}' at {}", c, i)));
        }
        if selectors.is_empty() {
            return Err(self.error("empty selector"));
        }
        Ok(selectors)
    }
}
