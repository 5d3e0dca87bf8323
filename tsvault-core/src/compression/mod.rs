//! Compression for time-series blocks
//!
//! Timestamps are stored as delta-of-delta, values as the XOR of successive
//! IEEE-754 bit patterns. Both streams are fixed-width little-endian words
//! handed to zstd, which collapses the long zero runs that regular sampling
//! and slowly drifting values produce.

mod codec;

pub use codec::Compressor;

use crate::{Result, TsError};

/// Byte-compression speed/ratio trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Fastest,
    #[default]
    Default,
    Better,
    Best,
}

impl CompressionLevel {
    /// Map the 1..=4 configuration value onto a level
    pub fn from_level(level: i32) -> Result<Self> {
        match level {
            1 => Ok(CompressionLevel::Fastest),
            2 => Ok(CompressionLevel::Default),
            3 => Ok(CompressionLevel::Better),
            4 => Ok(CompressionLevel::Best),
            other => Err(TsError::Config(format!(
                "compression level must be between 1 and 4, got {}",
                other
            ))),
        }
    }

    /// Configuration value for this level
    pub fn as_level(&self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Default => 2,
            CompressionLevel::Better => 3,
            CompressionLevel::Best => 4,
        }
    }

    /// zstd level used for this setting
    pub fn zstd_level(&self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Default => 3,
            CompressionLevel::Better => 7,
            CompressionLevel::Best => 11,
        }
    }
}
