//! Write-Ahead Log (WAL) implementation
//!
//! Every accepted write request is appended to the WAL before it is buffered
//! for the key-value store. On startup `replay_wal` feeds the logged requests
//! back through the write path and removes each segment once it has been
//! fully replayed.

mod entry;
mod reader;
mod writer;

pub use entry::WalEntry;
pub use reader::{replay_wal, ReplayStats};
pub use writer::Wal;

use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL segments
    pub dir: PathBuf,
    /// Interval of the background sync
    pub flush_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            flush_interval: crate::config::WAL_FLUSH_INTERVAL,
        }
    }
}

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";

pub(crate) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{}{:020}{}", SEGMENT_PREFIX, segment_id, SEGMENT_SUFFIX))
}

pub(crate) fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix(SEGMENT_PREFIX))
        .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
        .and_then(|s| s.parse().ok())
}

/// WAL segments in `dir`, oldest first. A missing directory has none.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }

    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
