//! WAL replay for recovery

use super::{list_segments, WalEntry};
use crate::{Result, TsError, WriteRequest};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

/// Outcome of a successful replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Segments fully replayed and removed
    pub segments: usize,
    /// Entries handed to the handler
    pub entries: usize,
    /// Segments whose final, unterminated line was dropped
    pub torn_tails: usize,
}

/// Replay every WAL segment in `dir` through `handler`, oldest first.
///
/// A segment is deleted only after all of its entries were handled. A
/// newline-terminated entry that fails to parse, or a handler error, stops the
/// replay and leaves that segment in place; segments replayed before it stay
/// deleted. A missing directory is not an error.
pub fn replay_wal<F>(dir: &Path, mut handler: F) -> Result<ReplayStats>
where
    F: FnMut(WriteRequest) -> Result<()>,
{
    let mut stats = ReplayStats::default();

    for (_, path) in list_segments(dir)? {
        let (entries, torn) = replay_segment(&path, &mut handler)?;

        fs::remove_file(&path)
            .map_err(|e| TsError::Wal(format!("failed to remove replayed segment {:?}: {}", path, e)))?;

        info!("Replayed {} entries from {:?}", entries, path);
        stats.segments += 1;
        stats.entries += entries;
        if torn {
            stats.torn_tails += 1;
        }
    }

    Ok(stats)
}

fn replay_segment<F>(path: &Path, handler: &mut F) -> Result<(usize, bool)>
where
    F: FnMut(WriteRequest) -> Result<()>,
{
    let file = File::open(path)
        .map_err(|e| TsError::Wal(format!("failed to open {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let mut line = Vec::new();
    let mut line_no = 0usize;
    let mut entries = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| TsError::Wal(format!("failed to read {:?}: {}", path, e)))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let terminated = line.last() == Some(&b'\n');
        let body = trim_line(&line);
        if body.is_empty() {
            continue;
        }

        let entry = match WalEntry::from_line(body) {
            Ok(entry) => entry,
            Err(e) if !terminated => {
                // Crash while the last entry was being written
                warn!(
                    "Dropping torn entry at line {} of {:?}: {}",
                    line_no, path, e
                );
                return Ok((entries, true));
            }
            Err(e) => {
                return Err(TsError::Wal(format!(
                    "failed to parse entry at line {} of {:?}: {}",
                    line_no, path, e
                )));
            }
        };

        if let Err(e) = handler(entry.into_request()) {
            warn!("Replay handler failed at line {} of {:?}: {}", line_no, path, e);
            return Err(e);
        }
        entries += 1;
    }

    Ok((entries, false))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end.max(start)]
}
