//! WAL writer implementation

use super::{list_segments, segment_path, WalConfig, WalEntry};
use crate::scheduler::PeriodicTask;
use crate::{Result, TsError, WriteRequest};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Append-only log of write requests.
///
/// `append` only buffers; durability comes from `flush`, which the background
/// task also runs every `flush_interval`.
pub struct Wal {
    config: WalConfig,
    inner: Arc<Mutex<WalInner>>,
    flusher: Mutex<Option<PeriodicTask>>,
}

struct WalInner {
    file: Option<BufWriter<File>>,
    segment_id: u64,
    path: PathBuf,
    unsynced: usize,
}

impl WalInner {
    fn sync(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(TsError::Closed("WAL"))?;
        file.flush()
            .map_err(|e| TsError::Wal(format!("failed to flush WAL: {}", e)))?;
        file.get_ref()
            .sync_all()
            .map_err(|e| TsError::Wal(format!("failed to sync WAL: {}", e)))?;
        if self.unsynced > 0 {
            debug!("Synced {} WAL entries to {:?}", self.unsynced, self.path);
        }
        self.unsynced = 0;
        Ok(())
    }
}

impl Wal {
    /// Open a fresh segment in `config.dir` and start the background sync
    pub fn open(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)
            .map_err(|e| TsError::Wal(format!("failed to create WAL directory: {}", e)))?;

        let segment_id = list_segments(&config.dir)?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(1);
        let path = segment_path(&config.dir, segment_id);
        let file = Self::open_segment(&path)?;

        let inner = Arc::new(Mutex::new(WalInner {
            file: Some(BufWriter::new(file)),
            segment_id,
            path: path.clone(),
            unsynced: 0,
        }));

        let weak: Weak<Mutex<WalInner>> = Arc::downgrade(&inner);
        let flusher = PeriodicTask::spawn("wal-flush", config.flush_interval, move || {
            match weak.upgrade() {
                Some(inner) => {
                    let mut inner = inner.lock();
                    if inner.file.is_none() {
                        return Ok(());
                    }
                    inner.sync()
                }
                None => Ok(()),
            }
        })?;

        info!("Opened WAL segment {:?}", path);

        Ok(Self {
            config,
            inner,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Append a write request; not durable until the next flush
    pub fn append(&self, req: &WriteRequest) -> Result<()> {
        let line = WalEntry::from_request(req).to_line()?;

        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(TsError::Closed("WAL"))?;
        file.write_all(&line)
            .map_err(|e| TsError::Wal(format!("failed to write to WAL: {}", e)))?;
        inner.unsynced += 1;
        Ok(())
    }

    /// Flush buffered entries and fsync the segment
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    /// Stop the background sync, flush once more and release the file
    pub fn close(&self) -> Result<()> {
        if let Some(mut flusher) = self.flusher.lock().take() {
            flusher.stop();
        }

        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Ok(());
        }
        inner.sync()?;
        inner.file = None;
        info!("Closed WAL segment {:?}", inner.path);
        Ok(())
    }

    /// Directory holding the segments
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// IDs of the segments on disk, oldest first
    pub fn segments(&self) -> Result<Vec<u64>> {
        Ok(list_segments(&self.config.dir)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// ID of the segment currently appended to
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Entries appended since the last sync
    pub fn unsynced_entries(&self) -> usize {
        self.inner.lock().unsynced
    }

    fn open_segment(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TsError::Wal(format!("failed to open WAL segment {:?}: {}", path, e)))
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close WAL: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metric, Sample, Series};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &Path, flush_interval: Duration) -> WalConfig {
        WalConfig {
            dir: dir.to_path_buf(),
            flush_interval,
        }
    }

    fn request(i: i64) -> WriteRequest {
        WriteRequest::new(
            "t1",
            vec![Series::new(Metric::new("temp"), vec![Sample::new(i, i as f64)])],
        )
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn test_wal_append_and_flush() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(config(temp_dir.path(), Duration::from_secs(3600))).unwrap();

        for i in 0..10 {
            wal.append(&request(i)).unwrap();
        }
        assert_eq!(wal.unsynced_entries(), 10);

        wal.flush().unwrap();
        assert_eq!(wal.unsynced_entries(), 0);
        assert_eq!(line_count(&segment_path(temp_dir.path(), wal.current_segment())), 10);
    }

    #[test]
    fn test_background_flush() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(config(temp_dir.path(), Duration::from_millis(10))).unwrap();
        wal.append(&request(1)).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(wal.unsynced_entries(), 0);
        assert_eq!(line_count(&segment_path(temp_dir.path(), wal.current_segment())), 1);
    }

    #[test]
    fn test_new_segment_per_open() {
        let temp_dir = TempDir::new().unwrap();
        let first = Wal::open(config(temp_dir.path(), Duration::from_secs(1))).unwrap();
        let first_id = first.current_segment();
        first.close().unwrap();

        let second = Wal::open(config(temp_dir.path(), Duration::from_secs(1))).unwrap();
        assert_eq!(second.current_segment(), first_id + 1);
        assert_eq!(second.segments().unwrap(), vec![first_id, first_id + 1]);
    }

    #[test]
    fn test_append_after_close_fails() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(config(temp_dir.path(), Duration::from_secs(1))).unwrap();
        wal.append(&request(1)).unwrap();
        wal.close().unwrap();
        // Close is idempotent
        wal.close().unwrap();

        assert!(matches!(wal.append(&request(2)), Err(TsError::Closed(_))));
        assert!(matches!(wal.flush(), Err(TsError::Closed(_))));
        assert_eq!(line_count(&segment_path(temp_dir.path(), wal.current_segment())), 1);
    }
}
