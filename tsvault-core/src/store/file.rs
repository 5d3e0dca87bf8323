//! File-backed store: an append-only record log replayed into a skip list
//!
//! Overwritten and deleted records stay in the log until it is compacted.
//! Compaction rewrites the live keys to a side file, syncs it, and renames
//! it over the log. It runs at open and after an append once the log is past
//! a minimum size and at least half of it is dead.

use super::{prefix_keys, KvStore};
use crate::{Result, TsError};
use bytes::{Buf, BufMut, BytesMut};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordOp {
    Set = 1,
    Delete = 2,
}

impl TryFrom<u8> for RecordOp {
    type Error = TsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordOp::Set),
            2 => Ok(RecordOp::Delete),
            _ => Err(TsError::Decode(format!("invalid record op: {}", value))),
        }
    }
}

/// Length prefix, op, key length, value length, checksum
const RECORD_OVERHEAD: usize = 4 + 1 + 4 + 4 + 4;

/// Encode a record.
///
/// Format:
/// - 4 bytes: record length (excluding this field)
/// - 1 byte: op
/// - 4 bytes: key length
/// - N bytes: key
/// - 4 bytes: value length
/// - N bytes: value
/// - 4 bytes: CRC32 of everything after the length prefix
/// Encoded size of a record holding `key` and `value`
fn record_size(key: &[u8], value: &[u8]) -> u64 {
    (RECORD_OVERHEAD + key.len() + value.len()) as u64
}

fn encode_record(op: RecordOp, key: &[u8], value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RECORD_OVERHEAD + key.len() + value.len());

    buf.put_u32_le(0);
    buf.put_u8(op as u8);
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);

    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    let len = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    buf
}

enum Decoded<'a> {
    Record {
        op: RecordOp,
        key: &'a [u8],
        value: &'a [u8],
        size: usize,
    },
    /// Not enough bytes for a whole record
    Incomplete,
}

fn decode_record(data: &[u8]) -> Result<Decoded<'_>> {
    if data.len() < 4 {
        return Ok(Decoded::Incomplete);
    }
    let len = (&data[..4]).get_u32_le() as usize;
    if data.len() < 4 + len {
        return Ok(Decoded::Incomplete);
    }
    if len < RECORD_OVERHEAD - 4 {
        return Err(TsError::Decode(format!("record length {} too small", len)));
    }

    let body = &data[4..4 + len];
    let (payload, mut trailer) = body.split_at(len - 4);
    let expected = trailer.get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(TsError::Decode(format!(
            "record checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    let mut cursor = payload;
    let op = RecordOp::try_from(cursor.get_u8())?;
    let key_len = cursor.get_u32_le() as usize;
    if cursor.len() < key_len + 4 {
        return Err(TsError::Decode("record key overruns record".into()));
    }
    let (key, mut rest) = cursor.split_at(key_len);
    let value_len = rest.get_u32_le() as usize;
    if rest.len() != value_len {
        return Err(TsError::Decode("record value length mismatch".into()));
    }

    Ok(Decoded::Record {
        op,
        key,
        value: rest,
        size: 4 + len,
    })
}

/// The open log and its byte accounting
struct LogFile {
    file: File,
    /// Bytes in the log
    len: u64,
    /// Bytes a fresh log of the live keys would take
    live: u64,
}

impl LogFile {
    fn dead(&self) -> u64 {
        self.len.saturating_sub(self.live)
    }
}

/// Durable store. Every `set` and `delete` is appended and synced before it
/// returns; the full key space is kept in memory.
pub struct FileStore {
    path: PathBuf,
    map: SkipMap<Vec<u8>, Vec<u8>>,
    file: Mutex<Option<LogFile>>,
    compaction_min_bytes: u64,
}

impl FileStore {
    /// Open or create the log at `path` and load its contents
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_compaction(path, crate::config::STORE_COMPACTION_MIN_BYTES)
    }

    /// Like `open`, compacting once the log reaches `min_bytes`
    pub fn open_with_compaction(path: impl AsRef<Path>, min_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Left behind by a compaction that never reached its rename
        let side = Self::compaction_path(&path);
        if side.exists() {
            warn!("Removing unfinished compaction file {:?}", side);
            fs::remove_file(&side)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| TsError::Store(format!("failed to open {:?}: {}", path, e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let map = SkipMap::new();
        let mut offset = 0usize;
        let mut records = 0usize;

        while offset < data.len() {
            let remaining = &data[offset..];
            match decode_record(remaining) {
                Ok(Decoded::Record {
                    op,
                    key,
                    value,
                    size,
                }) => {
                    match op {
                        RecordOp::Set => {
                            map.insert(key.to_vec(), value.to_vec());
                        }
                        RecordOp::Delete => {
                            map.remove(key);
                        }
                    }
                    offset += size;
                    records += 1;
                }
                Ok(Decoded::Incomplete) => break,
                // A bad final record is a torn write; anything earlier is corruption
                Err(e) if Self::is_last_record(remaining) => {
                    warn!("Discarding corrupt final record in {:?}: {}", path, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if offset < data.len() {
            warn!(
                "Truncating {} torn bytes at offset {} of {:?}",
                data.len() - offset,
                offset,
                path
            );
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        let live: u64 = map
            .iter()
            .map(|entry| record_size(entry.key(), entry.value()))
            .sum();

        info!(
            "Opened store {:?}: {} records, {} keys",
            path,
            records,
            map.len()
        );

        let store = Self {
            path,
            map,
            file: Mutex::new(Some(LogFile {
                file,
                len: offset as u64,
                live,
            })),
            compaction_min_bytes: min_bytes,
        };

        {
            let mut guard = store.file.lock();
            if guard.as_ref().is_some_and(|log| store.needs_compaction(log)) {
                store.rewrite(&mut guard)?;
            }
        }
        Ok(store)
    }

    fn is_last_record(data: &[u8]) -> bool {
        data.len() >= 4 && 4 + (&data[..4]).get_u32_le() as usize == data.len()
    }

    fn compaction_path(path: &Path) -> PathBuf {
        path.with_extension("compact")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Bytes currently in the log
    pub fn log_size(&self) -> Result<u64> {
        let guard = self.file.lock();
        let log = guard.as_ref().ok_or(TsError::Closed("store"))?;
        Ok(log.len)
    }

    /// Rewrite the log to hold only live keys
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            return Err(TsError::Closed("store"));
        }
        self.rewrite(&mut guard)
    }

    fn needs_compaction(&self, log: &LogFile) -> bool {
        log.len >= self.compaction_min_bytes && log.dead() >= log.live
    }

    /// Write the live keys to the side file and rename it over the log. If
    /// the log cannot be reopened after the rename, the store is left closed.
    fn rewrite(&self, slot: &mut Option<LogFile>) -> Result<()> {
        let before = slot.as_ref().map_or(0, |log| log.len);
        let side = Self::compaction_path(&self.path);

        let written = match self.write_live(&side) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&side);
                return Err(e);
            }
        };
        fs::rename(&side, &self.path)
            .map_err(|e| TsError::Store(format!("failed to replace {:?}: {}", self.path, e)))?;

        // The old handle now points at the replaced file
        *slot = None;
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TsError::Store(format!("failed to reopen {:?}: {}", self.path, e)))?;
        *slot = Some(LogFile {
            file,
            len: written,
            live: written,
        });
        sync_parent(&self.path)?;

        info!(
            "Compacted store {:?}: {} -> {} bytes, {} keys",
            self.path,
            before,
            written,
            self.map.len()
        );
        Ok(())
    }

    fn write_live(&self, side: &Path) -> Result<u64> {
        let mut writer = BufWriter::new(File::create(side)?);
        let mut written = 0u64;
        for entry in self.map.iter() {
            let record = encode_record(RecordOp::Set, entry.key(), entry.value());
            writer.write_all(&record)?;
            written += record.len() as u64;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(written)
    }

    fn append(&self, op: RecordOp, key: &[u8], value: &[u8]) -> Result<()> {
        let record = encode_record(op, key, value);

        let mut guard = self.file.lock();
        let log = guard.as_mut().ok_or(TsError::Closed("store"))?;
        log.file
            .write_all(&record)
            .and_then(|_| log.file.sync_data())
            .map_err(|e| TsError::Store(format!("failed to append to {:?}: {}", self.path, e)))?;
        log.len += record.len() as u64;

        // Applied under the file lock so the map follows log order
        if let Some(old) = self.map.get(key) {
            log.live -= record_size(key, old.value());
        }
        match op {
            RecordOp::Set => {
                self.map.insert(key.to_vec(), value.to_vec());
                log.live += record_size(key, value);
            }
            RecordOp::Delete => {
                self.map.remove(key);
            }
        }

        if self.needs_compaction(log) {
            debug!("Store {:?}: {} of {} bytes dead", self.path, log.dead(), log.len);
            // The record is already durable
            if let Err(e) = self.rewrite(&mut guard) {
                error!("Compaction of {:?} failed: {}", self.path, e);
            }
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.file.lock().is_none() {
            return Err(TsError::Closed("store"));
        }
        Ok(())
    }
}

/// Make a rename in `path`'s directory durable
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            File::open(parent)?.sync_all()?;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.map.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(RecordOp::Set, key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        if self.map.contains_key(key) {
            self.append(RecordOp::Delete, key, &[])
        } else {
            self.check_open()
        }
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        Ok(self.map.iter().map(|entry| entry.key().clone()).collect())
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        Ok(prefix_keys(&self.map, prefix))
    }

    fn close(&self) -> Result<()> {
        if let Some(log) = self.file.lock().take() {
            log.file.sync_all()?;
            info!("Closed store {:?}", self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::exercise_store;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_contract() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path().join("data.log")).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blocks").join("data.log");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(b"k1", b"v1").unwrap();
            store.set(b"k2", b"v2").unwrap();
            store.set(b"k1", b"v1-updated").unwrap();
            store.delete(b"k2").unwrap();
            store.set(b"empty", b"").unwrap();
            store.close().unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1-updated".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), None);
        assert_eq!(store.get(b"empty").unwrap(), Some(Vec::new()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.log");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(b"good", b"value").unwrap();
            store.close().unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();

        // Half of a second record
        let partial = encode_record(RecordOp::Set, b"torn", b"never-finished");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"good").unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.get(b"torn").unwrap(), None);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        // Appends continue cleanly after truncation
        store.set(b"after", b"ok").unwrap();
        store.close().unwrap();
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"after").unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn test_corrupt_middle_record_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.log");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(b"first", b"1").unwrap();
            store.set(b"second", b"2").unwrap();
            store.close().unwrap();
        }

        let mut data = fs::read(&path).unwrap();
        // Flip a byte inside the first record's key
        data[10] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        assert!(matches!(FileStore::open(&path), Err(TsError::Decode(_))));
    }

    #[test]
    fn test_rewrites_keep_log_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.log");
        let value = vec![7u8; 200];

        {
            let store = FileStore::open_with_compaction(&path, 1024).unwrap();
            store.set(b"other", b"kept").unwrap();
            // One block rewritten over and over, as merged writes do
            for i in 0..240u32 {
                let mut block = value.clone();
                block.extend_from_slice(&i.to_le_bytes());
                store.set(b"block", &block).unwrap();
                assert!(store.log_size().unwrap() < 2048);
            }
            assert_eq!(fs::metadata(&path).unwrap().len(), store.log_size().unwrap());
            store.close().unwrap();
        }

        let store = FileStore::open_with_compaction(&path, 1024).unwrap();
        let mut expected = value;
        expected.extend_from_slice(&239u32.to_le_bytes());
        assert_eq!(store.get(b"block").unwrap(), Some(expected));
        assert_eq!(store.get(b"other").unwrap(), Some(b"kept".to_vec()));
        assert!(!FileStore::compaction_path(&path).exists());
    }

    #[test]
    fn test_compacted_at_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.log");

        {
            let store = FileStore::open_with_compaction(&path, u64::MAX).unwrap();
            for i in 0..50u8 {
                store.set(&[i], &[i; 64]).unwrap();
            }
            // Retention-style deletes leave only dead records behind
            for i in 0..48u8 {
                store.delete(&[i]).unwrap();
            }
            store.close().unwrap();
        }
        let grown = fs::metadata(&path).unwrap().len();

        let store = FileStore::open_with_compaction(&path, 0).unwrap();
        let compacted = fs::metadata(&path).unwrap().len();
        assert!(compacted < grown);
        assert_eq!(compacted, 2 * record_size(&[0], &[0; 64]));
        assert_eq!(store.keys().unwrap(), vec![vec![48u8], vec![49u8]]);
        assert_eq!(store.get(&[49]).unwrap(), Some(vec![49u8; 64]));

        // Appends land in the new log
        store.set(b"after", b"ok").unwrap();
        store.close().unwrap();
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"after").unwrap(), Some(b"ok".to_vec()));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_unfinished_compaction_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.log");
        {
            let store = FileStore::open(&path).unwrap();
            store.set(b"k", b"v").unwrap();
            store.close().unwrap();
        }
        fs::write(FileStore::compaction_path(&path), b"partial").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(!FileStore::compaction_path(&path).exists());

        store.compact().unwrap();
        assert_eq!(store.log_size().unwrap(), record_size(b"k", b"v"));
        store.close().unwrap();
        assert!(matches!(store.compact(), Err(TsError::Closed(_))));
    }

    #[test]
    fn test_record_codec() {
        let record = encode_record(RecordOp::Set, b"key", b"value");
        assert_eq!(record.len(), RECORD_OVERHEAD + 3 + 5);

        match decode_record(&record).unwrap() {
            Decoded::Record {
                op,
                key,
                value,
                size,
            } => {
                assert_eq!(op, RecordOp::Set);
                assert_eq!(key, b"key");
                assert_eq!(value, b"value");
                assert_eq!(size, record.len());
            }
            Decoded::Incomplete => panic!("expected a record"),
        }

        assert!(matches!(
            decode_record(&record[..record.len() - 1]).unwrap(),
            Decoded::Incomplete
        ));
    }
}
