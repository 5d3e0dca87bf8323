//! Key-value store collaborators
//!
//! The storage engine keeps compressed blocks and the index snapshot in an
//! ordered byte-key store. Writes to a single key are atomic.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::Result;
use crossbeam_skiplist::SkipMap;

/// Ordered byte-key/byte-value store
pub trait KvStore: Send + Sync {
    /// Value stored under `key`, if any
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All keys in ascending byte order
    fn keys(&self) -> Result<Vec<Vec<u8>>>;

    /// Keys starting with `prefix`, in ascending byte order
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    /// Release resources. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;
}

/// Keys of `map` starting with `prefix`, using the map's ordering
pub(crate) fn prefix_keys(map: &SkipMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<Vec<u8>> {
    map.range(prefix.to_vec()..)
        .take_while(|entry| entry.key().starts_with(prefix))
        .map(|entry| entry.key().clone())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::TsError;

    /// Behavior every store must share
    pub(crate) fn exercise_store(store: &dyn KvStore) {
        assert_eq!(store.get(b"missing").unwrap(), None);

        store.set(b"b", b"2").unwrap();
        store.set(b"a", b"1").unwrap();
        store.set(b"c", b"3").unwrap();
        store.set(b"b", b"two").unwrap();

        assert_eq!(store.get(b"b").unwrap(), Some(b"two".to_vec()));
        assert_eq!(
            store.keys().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );

        store.set(b"ba", b"x").unwrap();
        assert_eq!(
            store.keys_with_prefix(b"b").unwrap(),
            vec![b"b".to_vec(), b"ba".to_vec()]
        );
        assert!(store.keys_with_prefix(b"z").unwrap().is_empty());
        store.delete(b"ba").unwrap();

        store.delete(b"a").unwrap();
        store.delete(b"never-set").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.keys().unwrap().len(), 2);

        store.close().unwrap();
        assert!(matches!(store.set(b"d", b"4"), Err(TsError::Closed(_))));
        assert!(matches!(store.get(b"b"), Err(TsError::Closed(_))));
    }
}
