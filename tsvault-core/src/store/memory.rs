//! In-memory store on a lock-free skip list

use super::{prefix_keys, KvStore};
use crate::{Result, TsError};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Volatile store, mainly for tests and `in_memory` databases
#[derive(Default)]
pub struct MemoryStore {
    map: SkipMap<Vec<u8>, Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TsError::Closed("store"));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.map.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.map.remove(key);
        Ok(())
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
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
