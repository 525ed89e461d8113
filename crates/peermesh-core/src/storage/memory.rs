//! In-memory store for tests and ephemeral sessions.

use super::{BlobMeta, Store};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, String>,
    blobs: HashMap<String, (BlobMeta, Vec<u8>)>,
}

/// Volatile [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// New empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().kv.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.lock().kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock().kv.remove(key);
        Ok(())
    }

    fn put_blob(&self, tid: &str, meta: &BlobMeta, bytes: &[u8]) -> Result<()> {
        self.lock()
            .blobs
            .insert(tid.to_string(), (meta.clone(), bytes.to_vec()));
        Ok(())
    }

    fn get_blob(&self, tid: &str) -> Result<Option<(BlobMeta, Vec<u8>)>> {
        Ok(self.lock().blobs.get(tid).cloned())
    }

    fn delete_blob(&self, tid: &str) -> Result<()> {
        self.lock().blobs.remove(tid);
        Ok(())
    }
}
