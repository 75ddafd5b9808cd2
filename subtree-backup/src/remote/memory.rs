//! In-process object store.
//!
//! Records every call it receives, which lets callers check idempotence and
//! dry-run behaviour without a network.

use super::{ByteReader, ObjectStore, PutOptions};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub storage_class: String,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    calls: Arc<AtomicUsize>,
    puts: Arc<AtomicUsize>,
    fail_puts_ending_with: Arc<RwLock<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of store operations served
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of put operations served (successful or not)
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Delete an object without counting a call (out-of-band change).
    pub async fn remove(&self, key: &str) -> Option<StoredObject> {
        self.objects.write().await.remove(key)
    }

    /// Make every put whose key ends with `suffix` fail with a transport error.
    pub async fn fail_puts_ending_with(&self, suffix: Option<&str>) {
        *self.fail_puts_ending_with.write().await = suffix.map(str::to_string);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.read().await.get(key).map(|o| o.data.clone()))
    }

    async fn count(&self, key: &str) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(usize::from(self.objects.read().await.contains_key(key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn put_stream(&self, key: &str, mut body: ByteReader, options: &PutOptions) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.puts.fetch_add(1, Ordering::SeqCst);

        if let Some(suffix) = self.fail_puts_ending_with.read().await.as_deref() {
            if key.ends_with(suffix) {
                return Err(BackupError::Transport(format!("injected failure for {}", key)));
            }
        }

        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(|e| BackupError::Transport(format!("reading body for {}: {}", key, e)))?;
        let len = data.len() as u64;

        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                storage_class: options.storage_class.clone(),
            },
        );
        Ok(len)
    }
}
