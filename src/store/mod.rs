//! Key-scoped JSON storage with a byte quota.
//!
//! `save` never fails outward. On quota exhaustion it trims completed entries
//! from the mutation queue key, retries once, and otherwise drops the write.

pub mod sqlite;

use crate::errors::{AppError, AppResult};
use crate::models::PendingChange;
use crate::queue::{trim_completed, QUEUE_KEY};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub use sqlite::SqliteBackend;

pub const SCHEMA_VERSION: u32 = 1;

pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    /// Fails with `AppError::StorageQuotaExceeded` when the write does not fit.
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;
    fn keys(&self) -> AppResult<Vec<String>>;
    fn used_bytes(&self) -> AppResult<usize>;
}

#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes: AtomicUsize::new(quota_bytes),
        }
    }

    pub fn set_quota(&self, quota_bytes: usize) {
        self.quota_bytes.store(quota_bytes, Ordering::SeqCst);
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("storage mutex poisoned".to_string()))
    }
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut entries = self.lock()?;
        let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let existing = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let projected = used - existing + entry_size(key, value);
        let quota = self.quota_bytes.load(Ordering::SeqCst);
        if projected > quota {
            return Err(AppError::StorageQuotaExceeded(format!(
                "{} needs {} bytes, quota is {}",
                key, projected, quota
            )));
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> AppResult<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn used_bytes(&self) -> AppResult<usize> {
        Ok(self.lock()?.iter().map(|(k, v)| entry_size(k, v)).sum())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, T: ?Sized> {
    schema_version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    schema_version: u32,
    data: T,
}

#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    quota_eviction_target: usize,
    queue_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("prefix", &self.prefix)
            .field("quota_eviction_target", &self.quota_eviction_target)
            .finish()
    }
}

impl PersistentStore {
    pub fn new(backend: Arc<dyn StorageBackend>, prefix: impl Into<String>, quota_eviction_target: usize) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            quota_eviction_target,
            queue_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory(quota_bytes: usize) -> Self {
        Self::new(Arc::new(MemoryBackend::new(quota_bytes)), "devicehub", 10)
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Serializes every read-modify-write of the mutation queue key, including quota relief.
    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Persists `value` under `key`. Returns whether the write landed.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let raw = match serde_json::to_string(&EnvelopeRef {
            schema_version: SCHEMA_VERSION,
            data: value,
        }) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::error!(key = %key, error = %error, "failed to serialize value, write dropped");
                return false;
            }
        };

        let scoped = self.scoped(key);
        match self.backend.set(&scoped, &raw) {
            Ok(()) => true,
            Err(AppError::StorageQuotaExceeded(reason)) => {
                tracing::warn!(key = %key, reason = %reason, "storage quota exceeded, evicting completed changes");
                let retry_raw = self.relieve_quota(key, raw);
                match self.backend.set(&scoped, &retry_raw) {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::error!(key = %key, error = %error, "write dropped after quota eviction");
                        false
                    }
                }
            }
            Err(error) => {
                tracing::error!(key = %key, error = %error, "write dropped");
                false
            }
        }
    }

    /// Returns `None` for a missing key, undecodable data, or another schema version.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(&self.scoped(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "storage read failed");
                return None;
            }
        };
        match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(envelope) if envelope.schema_version == SCHEMA_VERSION => Some(envelope.data),
            Ok(envelope) => {
                tracing::info!(
                    key = %key,
                    found = envelope.schema_version,
                    expected = SCHEMA_VERSION,
                    "ignoring value stored with another schema version"
                );
                None
            }
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "stored value could not be decoded");
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(error) = self.backend.remove(&self.scoped(key)) {
            tracing::warn!(key = %key, error = %error, "failed to remove key");
        }
    }

    /// Removes every key under this store's prefix.
    pub fn clear(&self) {
        let prefix = format!("{}:", self.prefix);
        match self.backend.keys() {
            Ok(keys) => {
                for key in keys.into_iter().filter(|key| key.starts_with(&prefix)) {
                    if let Err(error) = self.backend.remove(&key) {
                        tracing::warn!(key = %key, error = %error, "failed to remove key");
                    }
                }
            }
            Err(error) => tracing::warn!(error = %error, "failed to list keys for clear"),
        }
    }

    /// Trims completed queue entries. Returns the payload to retry with.
    fn relieve_quota(&self, key: &str, raw: String) -> String {
        if key == QUEUE_KEY {
            let Ok(envelope) = serde_json::from_str::<Envelope<Vec<PendingChange>>>(&raw) else {
                return raw;
            };
            let mut changes = envelope.data;
            let evicted = trim_completed(&mut changes, self.quota_eviction_target);
            tracing::info!(evicted, remaining = changes.len(), "trimmed queue being written");
            return serde_json::to_string(&EnvelopeRef {
                schema_version: SCHEMA_VERSION,
                data: &changes,
            })
            .unwrap_or(raw);
        }

        // Queue writers save under this lock and land in the branch above.
        let _queue = self.lock_queue();
        let Some(mut changes) = self.load::<Vec<PendingChange>>(QUEUE_KEY) else {
            return raw;
        };
        let evicted = trim_completed(&mut changes, self.quota_eviction_target);
        if evicted > 0 {
            let trimmed = serde_json::to_string(&EnvelopeRef {
                schema_version: SCHEMA_VERSION,
                data: &changes,
            });
            match trimmed {
                Ok(trimmed) => {
                    if let Err(error) = self.backend.set(&self.scoped(QUEUE_KEY), &trimmed) {
                        tracing::warn!(error = %error, "failed to persist trimmed queue");
                    } else {
                        tracing::info!(evicted, remaining = changes.len(), "trimmed persisted queue");
                    }
                }
                Err(error) => tracing::warn!(error = %error, "failed to serialize trimmed queue"),
            }
        }
        raw
    }
}
