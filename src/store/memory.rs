//! In-memory storage backend.
//!
//! [`InMemoryBackend`] is a thread-safe [`StorageBackend`] built on
//! `DashMap`. It shares state only within one process, so it suits tests and
//! the single-process `chat` mode; multi-process deployments use the Redis
//! backend.
//!
//! # Concurrency
//!
//! `DashMap` shard locks make `insert` and `put_if_version` atomic per key,
//! which is all the compare-and-set contract needs.
//!
//! # Examples
//!
//! ```
//! use taskbridge::store::generic::GenericTaskStore;
//! use taskbridge::store::memory::InMemoryBackend;
//!
//! let store = GenericTaskStore::new(InMemoryBackend::new());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }

    fn to_record(&self) -> VersionedRecord {
        VersionedRecord {
            data: self.data.clone(),
            version: self.version,
        }
    }
}

/// Process-local records in a sharded [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, StoredEntry>,
}

impl InMemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries, including expired ones not yet
    /// cleaned up.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        if !entry.is_live(Utc::now()) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(entry.to_record())
    }

    async fn insert(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(Utc::now()) {
                    return Err(StorageError::AlreadyExists {
                        key: key.to_string(),
                    });
                }
                let version = occupied.get().version + 1;
                occupied.insert(StoredEntry {
                    data: data.to_vec(),
                    version,
                    expires_at,
                });
                Ok(version)
            },
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    data: data.to_vec(),
                    version: 1,
                    expires_at,
                });
                Ok(1)
            },
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        if !entry.is_live(Utc::now()) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        if entry.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }
        let new_version = entry.version + 1;
        *entry = StoredEntry {
            data: data.to_vec(),
            version: new_version,
            expires_at,
        };
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let now = Utc::now();
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| (entry.key().clone(), entry.value().to_record()))
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let before = self.data.len();
        self.data.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.data.len()))
    }
}
