//! Shared task state on Redis.
//!
//! [`RedisBackend`] lets the correlator, the workers and the reaper run in
//! separate processes while agreeing on one set of task records. A read is a
//! single `HGETALL`. Each write runs as a server-side Lua script
//! (`redis::Script`) so the record hash, the namespace index and the key
//! expiry change together.
//!
//! Layout, with `P` the configured prefix and `N` the namespace:
//!
//! - `P:tasks:N:<id>` is a hash with `version` (decimal u64), `data` (the
//!   record JSON) and, when the record expires, `expires_at` (epoch millis).
//! - `P:idx:N` is a sorted set of ids scored by insertion time.
//! - `P:seq:N` is the counter every write draws its new version from.
//!
//! Drawing versions from one counter per namespace keeps them unique even
//! when Redis evicts a hash and the same id is created again, so a writer
//! holding a token from before the eviction always loses its CAS.
//!
//! ```rust,no_run
//! use taskbridge::store::generic::GenericTaskStore;
//! use taskbridge::store::redis::RedisBackend;
//!
//! # async fn example() -> Result<(), taskbridge::store::StorageError> {
//! let store = GenericTaskStore::new(RedisBackend::new("redis://127.0.0.1:6379").await?);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::store::backend::{parse_key, StorageBackend, StorageError, VersionedRecord};

const DEFAULT_PREFIX: &str = "taskbridge";

/// KEYS: record hash, index, sequence.
/// ARGV: json, expiry ms or "", id, score, now ms.
/// Replies `{1, version}` on insert and `{0, version}` when a live record
/// already holds the key.
const INSERT_SCRIPT: &str = r#"
local held = redis.call('HGET', KEYS[1], 'version')
if held then
    local deadline = redis.call('HGET', KEYS[1], 'expires_at')
    if (not deadline) or tonumber(deadline) > tonumber(ARGV[5]) then
        return {0, tonumber(held)}
    end
end

local version = redis.call('INCR', KEYS[3])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'version', tostring(version), 'data', ARGV[1])
if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
    redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[2]))
end
redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[3])
return {1, version}
"#;

/// KEYS: record hash, sequence.
/// ARGV: json, expected version, expiry ms or "".
/// Replies `{1, new}` on success, `{0, held}` on a stale token and `{-1, 0}`
/// when the record is gone.
const CAS_SCRIPT: &str = r#"
local held = redis.call('HGET', KEYS[1], 'version')
if not held then
    return {-1, 0}
end
if tonumber(held) ~= tonumber(ARGV[2]) then
    return {0, tonumber(held)}
end

local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'version', tostring(version), 'data', ARGV[1])
if ARGV[3] == '' then
    redis.call('HDEL', KEYS[1], 'expires_at')
    redis.call('PERSIST', KEYS[1])
else
    redis.call('HSET', KEYS[1], 'expires_at', ARGV[3])
    redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[3]))
end
return {1, version}
"#;

/// KEYS: record hash, index. ARGV: id. Replies 1 when a hash was removed.
const DELETE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
return redis.call('DEL', KEYS[1])
"#;

/// Task records kept in Redis hashes.
///
/// Status rules and TTL policy belong to
/// [`GenericTaskStore`](crate::store::generic::GenericTaskStore); this type
/// only moves versioned bytes. Clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    prefix: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to `url` and uses the `taskbridge` key prefix.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] when the URL is malformed or the server is
    /// unreachable.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("bad redis url {url}: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("cannot reach redis at {url}: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Namespaces every key under `prefix` instead of `taskbridge`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn record_key(&self, namespace: &str, id: &str) -> String {
        format!("{}:tasks:{namespace}:{id}", self.prefix)
    }

    fn index_key(&self, namespace: &str) -> String {
        format!("{}:idx:{namespace}", self.prefix)
    }

    fn sequence_key(&self, namespace: &str) -> String {
        format!("{}:seq:{namespace}", self.prefix)
    }

    async fn fetch(&self, namespace: &str, id: &str) -> Result<HashMap<String, String>, ::redis::RedisError> {
        self.conn.clone().hgetall(self.record_key(namespace, id)).await
    }
}

fn namespaced(key: &str) -> Result<(&str, &str), StorageError> {
    parse_key(key).ok_or_else(|| StorageError::Backend {
        message: format!("key {key} has no namespace"),
        source: None,
    })
}

fn namespace_of(prefix: &str) -> Result<&str, StorageError> {
    prefix.strip_suffix(':').ok_or_else(|| StorageError::Backend {
        message: format!("listing prefix {prefix} must end with ':'"),
        source: None,
    })
}

fn as_text(data: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Backend {
        message: format!("record bytes are not UTF-8: {e}"),
        source: Some(Box::new(e)),
    })
}

fn deadline_arg(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|at| at.timestamp_millis().to_string())
        .unwrap_or_default()
}

fn backend_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("redis call on {key} failed: {err}"),
        source: Some(Box::new(err)),
    }
}

/// Redis evicts lazily, so a hash can outlive its deadline for a moment.
fn past_deadline(fields: &HashMap<String, String>) -> bool {
    fields
        .get("expires_at")
        .and_then(|raw| raw.parse::<i64>().ok())
        .is_some_and(|ms| ms <= Utc::now().timestamp_millis())
}

fn decode_hash(key: &str, fields: &HashMap<String, String>) -> Result<VersionedRecord, StorageError> {
    let version = fields
        .get("version")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| StorageError::Backend {
            message: format!("hash for {key} has no usable version"),
            source: None,
        })?;
    let data = fields.get("data").ok_or_else(|| StorageError::Backend {
        message: format!("hash for {key} has no data"),
        source: None,
    })?;
    Ok(VersionedRecord {
        data: data.as_bytes().to_vec(),
        version,
    })
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let (namespace, id) = namespaced(key)?;
        let fields = self
            .fetch(namespace, id)
            .await
            .map_err(|e| backend_error(e, key))?;
        if fields.is_empty() || past_deadline(&fields) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        decode_hash(key, &fields)
    }

    async fn insert(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let (namespace, id) = namespaced(key)?;
        let now_ms = Utc::now().timestamp_millis();

        let (inserted, version): (i64, i64) = Script::new(INSERT_SCRIPT)
            .key(self.record_key(namespace, id))
            .key(self.index_key(namespace))
            .key(self.sequence_key(namespace))
            .arg(as_text(data)?)
            .arg(deadline_arg(expires_at))
            .arg(id)
            .arg(now_ms)
            .arg(now_ms)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| backend_error(e, key))?;

        match inserted {
            1 => Ok(version as u64),
            _ => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let (namespace, id) = namespaced(key)?;

        let (outcome, version): (i64, i64) = Script::new(CAS_SCRIPT)
            .key(self.record_key(namespace, id))
            .key(self.sequence_key(namespace))
            .arg(as_text(data)?)
            .arg(expected_version)
            .arg(deadline_arg(expires_at))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| backend_error(e, key))?;

        if outcome == 1 {
            return Ok(version as u64);
        }
        // A vanished record reports version 0, like the in-memory backend.
        Err(StorageError::VersionConflict {
            key: key.to_string(),
            expected: expected_version,
            actual: if outcome == 0 { version as u64 } else { 0 },
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let (namespace, id) = namespaced(key)?;
        let removed: i64 = Script::new(DELETE_SCRIPT)
            .key(self.record_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| backend_error(e, key))?;
        Ok(removed > 0)
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let namespace = namespace_of(prefix)?;
        let index = self.index_key(namespace);

        let ids: Vec<String> = self
            .conn
            .clone()
            .zrange(&index, 0, -1)
            .await
            .map_err(|e| backend_error(e, prefix))?;

        let mut found = Vec::with_capacity(ids.len());
        let mut stale_ids = Vec::new();
        for id in ids {
            let fields = self
                .fetch(namespace, &id)
                .await
                .map_err(|e| backend_error(e, prefix))?;
            if fields.is_empty() || past_deadline(&fields) {
                stale_ids.push(id);
                continue;
            }
            let key = format!("{namespace}:{id}");
            match decode_hash(&key, &fields) {
                Ok(record) => found.push((key, record)),
                Err(e) => tracing::warn!(%key, error = %e, "skipping unreadable task hash"),
            }
        }

        if !stale_ids.is_empty() {
            let pruned: Result<(), ::redis::RedisError> =
                self.conn.clone().zrem(&index, &stale_ids).await;
            if let Err(e) = pruned {
                tracing::debug!(error = %e, count = stale_ids.len(), "index prune failed");
            }
        }

        Ok(found)
    }

    /// Redis drops expired hashes on its own and listings prune the index,
    /// so there is nothing to sweep here.
    async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

/// Runs against a live server: `REDIS_URL` or `redis://127.0.0.1:6379`.
///
/// ```bash
/// cargo test --features redis-tests -- redis_ --test-threads=1
/// ```
///
/// Every backend gets a random prefix, so runs never collide.
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;
    use crate::domain::{Payload, TaskStatus, TaskUpdate};
    use crate::error::TaskError;
    use crate::store::{GenericTaskStore, StoreConfig, TaskStore};
    use std::sync::Arc;
    use std::time::Duration;

    async fn scratch_backend() -> RedisBackend {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBackend::new(&url)
            .await
            .expect("no redis server for integration tests")
            .with_prefix(format!("scratch-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_unknown_key_is_not_found() {
        let backend = scratch_backend().await;
        let result = backend.get("task:nobody").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn redis_inserted_bytes_read_back() {
        let backend = scratch_backend().await;
        let version = backend.insert("task:1", b"hello", None).await.unwrap();
        let record = backend.get("task:1").await.unwrap();
        assert_eq!(record.data, b"hello");
        assert_eq!(record.version, version);
    }

    #[tokio::test]
    async fn redis_second_insert_is_refused() {
        let backend = scratch_backend().await;
        backend.insert("task:1", b"a", None).await.unwrap();
        let result = backend.insert("task:1", b"b", None).await;
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn redis_cas_bumps_version_and_refuses_old_token() {
        let backend = scratch_backend().await;
        let v1 = backend.insert("task:1", b"v1", None).await.unwrap();
        let v2 = backend.put_if_version("task:1", b"v2", v1, None).await.unwrap();
        assert!(v2 > v1);

        match backend.put_if_version("task:1", b"v3", v1, None).await {
            Err(StorageError::VersionConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, v1);
                assert_eq!(actual, v2);
            },
            other => panic!("stale token was accepted: {other:?}"),
        }
    }

    #[tokio::test]
    async fn redis_cas_on_vanished_record_conflicts() {
        let backend = scratch_backend().await;
        let result = backend.put_if_version("task:gone", b"x", 1, None).await;
        assert!(matches!(
            result,
            Err(StorageError::VersionConflict { actual: 0, .. })
        ));
    }

    #[tokio::test]
    async fn redis_lapsed_record_can_be_recreated() {
        let backend = scratch_backend().await;
        let past = Utc::now() - chrono::Duration::seconds(1);
        let v1 = backend.insert("task:1", b"old", Some(past)).await.unwrap();
        assert!(matches!(
            backend.get("task:1").await,
            Err(StorageError::NotFound { .. })
        ));
        let v2 = backend.insert("task:1", b"new", None).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn redis_listing_follows_deletes() {
        let backend = scratch_backend().await;
        backend.insert("task:a", b"1", None).await.unwrap();
        backend.insert("task:b", b"2", None).await.unwrap();
        backend.insert("other:c", b"3", None).await.unwrap();
        assert_eq!(backend.list_by_prefix("task:").await.unwrap().len(), 2);

        assert!(backend.delete("task:a").await.unwrap());
        assert!(!backend.delete("task:a").await.unwrap());
        let listed = backend.list_by_prefix("task:").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "task:b");
    }

    #[tokio::test]
    async fn redis_store_admits_one_claim() {
        let store = Arc::new(GenericTaskStore::new(scratch_backend().await).with_config(
            StoreConfig {
                task_ttl: Some(Duration::from_secs(30)),
                ..StoreConfig::default()
            },
        ));
        store.create("c-1", Payload::text("x")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
                    .await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(TaskError::Conflict { .. }) => {},
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
