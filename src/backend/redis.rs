// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend used as the artifact object store.
//!
//! Each object is two keys written in one atomic pipeline:
//!
//! ```text
//! {prefix}obj:{key}   → raw bytes (STRING)
//! {prefix}meta:{key}  → HASH { checksum, modified_at_ms, size }
//! ```
//!
//! Listing scans the metadata keys so large payloads are never pulled
//! unless the filter asks for them.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::sql::millis_to_datetime;
use super::traits::{
    BackendAdapter, BackendError, BackendId, HealthSample, ListEntry, ListFilter, Payload,
};
use crate::resilience::retry::{retry_backend, RetryConfig};

const SCAN_COUNT: usize = 500;

pub struct RedisBackend {
    id: BackendId,
    connection: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect with startup retry. `prefix` namespaces every key.
    pub async fn connect(
        id: impl Into<BackendId>,
        url: &str,
        prefix: Option<&str>,
    ) -> Result<Self, BackendError> {
        let id = id.into();
        let client = Client::open(url).map_err(normalize)?;
        let connection = retry_backend("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await.map_err(normalize)
        })
        .await?;

        info!(backend = %id, prefix = ?prefix, "Redis backend connected");
        Ok(Self {
            id,
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}obj:{}", self.prefix, key)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}meta:{}", self.prefix, key)
    }

    fn strip_meta<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(&self.prefix).and_then(|k| k.strip_prefix("meta:"))
    }

    async fn scan_meta_keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(normalize)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl BackendAdapter for RedisBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn store(&self, key: &str, payload: &Payload) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let meta = [
            ("checksum", payload.checksum.clone()),
            ("modified_at_ms", payload.modified_at.timestamp_millis().to_string()),
            ("size", payload.bytes.len().to_string()),
        ];
        let _: () = redis::pipe()
            .atomic()
            .set(self.object_key(key), payload.bytes.as_slice())
            .ignore()
            .hset_multiple(self.meta_key(key), &meta[..])
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(normalize)?;
        debug!(backend = %self.id, key, size = payload.bytes.len(), "Stored object");
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Payload, BackendError> {
        let mut conn = self.connection.clone();
        let bytes: Option<Vec<u8>> = conn.get(self.object_key(key)).await.map_err(normalize)?;
        let bytes = bytes.ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let meta: HashMap<String, String> = conn.hgetall(self.meta_key(key)).await.map_err(normalize)?;

        let modified_ms = meta
            .get("modified_at_ms")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_default();
        let payload = Payload::new(bytes, millis_to_datetime(modified_ms));
        if let Some(stored) = meta.get("checksum") {
            if stored != &payload.checksum {
                return Err(BackendError::Fatal(format!(
                    "checksum mismatch for {key}: stored {stored}, actual {}",
                    payload.checksum
                )));
            }
        }
        Ok(payload)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ListEntry>, BackendError> {
        let pattern = format!(
            "{}*",
            self.meta_key(&escape_glob(filter.prefix.as_deref().unwrap_or("")))
        );
        let meta_keys = self.scan_meta_keys(&pattern).await?;

        let mut conn = self.connection.clone();
        let mut entries = Vec::with_capacity(meta_keys.len());
        for meta_key in meta_keys {
            let Some(key) = self.strip_meta(&meta_key).map(str::to_string) else {
                continue;
            };
            let meta: HashMap<String, String> = conn.hgetall(&meta_key).await.map_err(normalize)?;
            if meta.is_empty() {
                continue;
            }
            let bytes = if filter.include_payload {
                let b: Option<Vec<u8>> = conn.get(self.object_key(&key)).await.map_err(normalize)?;
                b
            } else {
                None
            };
            entries.push(ListEntry {
                checksum: meta.get("checksum").cloned().unwrap_or_default(),
                modified_at: millis_to_datetime(
                    meta.get("modified_at_ms").and_then(|v| v.parse().ok()).unwrap_or_default(),
                ),
                size: meta.get("size").and_then(|v| v.parse().ok()).unwrap_or_default(),
                key,
                bytes,
            });
            if filter.limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }
        }
        Ok(entries)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .del(vec![self.object_key(key), self.meta_key(key)])
            .await
            .map_err(normalize)?;
        if removed == 0 {
            return Err(BackendError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn probe(&self) -> Result<HealthSample, BackendError> {
        let start = Instant::now();
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(normalize)?;
        Ok(HealthSample { latency: start.elapsed() })
    }
}

fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Map redis errors onto the normalized taxonomy.
fn normalize(err: redis::RedisError) -> BackendError {
    use redis::ErrorKind as K;

    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        return BackendError::Unavailable(err.to_string());
    }
    if err.code() == Some("OOM") {
        return BackendError::QuotaExceeded(err.to_string());
    }
    match err.kind() {
        K::AuthenticationFailed => BackendError::AuthError(err.to_string()),
        K::BusyLoadingError | K::TryAgain | K::ClusterDown | K::MasterDown => {
            BackendError::Transient(err.to_string())
        }
        K::ReadOnly => BackendError::Unavailable(err.to_string()),
        _ => BackendError::Fatal(err.to_string()),
    }
}
