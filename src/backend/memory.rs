// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory backend for tests and local development.
//!
//! Carries simple fault injection so outage scenarios can be scripted
//! without real infrastructure: toggle availability, queue specific error
//! kinds for the next calls, or add artificial latency.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{
    BackendAdapter, BackendError, BackendId, ErrorKind, HealthSample, ListEntry, ListFilter, Payload,
};

pub struct MemoryBackend {
    id: BackendId,
    data: DashMap<String, Payload>,
    available: AtomicBool,
    scripted_errors: Mutex<VecDeque<ErrorKind>>,
    latency_ms: AtomicU64,
    stores: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(id: impl Into<BackendId>) -> Self {
        Self {
            id: id.into(),
            data: DashMap::new(),
            available: AtomicBool::new(true),
            scripted_errors: Mutex::new(VecDeque::new()),
            latency_ms: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Make the next `n` calls fail with `kind`.
    pub fn fail_next(&self, n: usize, kind: ErrorKind) {
        let mut queue = self.scripted_errors.lock();
        for _ in 0..n {
            queue.push_back(kind);
        }
    }

    /// Add latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Number of successful `store` calls.
    #[must_use]
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read a payload bypassing fault injection.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Payload> {
        self.data.get(key).map(|r| r.value().clone())
    }

    /// Write a payload bypassing fault injection (test setup).
    pub fn insert_raw(&self, key: &str, payload: Payload) {
        self.data.insert(key.to_string(), payload);
    }

    async fn gate(&self) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if let Some(kind) = self.scripted_errors.lock().pop_front() {
            return Err(BackendError::of_kind(kind, format!("injected failure on {}", self.id)));
        }
        if !self.is_available() {
            return Err(BackendError::Unavailable(format!("{} is offline", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for MemoryBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn store(&self, key: &str, payload: &Payload) -> Result<(), BackendError> {
        self.gate().await?;
        self.data.insert(key.to_string(), payload.clone());
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Payload, BackendError> {
        self.gate().await?;
        self.data
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ListEntry>, BackendError> {
        self.gate().await?;
        let mut entries: Vec<ListEntry> = self
            .data
            .iter()
            .filter(|r| filter.matches(r.key()))
            .map(|r| ListEntry {
                key: r.key().clone(),
                checksum: r.value().checksum.clone(),
                modified_at: r.value().modified_at,
                size: r.value().bytes.len() as u64,
                bytes: filter.include_payload.then(|| r.value().bytes.clone()),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.gate().await?;
        self.data
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn probe(&self) -> Result<HealthSample, BackendError> {
        let start = Instant::now();
        self.gate().await?;
        Ok(HealthSample { latency: start.elapsed() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payload(s: &str) -> Payload {
        Payload::new(s.as_bytes().to_vec(), Utc::now())
    }

    #[tokio::test]
    async fn test_store_is_upsert() {
        let backend = MemoryBackend::new("mem");
        backend.store("k", &payload("one")).await.unwrap();
        backend.store("k", &payload("one")).await.unwrap();
        backend.store("k", &payload("two")).await.unwrap();

        assert_eq!(backend.len(), 1);
        assert_eq!(backend.fetch("k").await.unwrap().bytes, b"two");
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let backend = MemoryBackend::new("mem");
        let err = backend.fetch("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let backend = MemoryBackend::new("mem");
        assert!(backend.remove("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_offline_backend_is_unavailable() {
        let backend = MemoryBackend::new("mem");
        backend.set_available(false);
        let err = backend.store("k", &payload("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(backend.probe().await.is_err());

        backend.set_available(true);
        assert!(backend.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_errors_are_consumed_in_order() {
        let backend = MemoryBackend::new("mem");
        backend.fail_next(1, ErrorKind::QuotaExceeded);
        backend.fail_next(1, ErrorKind::Transient);

        assert_eq!(backend.probe().await.unwrap_err().kind(), ErrorKind::QuotaExceeded);
        assert_eq!(backend.probe().await.unwrap_err().kind(), ErrorKind::Transient);
        assert!(backend.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_and_includes_payload() {
        let backend = MemoryBackend::new("mem");
        backend.store("X-2", &payload("b")).await.unwrap();
        backend.store("X-1", &payload("a")).await.unwrap();
        backend.store("Y-1", &payload("c")).await.unwrap();

        let entries = backend
            .list(&ListFilter::with_prefix("X-").with_payload())
            .await
            .unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["X-1", "X-2"]);
        assert_eq!(entries[0].bytes.as_deref(), Some(&b"a"[..]));

        let bare = backend.list(&ListFilter::all()).await.unwrap();
        assert_eq!(bare.len(), 3);
        assert!(bare.iter().all(|e| e.bytes.is_none()));
    }

    #[tokio::test]
    async fn test_latency_is_reported_by_probe() {
        let backend = MemoryBackend::new("mem");
        backend.set_latency(Duration::from_millis(20));
        let sample = backend.probe().await.unwrap();
        assert!(sample.latency >= Duration::from_millis(20));
    }
}
