// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage orchestrator.
//!
//! The single entry point for persisting and reading records and artifacts.
//! Writes fan out concurrently to every reachable backend of the relevant
//! roles; whatever is unreachable, fails or misses the deadline is queued
//! for the sync engine. Reads walk the backends in priority order.
//!
//! Backend calls run in spawned tasks. When a caller's deadline passes the
//! orchestrator stops waiting and returns what it has; the tasks themselves
//! run to completion and their results are discarded.

mod read;
mod types;
mod write;

pub use types::{
    OrchestratorError, PutOutcome, ReadOutcome, SearchHit, SearchPage, SearchQuery,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::sql::millis_to_datetime;
use crate::backend::{BackendError, BackendId, BackendRegistry};
use crate::health::HealthMonitor;
use crate::queue::OperationQueue;

const DEFAULT_PUT_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_GET_DEADLINE: Duration = Duration::from_secs(5);

/// Last accepted revision and stamp per key.
#[derive(Debug, Clone, Copy)]
struct KeyStamp {
    revision: u64,
    last_modified_ms: i64,
}

pub struct StorageOrchestrator {
    pub(crate) registry: Arc<BackendRegistry>,
    pub(crate) monitor: Arc<HealthMonitor>,
    pub(crate) queue: Arc<OperationQueue>,
    stamps: DashMap<String, KeyStamp>,
    put_deadline: Duration,
    get_deadline: Duration,
}

impl StorageOrchestrator {
    pub fn new(registry: Arc<BackendRegistry>, monitor: Arc<HealthMonitor>, queue: Arc<OperationQueue>) -> Self {
        Self {
            registry,
            monitor,
            queue,
            stamps: DashMap::new(),
            put_deadline: DEFAULT_PUT_DEADLINE,
            get_deadline: DEFAULT_GET_DEADLINE,
        }
    }

    /// Default deadlines for calls that do not pass one.
    #[must_use]
    pub fn with_deadlines(mut self, put: Duration, get: Duration) -> Self {
        self.put_deadline = put;
        self.get_deadline = get;
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Stamp a write: millisecond precision, strictly increasing per key.
    ///
    /// Rejects a revision lower than the last one accepted for the key.
    fn stamp(&self, key: &str, revision: u64) -> Result<DateTime<Utc>, OrchestratorError> {
        let mut entry = self.stamps.entry(key.to_string()).or_insert(KeyStamp {
            revision: 0,
            last_modified_ms: i64::MIN,
        });
        if revision < entry.revision {
            return Err(OrchestratorError::StaleRevision {
                key: key.to_string(),
                attempted: revision,
                current: entry.revision,
            });
        }
        let ms = Utc::now().timestamp_millis().max(entry.last_modified_ms.saturating_add(1));
        *entry = KeyStamp { revision, last_modified_ms: ms };
        Ok(millis_to_datetime(ms))
    }
}

fn validate_key(key: &str) -> Result<(), OrchestratorError> {
    if key.trim().is_empty() || key.len() > 255 || key.chars().any(char::is_control) {
        return Err(OrchestratorError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Results of spawned backend calls collected up to a deadline.
pub(crate) struct Gathered<T> {
    /// In the order the calls were issued
    pub done: Vec<(BackendId, Result<T, BackendError>)>,
    pub timed_out: Vec<BackendId>,
}

/// Wait for spawned calls until all finish or `deadline` passes.
///
/// Unfinished tasks are detached, not aborted.
pub(crate) async fn gather<T: Send + 'static>(
    deadline: Instant,
    calls: Vec<(BackendId, JoinHandle<Result<T, BackendError>>)>,
) -> Gathered<T> {
    let order: Vec<BackendId> = calls.iter().map(|(id, _)| id.clone()).collect();
    let mut pending: FuturesUnordered<_> = calls
        .into_iter()
        .map(|(id, handle)| async move {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(BackendError::Fatal(format!("backend task failed: {e}"))));
            (id, result)
        })
        .collect();

    let mut done = Vec::with_capacity(order.len());
    while let Ok(Some(item)) = tokio::time::timeout_at(deadline, pending.next()).await {
        done.push(item);
    }
    done.sort_by_key(|(id, _)| order.iter().position(|o| o == id));
    let timed_out = order
        .into_iter()
        .filter(|id| !done.iter().any(|(d, _)| d == id))
        .collect();
    Gathered { done, timed_out }
}
