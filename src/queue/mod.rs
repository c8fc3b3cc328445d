// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, priority-ordered queue of pending backend operations.
//!
//! # Rules
//!
//! - Same intent checksum already queued: the newcomer is dropped and its
//!   targets merged into the queued operation.
//! - Same key, different checksum: the queued operation takes the newer
//!   payload (latest intent wins), targets are merged, retries reset.
//! - At capacity: the lowest-priority, oldest operation moves to the
//!   dead-letter log with reason `evicted`.
//! - Operations are never deleted except on success. Exhausted or terminal
//!   failures move to the dead-letter log, which stays inspectable.
//!
//! Every mutation rewrites `queue.json` (and `dead_letter.json` when it
//! changed) before the lock is released.

pub mod journal;
pub mod operation;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use journal::{JournalError, SnapshotFile};
pub use operation::{DeadLetter, OperationKind, OperationRecord, Priority};

use crate::backend::{BackendError, BackendId, ErrorKind};
use crate::config::SyncConfig;
use crate::health::{AlertCondition, AlertManager, Severity};
use crate::resilience::retry::RetryConfig;

pub const QUEUE_FILE: &str = "queue.json";
pub const DEAD_LETTER_FILE: &str = "dead_letter.json";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue full; operation for {key} moved to dead-letter")]
    Full { key: String },
    #[error("operation {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(Uuid),
    /// Identical intent already queued
    Deduplicated(Uuid),
    /// Newer payload replaced a queued intent for the same key
    Replaced(Uuid),
}

impl EnqueueOutcome {
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Queued(id) | Self::Deduplicated(id) | Self::Replaced(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { next_attempt_at: DateTime<Utc> },
    DeadLettered,
    /// The operation changed or completed while the attempt was in flight
    Stale,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub max_retries: u32,
    pub backoff: RetryConfig,
}

impl From<&SyncConfig> for QueueSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            capacity: config.queue_capacity,
            max_retries: config.max_retries,
            backoff: RetryConfig::backoff(
                Duration::from_millis(config.base_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: Vec<OperationRecord>,
    dead: Vec<DeadLetter>,
}

pub struct OperationQueue {
    state: Mutex<QueueState>,
    queue_file: SnapshotFile,
    dead_file: SnapshotFile,
    settings: QueueSettings,
    alerts: Arc<AlertManager>,
}

impl OperationQueue {
    /// Open the queue, restoring any persisted snapshot from `state_dir`.
    pub async fn open(
        state_dir: Option<&Path>,
        settings: QueueSettings,
        alerts: Arc<AlertManager>,
    ) -> Result<Self, QueueError> {
        let queue_file = SnapshotFile::new(state_dir, QUEUE_FILE);
        let dead_file = SnapshotFile::new(state_dir, DEAD_LETTER_FILE);
        let pending: Vec<OperationRecord> = queue_file.load().await?;
        let dead: Vec<DeadLetter> = dead_file.load().await?;

        if !pending.is_empty() || !dead.is_empty() {
            info!(pending = pending.len(), dead = dead.len(), "Restored operation queue");
        }
        crate::metrics::set_queue_depth(pending.len());
        crate::metrics::set_dead_letters(dead.len());

        Ok(Self {
            state: Mutex::new(QueueState { pending, dead }),
            queue_file,
            dead_file,
            settings,
            alerts,
        })
    }

    /// In-memory queue with default settings.
    pub fn in_memory(alerts: Arc<AlertManager>) -> Self {
        Self::with_settings(QueueSettings::from(&SyncConfig::default()), alerts)
    }

    /// In-memory queue; nothing is persisted.
    pub fn with_settings(settings: QueueSettings, alerts: Arc<AlertManager>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            queue_file: SnapshotFile::new(None, QUEUE_FILE),
            dead_file: SnapshotFile::new(None, DEAD_LETTER_FILE),
            settings,
            alerts,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn persist(&self, state: &QueueState, dead_changed: bool) -> Result<(), QueueError> {
        crate::metrics::set_queue_depth(state.pending.len());
        self.queue_file.save(&state.pending).await?;
        if dead_changed {
            crate::metrics::set_dead_letters(state.dead.len());
            self.dead_file.save(&state.dead).await?;
        }
        Ok(())
    }

    fn bury(&self, state: &mut QueueState, operation: OperationRecord, reason: &str) {
        crate::metrics::record_dead_letter(reason);
        let subject = operation.targets.iter().next().cloned();
        let condition = if reason == "evicted" { AlertCondition::QueueEviction } else { AlertCondition::DeadLetter };
        error!(
            op = %operation.id,
            key = %operation.key,
            kind = %operation.kind,
            retries = operation.retry_count,
            reason,
            "Operation moved to dead-letter"
        );
        self.alerts.raise(
            subject.as_ref(),
            condition,
            Severity::Critical,
            format!(
                "{} of {} moved to dead-letter ({reason}) after {} attempts",
                operation.kind, operation.key, operation.retry_count
            ),
        );
        state.dead.push(DeadLetter {
            operation,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
    }

    /// Queue an operation, applying dedup, intent replacement and capacity rules.
    pub async fn enqueue(&self, mut operation: OperationRecord) -> Result<EnqueueOutcome, QueueError> {
        operation.max_retries = self.settings.max_retries;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.pending.iter_mut().find(|op| op.key == operation.key) {
            let id = existing.id;
            existing.targets.extend(operation.targets);
            let outcome = if existing.checksum == operation.checksum {
                crate::metrics::record_enqueue("deduplicated");
                debug!(op = %id, key = %existing.key, "Identical intent already queued");
                EnqueueOutcome::Deduplicated(id)
            } else {
                existing.kind = operation.kind;
                existing.payload = operation.payload;
                existing.modified_at = operation.modified_at;
                existing.checksum = operation.checksum;
                existing.source = operation.source;
                existing.priority = existing.priority.max(operation.priority);
                existing.retry_count = 0;
                existing.last_error = None;
                existing.last_error_kind = None;
                existing.next_attempt_at = Utc::now();
                crate::metrics::record_enqueue("replaced");
                debug!(op = %id, key = %existing.key, "Queued intent replaced by newer payload");
                EnqueueOutcome::Replaced(id)
            };
            self.persist(&state, false).await?;
            return Ok(outcome);
        }

        if state.pending.len() >= self.settings.capacity {
            let victim = state
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, op)| (op.priority, op.created_at))
                .map(|(idx, op)| (idx, op.priority));

            match victim {
                Some((idx, priority)) if priority <= operation.priority => {
                    let evicted = state.pending.remove(idx);
                    warn!(evicted = %evicted.id, key = %evicted.key, "Queue full, evicting lowest-priority operation");
                    self.bury(&mut state, evicted, "evicted");
                }
                _ => {
                    let key = operation.key.clone();
                    self.bury(&mut state, operation, "evicted");
                    self.persist(&state, true).await?;
                    return Err(QueueError::Full { key });
                }
            }
            let id = operation.id;
            state.pending.push(operation);
            crate::metrics::record_enqueue("queued");
            self.persist(&state, true).await?;
            return Ok(EnqueueOutcome::Queued(id));
        }

        let id = operation.id;
        debug!(op = %id, key = %operation.key, kind = %operation.kind, targets = ?operation.targets, "Operation queued");
        state.pending.push(operation);
        crate::metrics::record_enqueue("queued");
        self.persist(&state, false).await?;
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Ready operations in drain order (priority, then FIFO). Not removed.
    pub async fn dequeue_ready<F>(&self, limit: usize, now: DateTime<Utc>, eligible: F) -> Vec<OperationRecord>
    where
        F: Fn(&OperationRecord) -> bool,
    {
        let state = self.state.lock().await;
        let mut ready: Vec<&OperationRecord> = state
            .pending
            .iter()
            .filter(|op| op.is_ready(now) && eligible(op))
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        ready.into_iter().take(limit).cloned().collect()
    }

    /// Remove an attempted operation that succeeded on every target.
    ///
    /// Ignored when the queued intent was replaced during the attempt.
    pub async fn complete(&self, attempted: &OperationRecord) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state
            .pending
            .retain(|op| !(op.id == attempted.id && op.checksum == attempted.checksum));
        if state.pending.len() == before {
            return Ok(false);
        }
        self.persist(&state, false).await?;
        Ok(true)
    }

    /// Drop targets that succeeded; completes the operation if none remain.
    pub async fn record_partial(
        &self,
        attempted: &OperationRecord,
        done: &BTreeSet<BackendId>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let Some(idx) = state
            .pending
            .iter()
            .position(|op| op.id == attempted.id && op.checksum == attempted.checksum)
        else {
            return Ok(());
        };
        state.pending[idx].targets.retain(|t| !done.contains(t));
        if state.pending[idx].targets.is_empty() {
            state.pending.remove(idx);
        }
        self.persist(&state, false).await
    }

    /// Record a failed attempt.
    ///
    /// Retryable errors back off exponentially (scaled by the error kind);
    /// terminal errors and exhausted budgets move the operation to dead-letter.
    pub async fn fail(
        &self,
        attempted: &OperationRecord,
        error: &BackendError,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueError> {
        let mut state = self.state.lock().await;
        let Some(idx) = state
            .pending
            .iter()
            .position(|op| op.id == attempted.id && op.checksum == attempted.checksum)
        else {
            return Ok(FailureDisposition::Stale);
        };

        let kind = error.kind();
        let op = &mut state.pending[idx];
        op.retry_count += 1;
        op.last_error = Some(error.to_string());
        op.last_error_kind = Some(kind);

        let terminal = matches!(kind, ErrorKind::AuthError | ErrorKind::Fatal | ErrorKind::NotFound);
        if terminal || op.retry_count >= op.max_retries {
            let reason = if terminal { kind.as_str() } else { "max_retries" };
            let op = state.pending.remove(idx);
            self.bury(&mut state, op, reason);
            self.persist(&state, true).await?;
            return Ok(FailureDisposition::DeadLettered);
        }

        let base = self.settings.backoff.delay_for_attempt(op.retry_count);
        let delay = Duration::from_nanos((base.as_nanos() as f64 * kind.backoff_factor()).round() as u64);
        let next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        op.next_attempt_at = next_attempt_at;
        warn!(
            op = %op.id,
            key = %op.key,
            attempt = op.retry_count,
            max = op.max_retries,
            error = %error,
            retry_in = ?delay,
            "Operation attempt failed"
        );
        self.persist(&state, false).await?;
        Ok(FailureDisposition::Retry { next_attempt_at })
    }

    /// Make every operation targeting `backend` ready now. Returns how many.
    pub async fn release_backend(&self, backend: &BackendId) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut released = 0;
        for op in state.pending.iter_mut().filter(|op| op.targets.contains(backend)) {
            op.next_attempt_at = now;
            released += 1;
        }
        if released > 0 {
            self.persist(&state, false).await?;
        }
        Ok(released)
    }

    pub async fn has_pending_for(&self, key: &str) -> bool {
        self.state.lock().await.pending.iter().any(|op| op.key == key)
    }

    /// Backends that still owe a queued operation for `key`.
    pub async fn pending_targets_for(&self, key: &str) -> HashSet<BackendId> {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .filter(|op| op.key == key)
            .flat_map(|op| op.targets.iter().cloned())
            .collect()
    }

    pub async fn pending_keys(&self) -> HashSet<String> {
        self.state.lock().await.pending.iter().map(|op| op.key.clone()).collect()
    }

    pub async fn pending(&self) -> Vec<OperationRecord> {
        self.state.lock().await.pending.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Move a dead-lettered operation back into the queue with a fresh budget.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> Result<(), QueueError> {
        let operation = {
            let mut state = self.state.lock().await;
            let idx = state
                .dead
                .iter()
                .position(|d| d.operation.id == id)
                .ok_or(QueueError::NotFound(id))?;
            let mut op = state.dead.remove(idx).operation;
            op.retry_count = 0;
            op.next_attempt_at = Utc::now();
            op.created_at = Utc::now();
            // Dead list must be flushed even if enqueue below fails
            self.persist(&state, true).await?;
            op
        };
        info!(op = %id, key = %operation.key, "Dead-lettered operation requeued");
        self.enqueue(operation).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Payload;
    use crate::config::AlertConfig;
    use tempfile::tempdir;

    fn alerts() -> Arc<AlertManager> {
        Arc::new(AlertManager::new(AlertConfig { max_per_hour: 100, history_size: 100 }))
    }

    fn settings(capacity: usize, max_retries: u32) -> QueueSettings {
        QueueSettings {
            capacity,
            max_retries,
            backoff: RetryConfig::backoff(Duration::from_millis(100), Duration::from_secs(10)),
        }
    }

    fn op(key: &str, body: &str, target: &str) -> OperationRecord {
        let payload = Payload::new(body.as_bytes().to_vec(), Utc::now());
        OperationRecord::write(OperationKind::Update, key, [BackendId::new(target)], &payload)
    }

    #[tokio::test]
    async fn test_identical_intent_is_deduplicated() {
        let queue = OperationQueue::open(None, settings(10, 3), alerts()).await.unwrap();
        let first = queue.enqueue(op("X-001", "v1", "b")).await.unwrap();
        let second = queue.enqueue(op("X-001", "v1", "c")).await.unwrap();

        assert!(matches!(second, EnqueueOutcome::Deduplicated(id) if id == first.id()));
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].targets.len(), 2);
    }

    #[tokio::test]
    async fn test_newer_payload_replaces_intent() {
        let queue = OperationQueue::open(None, settings(10, 3), alerts()).await.unwrap();
        queue.enqueue(op("X-001", "v1", "b")).await.unwrap();
        let outcome = queue.enqueue(op("X-001", "v2", "b")).await.unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Replaced(_)));
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, b"v2");
    }

    #[tokio::test]
    async fn test_drain_order_is_priority_then_fifo() {
        let queue = OperationQueue::open(None, settings(10, 3), alerts()).await.unwrap();
        queue.enqueue(op("a", "1", "b").with_priority(Priority::Low)).await.unwrap();
        queue.enqueue(op("b", "1", "b")).await.unwrap();
        queue.enqueue(OperationRecord::delete("c", [BackendId::new("b")])).await.unwrap();
        queue.enqueue(op("d", "1", "b")).await.unwrap();

        let ready = queue.dequeue_ready(10, Utc::now(), |_| true).await;
        let keys: Vec<&str> = ready.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "d", "a"]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let queue = OperationQueue::open(None, settings(10, 2), alerts()).await.unwrap();
        queue.enqueue(op("X-001", "v1", "b")).await.unwrap();
        let err = BackendError::Unavailable("down".into());

        let attempted = queue.pending().await.remove(0);
        let first = queue.fail(&attempted, &err, Utc::now()).await.unwrap();
        assert!(matches!(first, FailureDisposition::Retry { .. }));
        let second = queue.fail(&attempted, &err, Utc::now()).await.unwrap();
        assert_eq!(second, FailureDisposition::DeadLettered);

        assert!(queue.is_empty().await);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "max_retries");
        assert_eq!(dead[0].operation.retry_count, 2);
    }

    #[tokio::test]
    async fn test_auth_error_dead_letters_immediately() {
        let queue = OperationQueue::open(None, settings(10, 5), alerts()).await.unwrap();
        queue.enqueue(op("X-001", "v1", "b")).await.unwrap();
        let attempted = queue.pending().await.remove(0);
        let outcome = queue
            .fail(&attempted, &BackendError::AuthError("denied".into()), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, FailureDisposition::DeadLettered);
        assert_eq!(queue.dead_letters().await[0].reason, "auth_error");
    }

    #[tokio::test]
    async fn test_transient_retries_immediately_quota_waits() {
        let queue = OperationQueue::open(None, settings(10, 5), alerts()).await.unwrap();
        queue.enqueue(op("a", "1", "b")).await.unwrap();
        queue.enqueue(op("q", "1", "b")).await.unwrap();
        let pending = queue.pending().await;
        let now = Utc::now();

        let transient = queue.fail(&pending[0], &BackendError::Transient("x".into()), now).await.unwrap();
        assert_eq!(transient, FailureDisposition::Retry { next_attempt_at: now });

        let quota = queue.fail(&pending[1], &BackendError::QuotaExceeded("x".into()), now).await.unwrap();
        let FailureDisposition::Retry { next_attempt_at } = quota else { panic!("expected retry") };
        assert_eq!(next_attempt_at - now, chrono::Duration::milliseconds(800));
    }

    #[tokio::test]
    async fn test_overflow_evicts_to_dead_letter() {
        let queue = OperationQueue::open(None, settings(2, 3), alerts()).await.unwrap();
        queue.enqueue(op("old-low", "1", "b").with_priority(Priority::Low)).await.unwrap();
        queue.enqueue(op("normal", "1", "b")).await.unwrap();
        queue.enqueue(op("new", "1", "b")).await.unwrap();

        let keys: Vec<String> = queue.pending().await.into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["normal", "new"]);
        let dead = queue.dead_letters().await;
        assert_eq!(dead[0].operation.key, "old-low");
        assert_eq!(dead[0].reason, "evicted");

        let rejected = queue.enqueue(op("lowest", "1", "b").with_priority(Priority::Low)).await;
        assert!(matches!(rejected, Err(QueueError::Full { .. })));
        assert_eq!(queue.dead_letters().await.len(), 2);
    }

    #[tokio::test]
    async fn test_completion_ignores_replaced_intent() {
        let queue = OperationQueue::open(None, settings(10, 3), alerts()).await.unwrap();
        queue.enqueue(op("X-001", "v1", "b")).await.unwrap();
        let attempted = queue.pending().await.remove(0);
        queue.enqueue(op("X-001", "v2", "b")).await.unwrap();

        assert!(!queue.complete(&attempted).await.unwrap());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let queue = OperationQueue::open(Some(dir.path()), settings(10, 1), alerts()).await.unwrap();
            queue.enqueue(op("kept", "v1", "b")).await.unwrap();
            queue.enqueue(op("dead", "v1", "b")).await.unwrap();
            let dead = queue.pending().await.into_iter().find(|o| o.key == "dead").unwrap();
            queue.fail(&dead, &BackendError::Unavailable("x".into()), Utc::now()).await.unwrap();
        }
        let reopened = OperationQueue::open(Some(dir.path()), settings(10, 1), alerts()).await.unwrap();
        assert_eq!(reopened.pending().await[0].key, "kept");
        assert_eq!(reopened.dead_letters().await[0].operation.key, "dead");
    }

    #[tokio::test]
    async fn test_requeue_dead_letter() {
        let queue = OperationQueue::open(None, settings(10, 1), alerts()).await.unwrap();
        queue.enqueue(op("X-001", "v1", "b")).await.unwrap();
        let attempted = queue.pending().await.remove(0);
        queue.fail(&attempted, &BackendError::Unavailable("x".into()), Utc::now()).await.unwrap();

        queue.requeue_dead_letter(attempted.id).await.unwrap();
        assert!(queue.dead_letters().await.is_empty());
        assert_eq!(queue.pending().await[0].retry_count, 0);
        assert!(matches!(queue.requeue_dead_letter(attempted.id).await, Err(QueueError::NotFound(_))));
    }
}
