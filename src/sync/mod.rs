// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine: replays the operation queue and reconciles the durable stores.
//!
//! # Drain
//!
//! Each pass takes up to `batch_size` ready operations (priority, then FIFO)
//! and applies them to their reachable targets. Targets that succeed are
//! removed from the operation; the operation leaves the queue once no target
//! remains. Failures back off or move to dead-letter (see [`crate::queue`]).
//! Targets the health monitor marks unreachable are not attempted and do not
//! consume a retry.
//!
//! # Reconcile
//!
//! A full scan of primary and fallback. One-sided keys are copied across;
//! keys with different payloads are settled last-write-wins and logged as
//! resolved conflicts. Equal timestamps are logged once as unresolved and
//! left alone until an operator calls [`SyncEngine::resolve_conflict`].

mod conflict;
mod executor;
mod reconcile;

pub use conflict::{
    ConflictPick, ConflictRecord, ConflictSide, ConflictStore, ResolutionStrategy, CONFLICT_FILE,
};
pub use executor::DrainReport;
pub use reconcile::ReconcileReport;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::backend::BackendRegistry;
use crate::health::{HealthMonitor, HealthStatus, HealthTransition};
use crate::queue::{JournalError, OperationQueue, QueueError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("conflict {0} not found")]
    ConflictNotFound(Uuid),
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(Uuid),
    #[error("conflict payload is not a valid record: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("no durable backend accepted the resolution for {key}")]
    NoBackendAccepted { key: String },
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct SyncEngine {
    registry: Arc<BackendRegistry>,
    monitor: Arc<HealthMonitor>,
    queue: Arc<OperationQueue>,
    conflicts: Arc<ConflictStore>,
    batch_size: usize,
    last_reconcile: RwLock<Option<DateTime<Utc>>>,
    /// Serializes reconciliation runs
    reconcile_lock: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        monitor: Arc<HealthMonitor>,
        queue: Arc<OperationQueue>,
        conflicts: Arc<ConflictStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            monitor,
            queue,
            conflicts,
            batch_size: batch_size.max(1),
            last_reconcile: RwLock::new(None),
            reconcile_lock: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn conflicts(&self) -> &Arc<ConflictStore> {
        &self.conflicts
    }

    /// Notified when queued work became ready ahead of the drain timer.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn last_reconciliation(&self) -> Option<DateTime<Utc>> {
        *self.last_reconcile.read()
    }

    /// React to a health transition: a backend coming back gets its
    /// queued operations released for immediate replay.
    pub async fn handle_transition(&self, transition: &HealthTransition) -> Result<usize, QueueError> {
        let returning =
            transition.to == HealthStatus::Recovering || transition.from == HealthStatus::Unreachable;
        if !returning || !transition.to.is_reachable() {
            return Ok(0);
        }
        let released = self.queue.release_backend(&transition.backend).await?;
        if released > 0 {
            info!(backend = %transition.backend, released, "Backend returned, replaying queued operations");
            self.wake.notify_one();
        }
        Ok(released)
    }
}
