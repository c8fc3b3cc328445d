// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::SyncEngine;
use crate::backend::{BackendError, BackendId, RegisteredBackend};
use crate::metrics::LatencyTimer;
use crate::queue::{FailureDisposition, OperationKind, OperationRecord, QueueError};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    /// Finished on every target and left the queue
    pub completed: usize,
    /// Some targets done, others still pending
    pub partial: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.attempted == 0
    }
}

impl SyncEngine {
    /// Run one batch of ready operations.
    #[tracing::instrument(skip(self))]
    pub async fn drain_once(&self) -> DrainReport {
        let _timer = LatencyTimer::new("sync", "drain");
        let now = Utc::now();
        let (monitor, registry) = (&self.monitor, &self.registry);
        // A target dropped from the config is never reachable; it is picked
        // up anyway so the operation can fail into dead-letter.
        let batch = self
            .queue
            .dequeue_ready(self.batch_size, now, |op| {
                op.targets.iter().any(|t| registry.get(t).is_none() || monitor.is_reachable(t))
            })
            .await;

        let mut report = DrainReport::default();
        for op in batch {
            report.attempted += 1;
            self.execute(&op, &mut report).await;
        }
        if !report.is_idle() {
            debug!(?report, "Drain pass finished");
        }
        report
    }

    async fn execute(&self, op: &OperationRecord, report: &mut DrainReport) {
        let mut done = BTreeSet::new();
        let mut failure: Option<BackendError> = None;

        for target in &op.targets {
            let result = match self.registry.get(target) {
                None => Err(BackendError::Fatal(format!("backend {target} is not configured"))),
                Some(_) if !self.monitor.is_reachable(target) => continue,
                Some(backend) => self.apply(backend, op).await,
            };
            match result {
                Ok(()) => {
                    crate::metrics::record_replay(target.as_str(), "success");
                    done.insert(target.clone());
                }
                Err(e) => {
                    crate::metrics::record_replay(target.as_str(), e.kind().as_str());
                    warn!(op = %op.id, key = %op.key, backend = %target, error = %e, "Replay failed");
                    failure = Some(e);
                }
            }
        }

        if let Err(e) = self.settle(op, &done, failure, report).await {
            error!(op = %op.id, error = %e, "Failed to persist queue after replay");
        }
    }

    async fn settle(
        &self,
        op: &OperationRecord,
        done: &BTreeSet<BackendId>,
        failure: Option<BackendError>,
        report: &mut DrainReport,
    ) -> Result<(), QueueError> {
        match failure {
            None if done.len() == op.targets.len() => {
                self.queue.complete(op).await?;
                report.completed += 1;
            }
            None => {
                self.queue.record_partial(op, done).await?;
                report.partial += 1;
            }
            Some(err) => {
                if !done.is_empty() {
                    self.queue.record_partial(op, done).await?;
                }
                match self.queue.fail(op, &err, Utc::now()).await? {
                    FailureDisposition::Retry { .. } => report.retrying += 1,
                    FailureDisposition::DeadLettered => report.dead_lettered += 1,
                    FailureDisposition::Stale => {}
                }
            }
        }
        Ok(())
    }

    async fn apply(&self, backend: &RegisteredBackend, op: &OperationRecord) -> Result<(), BackendError> {
        match op.kind {
            OperationKind::Delete => match backend.call("remove", backend.adapter.remove(&op.key)).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
            OperationKind::Create | OperationKind::Update if backend.role.is_durable() => {
                // A newer copy already on the backend is never rolled back.
                match backend.call("fetch", backend.adapter.fetch(&op.key)).await {
                    Ok(existing) if existing.modified_at > op.modified_at => {
                        debug!(key = %op.key, backend = %backend.id, "Backend already holds a newer copy");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                backend.call("store", backend.adapter.store(&op.key, &op.to_payload())).await
            }
            _ => backend.call("store", backend.adapter.store(&op.key, &op.to_payload())).await,
        }
    }
}
