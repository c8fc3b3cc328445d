// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ConflictPick, ConflictRecord, ConflictSide, SyncEngine, SyncError};
use crate::backend::sql::millis_to_datetime;
use crate::backend::{BackendError, ListEntry, ListFilter, Payload, RegisteredBackend};
use crate::health::{AlertCondition, Severity};
use crate::queue::{OperationKind, OperationRecord, Priority};
use crate::record::BusinessRecord;

/// Counts from one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    pub scanned: usize,
    pub consistent: usize,
    pub copied_to_primary: usize,
    pub copied_to_fallback: usize,
    /// Last-write-wins overwrites, each logged as a resolved conflict
    pub overwritten: usize,
    /// Unresolved conflicts recorded by this run
    pub new_conflicts: usize,
    /// Keys left alone because operations for them are still queued
    pub skipped_pending: usize,
    /// Keys rewritten on the target by a newer write while the run was in progress
    pub superseded: usize,
    pub failed: usize,
    /// Why the run did not happen
    pub skipped: Option<String>,
}

impl ReconcileReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            scanned: 0,
            consistent: 0,
            copied_to_primary: 0,
            copied_to_fallback: 0,
            overwritten: 0,
            new_conflicts: 0,
            skipped_pending: 0,
            superseded: 0,
            failed: 0,
            skipped: None,
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self { skipped: Some(reason.into()), ..Self::new() }
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    #[must_use]
    pub fn copied(&self) -> usize {
        self.copied_to_primary + self.copied_to_fallback
    }
}

impl SyncEngine {
    /// Bidirectional reconciliation of primary and fallback.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let started = Instant::now();

        let (Some(primary), Some(fallback)) = (self.registry.primary(), self.registry.fallback()) else {
            return ReconcileReport::skip("primary or fallback not configured");
        };
        for backend in [primary, fallback] {
            if !self.monitor.is_reachable(&backend.id) {
                info!(backend = %backend.id, "Reconciliation skipped, backend unreachable");
                return ReconcileReport::skip(format!("{} is unreachable", backend.id));
            }
        }

        let (left, right) = match tokio::try_join!(scan(primary), scan(fallback)) {
            Ok(both) => both,
            Err(e) => {
                warn!(error = %e, "Reconciliation scan failed");
                return ReconcileReport::skip(format!("scan failed: {e}"));
            }
        };

        let pending = self.queue.pending_keys().await;
        let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
        let mut report = ReconcileReport::new();
        report.scanned = keys.len();

        for key in keys {
            if pending.contains(key.as_str()) {
                report.skipped_pending += 1;
                continue;
            }
            match (left.get(key), right.get(key)) {
                (Some(a), None) => match self.copy(primary, fallback, a).await {
                    Ok(CopyOutcome::Written) => report.copied_to_fallback += 1,
                    Ok(CopyOutcome::Superseded) => report.superseded += 1,
                    Err(_) => report.failed += 1,
                },
                (None, Some(b)) => match self.copy(fallback, primary, b).await {
                    Ok(CopyOutcome::Written) => report.copied_to_primary += 1,
                    Ok(CopyOutcome::Superseded) => report.superseded += 1,
                    Err(_) => report.failed += 1,
                },
                (Some(a), Some(b)) if a.checksum == b.checksum => report.consistent += 1,
                (Some(a), Some(b)) => {
                    if let Err(e) = self.settle_divergence(primary, fallback, a, b, &mut report).await {
                        error!(key = %key, error = %e, "Failed to settle divergent key");
                        report.failed += 1;
                    }
                }
                (None, None) => {}
            }
        }

        *self.last_reconcile.write() = Some(report.started_at);
        crate::metrics::record_reconcile(report.copied() + report.overwritten, started.elapsed());
        info!(
            scanned = report.scanned,
            copied = report.copied(),
            overwritten = report.overwritten,
            new_conflicts = report.new_conflicts,
            skipped_pending = report.skipped_pending,
            superseded = report.superseded,
            failed = report.failed,
            "Reconciliation finished"
        );
        report
    }

    async fn settle_divergence(
        &self,
        primary: &RegisteredBackend,
        fallback: &RegisteredBackend,
        a: &ListEntry,
        b: &ListEntry,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        let key = a.key.as_str();
        let left = ConflictSide::new(primary.id.clone(), entry_bytes(a), &a.checksum, a.modified_at);
        let right = ConflictSide::new(fallback.id.clone(), entry_bytes(b), &b.checksum, b.modified_at);

        if a.modified_at == b.modified_at {
            if self.conflicts.has_unresolved(key, &a.checksum, &b.checksum).await {
                return Ok(());
            }
            let record = ConflictRecord::detect(key, left, right);
            warn!(key, conflict = %record.id, fields = ?record.diverging_fields, "Unresolved conflict");
            self.monitor.alerts().raise(
                None,
                AlertCondition::UnresolvedConflict,
                Severity::Warning,
                format!("{key} diverges with equal timestamps on {}", record.diverging_fields.join(", ")),
            );
            self.conflicts.add(record).await?;
            crate::metrics::record_conflict(false);
            report.new_conflicts += 1;
            return Ok(());
        }

        let (winner, source, target) = if a.modified_at > b.modified_at {
            (a, primary, fallback)
        } else {
            (b, fallback, primary)
        };
        let outcome = self.copy(source, target, winner).await.map_err(|e| {
            warn!(key, error = %e, "Last-write-wins overwrite failed");
            SyncError::NoBackendAccepted { key: key.to_string() }
        })?;
        if outcome == CopyOutcome::Superseded {
            report.superseded += 1;
            return Ok(());
        }
        let record = ConflictRecord::detect(key, left, right);
        info!(key, winner = %source.id, "Divergence settled by last write");
        self.conflicts.add(record).await?;
        crate::metrics::record_conflict(true);
        report.overwritten += 1;
        Ok(())
    }

    /// Apply an operator's choice for an unresolved conflict to both durable stores.
    ///
    /// The chosen version is re-stamped later than both sides so it wins
    /// every later comparison. Stores that cannot take it now get a queued
    /// operation.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_conflict(&self, id: Uuid, pick: ConflictPick) -> Result<ConflictRecord, SyncError> {
        let conflict = self.conflicts.get(id).await.ok_or(SyncError::ConflictNotFound(id))?;
        if conflict.resolved {
            return Err(SyncError::AlreadyResolved(id));
        }
        let side = conflict.side(pick);
        let mut chosen: BusinessRecord = serde_json::from_value(side.payload.clone())?;
        let floor = conflict.left.modified_at.max(conflict.right.modified_at).timestamp_millis() + 1;
        let stamp = millis_to_datetime(Utc::now().timestamp_millis().max(floor));
        chosen.last_modified = stamp;
        let payload = Payload::new(chosen.to_bytes()?, stamp);

        let mut accepted = 0;
        let mut lagging = Vec::new();
        for backend in self.registry.durable() {
            if !self.monitor.is_reachable(&backend.id) {
                lagging.push(backend.id.clone());
                continue;
            }
            match backend.call("store", backend.adapter.store(&conflict.key, &payload)).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(backend = %backend.id, key = %conflict.key, error = %e, "Resolution write failed");
                    lagging.push(backend.id.clone());
                }
            }
        }
        if !lagging.is_empty() {
            let op = OperationRecord::write(OperationKind::Update, conflict.key.clone(), lagging, &payload)
                .with_priority(Priority::High);
            if let Err(e) = self.queue.enqueue(op).await {
                if accepted == 0 {
                    return Err(e.into());
                }
                error!(key = %conflict.key, error = %e, "Failed to queue resolution for lagging store");
            }
        }

        let resolution = serde_json::to_value(&chosen)?;
        let resolved = self
            .conflicts
            .mark_resolved(id, side.backend.clone(), resolution)
            .await?
            .ok_or(SyncError::ConflictNotFound(id))?;
        crate::metrics::record_conflict(true);
        info!(key = %resolved.key, winner = %side.backend, "Conflict resolved by operator");
        Ok(resolved)
    }
}

async fn scan(backend: &RegisteredBackend) -> Result<HashMap<String, ListEntry>, BackendError> {
    let filter = ListFilter::all().with_payload();
    let entries = backend.call("list", backend.adapter.list(&filter)).await?;
    Ok(entries.into_iter().map(|e| (e.key.clone(), e)).collect())
}

fn entry_bytes(entry: &ListEntry) -> &[u8] {
    entry.bytes.as_deref().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyOutcome {
    Written,
    /// The target changed after the scan and now holds an equal or newer copy
    Superseded,
}

impl SyncEngine {
    /// Copy one listed entry to `target`, keeping its modification stamp.
    ///
    /// The scan can be seconds old by the time a key is reached, so the
    /// target is read again first and the write is dropped if a put landed
    /// (or was queued) in between.
    async fn copy(
        &self,
        source: &RegisteredBackend,
        target: &RegisteredBackend,
        entry: &ListEntry,
    ) -> Result<CopyOutcome, BackendError> {
        if self.queue.has_pending_for(&entry.key).await {
            return Ok(CopyOutcome::Superseded);
        }
        match target.call("fetch", target.adapter.fetch(&entry.key)).await {
            Ok(current) if current.modified_at >= entry.modified_at => {
                debug!(key = %entry.key, to = %target.id, "Target changed since the scan, copy dropped");
                return Ok(CopyOutcome::Superseded);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(key = %entry.key, to = %target.id, error = %e, "Reconciliation pre-read failed");
                return Err(e);
            }
        }

        let payload = match &entry.bytes {
            Some(bytes) => Payload::new(bytes.clone(), entry.modified_at),
            None => source.call("fetch", source.adapter.fetch(&entry.key)).await?,
        };
        if let Err(e) = target.call("store", target.adapter.store(&entry.key, &payload)).await {
            warn!(key = %entry.key, from = %source.id, to = %target.id, error = %e, "Reconciliation copy failed");
            return Err(e);
        }
        Ok(CopyOutcome::Written)
    }
}
