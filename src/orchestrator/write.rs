// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{gather, validate_key, OrchestratorError, PutOutcome, StorageOrchestrator};
use crate::backend::sql::millis_to_datetime;
use crate::backend::{BackendId, Payload, RegisteredBackend};
use crate::metrics::LatencyTimer;
use crate::queue::{OperationKind, OperationRecord};
use crate::record::{Artifact, BusinessRecord};

#[derive(Debug, Clone)]
enum WriteAction {
    Store(Payload),
    Remove,
}

/// One stamped write ready for fan-out.
struct WritePlan<'a> {
    key: &'a str,
    revision: u64,
    last_modified: DateTime<Utc>,
    kind: OperationKind,
    action: WriteAction,
    targets: Vec<RegisteredBackend>,
}

impl StorageOrchestrator {
    /// Persist a record to primary and fallback under the default deadline.
    pub async fn put(&self, record: &BusinessRecord) -> Result<PutOutcome, OrchestratorError> {
        self.put_with_deadline(record, self.put_deadline).await
    }

    /// Persist a record, returning once every target answered or `deadline` passed.
    ///
    /// Backends that are unreachable, fail, or are still running at the
    /// deadline are covered by a single queued operation.
    #[tracing::instrument(skip(self, record), fields(key = %record.key, revision = record.revision))]
    pub async fn put_with_deadline(
        &self,
        record: &BusinessRecord,
        deadline: Duration,
    ) -> Result<PutOutcome, OrchestratorError> {
        let _timer = LatencyTimer::new("orchestrator", "put");
        validate_key(&record.key)?;
        let last_modified = self.stamp(&record.key, record.revision)?;

        let mut stamped = record.clone();
        stamped.last_modified = last_modified;
        let payload = Payload::new(stamped.to_bytes()?, last_modified);
        let kind = if record.revision <= 1 { OperationKind::Create } else { OperationKind::Update };

        self.replicate(
            WritePlan {
                key: &record.key,
                revision: record.revision,
                last_modified,
                kind,
                action: WriteAction::Store(payload),
                targets: self.registry.durable().cloned().collect(),
            },
            Instant::now() + deadline,
        )
        .await
    }

    /// Remove a record from primary and fallback.
    ///
    /// A backend that does not hold the key counts as having accepted.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<PutOutcome, OrchestratorError> {
        let _timer = LatencyTimer::new("orchestrator", "delete");
        validate_key(key)?;
        let revision = self.stamps.get(key).map(|s| s.revision).unwrap_or(0);
        let last_modified = self.stamp(key, revision)?;

        self.replicate(
            WritePlan {
                key,
                revision,
                last_modified,
                kind: OperationKind::Delete,
                action: WriteAction::Remove,
                targets: self.registry.durable().cloned().collect(),
            },
            Instant::now() + self.put_deadline,
        )
        .await
    }

    /// Store a rendered artifact on every artifact backend.
    #[tracing::instrument(skip(self, artifact), fields(key = %artifact.record_key, revision = artifact.revision))]
    pub async fn put_artifact(&self, artifact: &Artifact) -> Result<PutOutcome, OrchestratorError> {
        let _timer = LatencyTimer::new("orchestrator", "put_artifact");
        validate_key(&artifact.record_key)?;
        let key = artifact.storage_key();
        let last_modified = millis_to_datetime(Utc::now().timestamp_millis());

        self.replicate(
            WritePlan {
                key: &key,
                revision: artifact.revision,
                last_modified,
                kind: OperationKind::Create,
                action: WriteAction::Store(Payload::new(artifact.bytes.clone(), last_modified)),
                targets: self.registry.artifact_targets().cloned().collect(),
            },
            Instant::now() + self.put_deadline,
        )
        .await
    }

    async fn replicate(&self, plan: WritePlan<'_>, deadline: Instant) -> Result<PutOutcome, OrchestratorError> {
        if plan.targets.is_empty() {
            return Err(OrchestratorError::NoBackendAccepted {
                key: plan.key.to_string(),
                reason: "no backends configured for this write".to_string(),
            });
        }

        let (reachable, unreachable): (Vec<_>, Vec<_>) =
            plan.targets.into_iter().partition(|b| self.monitor.is_reachable(&b.id));

        let key: Arc<str> = Arc::from(plan.key);
        let calls = reachable
            .into_iter()
            .map(|backend| {
                let key = key.clone();
                let action = plan.action.clone();
                let id = backend.id.clone();
                let handle = tokio::spawn(async move {
                    match action {
                        WriteAction::Store(payload) => {
                            backend.call("store", backend.adapter.store(&key, &payload)).await
                        }
                        WriteAction::Remove => match backend.call("remove", backend.adapter.remove(&key)).await {
                            Err(e) if e.is_not_found() => Ok(()),
                            other => other,
                        },
                    }
                });
                (id, handle)
            })
            .collect();

        let gathered = gather(deadline, calls).await;

        let mut accepted = Vec::new();
        let mut behind: BTreeSet<BackendId> = unreachable.iter().map(|b| b.id.clone()).collect();
        let mut last_error = None;
        for (id, result) in gathered.done {
            match result {
                Ok(()) => accepted.push(id),
                Err(e) => {
                    warn!(backend = %id, key = plan.key, error = %e, "Backend write failed, queueing for replay");
                    last_error = Some(e.to_string());
                    behind.insert(id);
                }
            }
        }
        for id in &gathered.timed_out {
            warn!(backend = %id, key = plan.key, "Backend write still running at deadline, queueing for replay");
            behind.insert(id.clone());
        }

        let mut queued = Vec::new();
        let mut operation_id = None;
        if !behind.is_empty() {
            let operation = match &plan.action {
                WriteAction::Store(payload) => {
                    OperationRecord::write(plan.kind, plan.key, behind.iter().cloned(), payload)
                }
                WriteAction::Remove => OperationRecord::delete(plan.key, behind.iter().cloned()),
            };
            match self.queue.enqueue(operation).await {
                Ok(outcome) => {
                    debug!(key = plan.key, targets = behind.len(), "Queued replication");
                    queued = behind.into_iter().collect();
                    operation_id = Some(outcome.id());
                }
                Err(e) if accepted.is_empty() => {
                    error!(key = plan.key, error = %e, "Write reached no backend and could not be queued");
                    return Err(OrchestratorError::NoBackendAccepted {
                        key: plan.key.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(key = plan.key, error = %e, "Failed to queue replication for lagging backends");
                    last_error = Some(e.to_string());
                }
            }
        }

        if accepted.is_empty() && queued.is_empty() {
            return Err(OrchestratorError::NoBackendAccepted {
                key: plan.key.to_string(),
                reason: last_error.unwrap_or_else(|| "no backend answered".to_string()),
            });
        }

        info!(
            key = plan.key,
            accepted = accepted.len(),
            queued = queued.len(),
            "Write dispatched"
        );
        Ok(PutOutcome {
            key: plan.key.to_string(),
            revision: plan.revision,
            last_modified: plan.last_modified,
            accepted,
            queued,
            operation_id,
            timed_out: gathered.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;
    use crate::backend::{BackendAdapter, ErrorKind};
    use crate::health::ProbeOutcome;

    fn quote(key: &str) -> BusinessRecord {
        let mut record = BusinessRecord::new(key);
        record.general.client = Some("Acme".into());
        record
    }

    #[tokio::test]
    async fn test_put_reaches_both_durable_backends() {
        let f = fixture();
        let outcome = f.orchestrator.put(&quote("X-001")).await.unwrap();

        assert_eq!(outcome.accepted, vec![BackendId::new("primary"), BackendId::new("fallback")]);
        assert!(outcome.is_fully_replicated());
        assert!(f.primary.peek("X-001").is_some());
        assert!(f.fallback.peek("X-001").is_some());
        assert!(f.archive.peek("X-001").is_none());
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreachable_fallback_is_queued() {
        let f = fixture();
        for _ in 0..3 {
            f.monitor.record(&BackendId::new("fallback"), ProbeOutcome::Failure(ErrorKind::Unavailable));
        }

        let outcome = f.orchestrator.put(&quote("X-002")).await.unwrap();
        assert_eq!(outcome.accepted, vec![BackendId::new("primary")]);
        assert_eq!(outcome.queued, vec![BackendId::new("fallback")]);
        assert_eq!(f.fallback.store_count(), 0);

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Create);
        assert_eq!(Some(pending[0].id), outcome.operation_id);
    }

    #[tokio::test]
    async fn test_failing_write_is_queued_even_when_marked_healthy() {
        let f = fixture();
        f.fallback.fail_next(1, ErrorKind::Transient);

        let outcome = f.orchestrator.put(&quote("X-003")).await.unwrap();
        assert_eq!(outcome.queued, vec![BackendId::new("fallback")]);
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_put_with_nothing_reachable_is_still_queued() {
        let f = fixture();
        f.primary.set_available(false);
        f.fallback.set_available(false);

        let outcome = f.orchestrator.put(&quote("X-004")).await.unwrap();
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.queued.len(), 2);
    }

    #[tokio::test]
    async fn test_deadline_returns_before_slow_backend() {
        let f = fixture();
        f.fallback.set_latency(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let outcome = f
            .orchestrator
            .put_with_deadline(&quote("X-005"), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(outcome.accepted, vec![BackendId::new("primary")]);
        assert_eq!(outcome.timed_out, vec![BackendId::new("fallback")]);
        assert_eq!(outcome.queued, vec![BackendId::new("fallback")]);

        // The detached call still lands.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(f.fallback.peek("X-005").is_some());
    }

    #[tokio::test]
    async fn test_payload_carries_stamped_record() {
        let f = fixture();
        let outcome = f.orchestrator.put(&quote("X-006")).await.unwrap();
        let stored = f.primary.fetch("X-006").await.unwrap();
        let record = BusinessRecord::from_bytes(&stored.bytes).unwrap();

        assert_eq!(record.last_modified, outcome.last_modified);
        assert_eq!(stored.modified_at, outcome.last_modified);
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let f = fixture();
        let mut record = quote("X-007");
        record.revision = 4;
        f.orchestrator.put(&record).await.unwrap();

        record.revision = 3;
        let err = f.orchestrator.put(&record).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StaleRevision { attempted: 3, current: 4, .. }));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_keys() {
        let f = fixture();
        f.orchestrator.put(&quote("X-008")).await.unwrap();
        f.fallback.remove("X-008").await.unwrap();

        let outcome = f.orchestrator.delete("X-008").await.unwrap();
        assert_eq!(outcome.accepted.len(), 2);
        assert!(f.primary.peek("X-008").is_none());
    }

    #[tokio::test]
    async fn test_artifact_goes_to_artifact_backends() {
        let f = fixture();
        let artifact = Artifact::new("X-009", 2, b"%PDF-1.7".to_vec());
        let outcome = f.orchestrator.put_artifact(&artifact).await.unwrap();

        assert_eq!(outcome.accepted, vec![BackendId::new("archive"), BackendId::new("objects")]);
        assert!(f.archive.peek("X-009@r2").is_some());
        assert!(f.objects.peek("X-009@r2").is_some());
        assert!(f.primary.peek("X-009@r2").is_none());
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let f = fixture();
        let err = f.orchestrator.put(&BusinessRecord::new("")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidKey(_)));
    }
}
