// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end scenarios for the storage service over in-memory backends.
//!
//! Every backend is a `MemoryBackend`, so outages are scripted with
//! `set_available` / `fail_next` and no infrastructure is needed.
//!
//! Run with: `cargo test --test integration`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use multistore_sync::backend::{MemoryBackend, RegisteredBackend};
use multistore_sync::{
    AlertCondition, Artifact, BackendAdapter, BackendId, BackendRegistry, BackendRole, BusinessRecord,
    ConflictPick, HealthStatus, LineItem, OperationKind, OrchestratorError, Payload, SearchQuery,
    ServiceConfig, ServiceError, ServiceState, StorageService,
};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    primary: Arc<MemoryBackend>,
    fallback: Arc<MemoryBackend>,
    archive: Arc<MemoryBackend>,
    objects: Arc<MemoryBackend>,
}

impl Harness {
    fn new() -> Self {
        Self {
            primary: Arc::new(MemoryBackend::new("A")),
            fallback: Arc::new(MemoryBackend::new("B")),
            archive: Arc::new(MemoryBackend::new("archive")),
            objects: Arc::new(MemoryBackend::new("objects")),
        }
    }

    fn registry(&self) -> BackendRegistry {
        BackendRegistry::new(vec![
            RegisteredBackend::new(BackendRole::Primary, self.primary.clone()),
            RegisteredBackend::new(BackendRole::Fallback, self.fallback.clone()),
            RegisteredBackend::new(BackendRole::Archival, self.archive.clone()),
            RegisteredBackend::new(BackendRole::ObjectStore, self.objects.clone()),
        ])
    }

    async fn service(&self, config: ServiceConfig) -> StorageService {
        StorageService::with_registry(config, self.registry())
            .await
            .expect("service should build")
    }
}

/// Millisecond backoff and fast workers.
fn fast_config(state_dir: Option<PathBuf>) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.health.probe_interval_ms = 20;
    config.sync.drain_interval_ms = 20;
    config.sync.max_retries = 3;
    config.sync.base_backoff_ms = 1;
    config.sync.max_backoff_ms = 10;
    config.sync.state_dir = state_dir;
    config
}

fn quote(key: &str, project: &str) -> BusinessRecord {
    let mut record = BusinessRecord::new(key);
    record.general.client = Some("Acme Industrial".into());
    record.general.project = Some(project.into());
    record.line_items.push(LineItem::new("Pump housing", 2.0, 140.0));
    record
}

/// Probe until `id` has been marked unreachable.
async fn knock_out(service: &StorageService, id: &str) {
    let id = BackendId::new(id);
    for _ in 0..service.config().health.failure_threshold {
        service.force_health_check().await;
    }
    assert_eq!(service.monitor().status(&id), HealthStatus::Unreachable);
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Writes, outages and replay
// =============================================================================

#[tokio::test]
async fn put_then_get_reads_from_primary() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    let outcome = service.put(&quote("Q-0001", "Line 4 retrofit")).await.unwrap();
    assert!(outcome.is_fully_replicated());
    assert_eq!(outcome.accepted, vec![BackendId::new("A"), BackendId::new("B")]);

    let read = service.get("Q-0001").await.unwrap();
    assert_eq!(read.source, BackendId::new("A"));
    assert_eq!(read.value.general.project.as_deref(), Some("Line 4 retrofit"));
    assert_eq!(read.value.last_modified, outcome.last_modified);
}

#[tokio::test]
async fn outage_on_fallback_is_queued_and_replayed_on_recovery() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    h.fallback.set_available(false);
    knock_out(&service, "B").await;

    let outcome = service.put(&quote("X-001", "Outage drill")).await.unwrap();
    assert_eq!(outcome.accepted, vec![BackendId::new("A")]);
    assert_eq!(outcome.queued, vec![BackendId::new("B")]);
    assert_eq!(service.system_status().await.queue_depth, 1);

    // Nothing to do while B is still down
    assert!(service.drain_now().await.is_idle());

    h.fallback.set_available(true);
    let table = service.force_health_check().await;
    let b = table.iter().find(|row| row.id.as_str() == "B").unwrap();
    assert_eq!(b.status, HealthStatus::Recovering);

    let report = service.drain_now().await;
    assert_eq!(report.completed, 1);

    let on_a = h.primary.peek("X-001").unwrap();
    let on_b = h.fallback.fetch("X-001").await.unwrap();
    assert_eq!(on_a.bytes, on_b.bytes);
    assert_eq!(on_a.modified_at, on_b.modified_at);
    assert_eq!(service.system_status().await.queue_depth, 0);
}

#[tokio::test]
async fn get_after_recovery_never_serves_the_lagging_copy() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    let mut record = quote("X-010", "rev1");
    record.revision = 1;
    service.put(&record).await.unwrap();

    h.primary.set_available(false);
    knock_out(&service, "A").await;
    record.revision = 2;
    record.general.project = Some("rev2".into());
    let written = service.put(&record).await.unwrap();
    assert_eq!(written.accepted, vec![BackendId::new("B")]);
    assert_eq!(written.queued, vec![BackendId::new("A")]);

    // A is reachable again but still holds rev1 until the queue drains.
    h.primary.set_available(true);
    service.force_health_check().await;
    assert!(service.monitor().is_reachable(&BackendId::new("A")));

    let read = service.get("X-010").await.unwrap();
    assert_eq!(read.source, BackendId::new("B"));
    assert_eq!(read.value.revision, 2);
    assert!(read.value.last_modified >= written.last_modified);

    service.drain_now().await;
    let read = service.get("X-010").await.unwrap();
    assert_eq!(read.source, BackendId::new("A"));
    assert_eq!(read.value.revision, 2);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_can_be_requeued() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;
    let mut alerts = service.subscribe_alerts();

    // One failure for the put itself, then one per drain attempt.
    h.fallback.fail_next(4, multistore_sync::ErrorKind::Unavailable);
    let outcome = service.put(&quote("D-001", "Retry budget")).await.unwrap();
    assert_eq!(outcome.queued, vec![BackendId::new("B")]);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        service.drain_now().await;
    }

    let dead = service.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "max_retries");
    assert_eq!(dead[0].operation.key, "D-001");
    assert_eq!(dead[0].operation.kind, OperationKind::Create);

    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.condition, AlertCondition::DeadLetter);

    service.requeue_dead_letter(dead[0].operation.id).await.unwrap();
    assert!(service.dead_letters().await.is_empty());
    assert_eq!(service.drain_now().await.completed, 1);
    assert!(h.fallback.peek("D-001").is_some());
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempdir().unwrap();
    let h = Harness::new();

    {
        let service = h.service(fast_config(Some(dir.path().to_path_buf()))).await;
        h.fallback.set_available(false);
        knock_out(&service, "B").await;
        let outcome = service.put(&quote("P-001", "Persisted")).await.unwrap();
        assert_eq!(outcome.queued, vec![BackendId::new("B")]);
    }

    h.fallback.set_available(true);
    let restarted = h.service(fast_config(Some(dir.path().to_path_buf()))).await;
    assert_eq!(restarted.system_status().await.queue_depth, 1);

    assert_eq!(restarted.drain_now().await.completed, 1);
    assert!(h.fallback.peek("P-001").is_some());
}

#[tokio::test]
async fn stale_revision_is_rejected() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    let mut record = quote("R-001", "Revisions");
    record.revision = 3;
    service.put(&record).await.unwrap();

    record.revision = 2;
    let err = service.put(&record).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StaleRevision { attempted: 2, current: 3, .. }));
}

#[tokio::test]
async fn delete_removes_from_both_durable_stores() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    service.put(&quote("DEL-1", "Short lived")).await.unwrap();
    let outcome = service.delete("DEL-1").await.unwrap();
    assert!(outcome.is_fully_replicated());
    assert!(h.primary.peek("DEL-1").is_none());
    assert!(h.fallback.peek("DEL-1").is_none());
    assert!(matches!(service.get("DEL-1").await, Err(OrchestratorError::NotFound { .. })));
}

// =============================================================================
// Artifacts, search, watcher
// =============================================================================

#[tokio::test]
async fn artifact_goes_to_artifact_backends_only() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    let artifact = Artifact::new("Q-0002", 1, b"%PDF-1.7 ...".to_vec());
    let outcome = service.put_artifact(&artifact).await.unwrap();
    assert_eq!(outcome.accepted, vec![BackendId::new("archive"), BackendId::new("objects")]);
    assert!(h.primary.is_empty());

    let read = service.get_artifact("Q-0002", 1).await.unwrap();
    assert_eq!(read.value.bytes, artifact.bytes);
    assert_eq!(read.source, BackendId::new("archive"));
}

#[tokio::test]
async fn search_ranks_across_stores() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    service.put(&quote("S-001", "Valve replacement")).await.unwrap();
    service.put(&quote("S-002", "Conveyor upgrade")).await.unwrap();
    let mut both = quote("S-003", "Valve and conveyor audit");
    both.general.notes = Some("conveyor valve".into());
    service.put(&both).await.unwrap();

    let page = service.search(&SearchQuery::text("valve conveyor"), 1, 10).await;
    assert_eq!(page.total, 3);
    assert_eq!(page.hits[0].record.key, "S-003");
    assert_eq!(page.hits[0].score, 2);
    assert!(!page.is_partial());

    let only = service.search(&SearchQuery::text("valve").with_prefix("S-00"), 1, 10).await;
    let keys: Vec<&str> = only.hits.iter().map(|h| h.record.key.as_str()).collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&"S-001") && keys.contains(&"S-003"));
}

#[tokio::test]
async fn manual_archive_files_are_ingested() {
    let h = Harness::new();
    let mut config = fast_config(None);
    config.watcher.enabled = true;
    let service = h.service(config).await;

    h.archive.insert_raw("scans/site-visit.pdf", Payload::new(b"scan".to_vec(), Utc::now()));
    let report = service.poll_external_changes().await.unwrap();
    assert_eq!((report.new, report.queued), (1, 1));

    assert_eq!(service.drain_now().await.completed, 1);
    assert_eq!(h.objects.peek("scans/site-visit.pdf").unwrap().bytes, b"scan");

    assert_eq!(service.poll_external_changes().await.unwrap().queued, 0);
}

#[tokio::test]
async fn rendered_artifacts_are_not_ingested_back() {
    let h = Harness::new();
    let mut config = fast_config(None);
    config.watcher.enabled = true;
    let service = h.service(config).await;

    let outcome = service
        .put_artifact(&Artifact::new("Q-0300", 1, b"%PDF-1.7".to_vec()))
        .await
        .unwrap();
    assert!(outcome.accepted.contains(&BackendId::new("archive")));

    let report = service.poll_external_changes().await.unwrap();
    assert_eq!(report.queued, 0);
    assert_eq!(service.system_status().await.queue_depth, 0);
}

// =============================================================================
// Reconciliation and conflicts
// =============================================================================

fn raw(record: &BusinessRecord) -> Payload {
    Payload::new(record.to_bytes().unwrap(), record.last_modified)
}

#[tokio::test]
async fn equal_timestamps_become_one_unresolved_conflict() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;
    let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();

    let mut left = quote("Y-002", "Hall A");
    left.last_modified = at;
    let mut right = quote("Y-002", "Hall B");
    right.last_modified = at;
    h.primary.insert_raw("Y-002", raw(&left));
    h.fallback.insert_raw("Y-002", raw(&right));

    let report = service.reconcile_now().await;
    assert_eq!(report.new_conflicts, 1);
    assert_eq!(report.copied(), 0);

    let conflicts = service.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert!(!conflicts[0].resolved);
    assert_eq!(conflicts[0].diverging_fields, vec!["general.project".to_string()]);
    assert_eq!(service.system_status().await.unresolved_conflicts, 1);
    assert!(service
        .alert_history()
        .iter()
        .any(|a| a.condition == AlertCondition::UnresolvedConflict));

    // Running again does not duplicate the record.
    assert_eq!(service.reconcile_now().await.new_conflicts, 0);
    assert_eq!(service.conflicts().await.len(), 1);

    let resolved = service.resolve_conflict(conflicts[0].id, ConflictPick::Right).await.unwrap();
    assert!(resolved.resolved);
    let read = service.get("Y-002").await.unwrap();
    assert_eq!(read.value.general.project.as_deref(), Some("Hall B"));
    assert!(read.value.last_modified > at);
    assert_eq!(h.primary.peek("Y-002").unwrap().bytes, h.fallback.peek("Y-002").unwrap().bytes);
    assert_eq!(service.system_status().await.unresolved_conflicts, 0);
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;
    let earlier = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();

    let mut old = quote("L-001", "Old scope");
    old.last_modified = earlier;
    let mut new = quote("L-001", "New scope");
    new.last_modified = later;
    h.primary.insert_raw("L-001", raw(&old));
    h.fallback.insert_raw("L-001", raw(&new));
    h.primary.insert_raw("L-002", raw(&quote("L-002", "Primary only")));

    let first = service.reconcile_now().await;
    assert_eq!(first.overwritten, 1);
    assert_eq!(first.copied_to_fallback, 1);
    assert_eq!(h.primary.peek("L-001").unwrap().bytes, raw(&new).bytes);

    let second = service.reconcile_now().await;
    assert_eq!(second.copied(), 0);
    assert_eq!(second.new_conflicts, 0);
    assert_eq!(second.consistent, 2);
    assert!(service.system_status().await.last_reconciliation.is_some());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn reconciliation_never_rolls_back_a_concurrent_put() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;

    let now = Utc::now();
    let mut older = quote("K-0001", "t0");
    older.last_modified = now - chrono::Duration::seconds(2);
    let mut newer = quote("K-0001", "t1");
    newer.last_modified = now - chrono::Duration::seconds(1);
    h.primary.insert_raw("K-0001", raw(&newer));
    h.fallback.insert_raw("K-0001", raw(&older));
    h.fallback.set_latency(Duration::from_millis(100));

    let (report, written) = tokio::join!(service.reconcile_now(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.put(&quote("K-0001", "t2")).await.unwrap()
    });
    assert_eq!(written.accepted, vec![BackendId::new("A"), BackendId::new("B")]);
    assert_eq!(report.overwritten, 0);

    h.fallback.set_latency(Duration::ZERO);
    for store in [&h.primary, &h.fallback] {
        let held = BusinessRecord::from_bytes(&store.peek("K-0001").unwrap().bytes).unwrap();
        assert_eq!(held.general.project.as_deref(), Some("t2"));
        assert_eq!(held.last_modified, written.last_modified);
    }
    assert!(service.conflicts().await.is_empty());
}

#[tokio::test]
async fn start_and_shutdown_walk_the_states() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;
    assert_eq!(service.state(), ServiceState::Created);

    service.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), service.wait_for_state(ServiceState::Running))
        .await
        .unwrap();
    assert!(matches!(
        service.start().await,
        Err(ServiceError::InvalidState { action: "start", state: ServiceState::Running })
    ));

    assert!(service.shutdown(Duration::from_secs(2)).await);
    assert_eq!(service.state(), ServiceState::Stopped);
    // Second shutdown is a no-op
    assert!(service.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn running_service_replays_after_recovery_without_intervention() {
    let h = Harness::new();
    let service = h.service(fast_config(None)).await;
    h.fallback.set_available(false);
    service.start().await.unwrap();

    let monitor = service.monitor().clone();
    eventually("B to be marked unreachable", || {
        monitor.status(&BackendId::new("B")) == HealthStatus::Unreachable
    })
    .await;

    let outcome = service.put(&quote("AUTO-1", "Self healing")).await.unwrap();
    assert_eq!(outcome.queued, vec![BackendId::new("B")]);

    h.fallback.set_available(true);
    let fallback = h.fallback.clone();
    eventually("queued write to reach B", || fallback.peek("AUTO-1").is_some()).await;

    let status = service.system_status().await;
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.queue_depth, 0);

    assert!(service.shutdown(Duration::from_secs(2)).await);
}
