// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The storage service: one instance owning the health table, the queue and
//! every worker.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use multistore_sync::{BusinessRecord, ServiceConfig, StorageService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::load("multistore.toml")?;
//! let service = StorageService::from_config(config).await?;
//! service.start().await?;
//!
//! let outcome = service.put(&BusinessRecord::new("Q-2025-0001")).await?;
//! println!("accepted by {:?}, queued for {:?}", outcome.accepted, outcome.queued);
//!
//! service.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{BackendStatus, ServiceError, ServiceState, SystemStatus};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::BackendRegistry;
use crate::config::ServiceConfig;
use crate::health::{Alert, AlertManager, HealthMonitor, IntegrityReport};
use crate::orchestrator::{
    OrchestratorError, PutOutcome, ReadOutcome, SearchPage, SearchQuery, StorageOrchestrator,
};
use crate::queue::{DeadLetter, OperationQueue, QueueError, QueueSettings};
use crate::record::{checksum, Artifact, BusinessRecord};
use crate::sync::{
    ConflictPick, ConflictRecord, ConflictStore, DrainReport, ReconcileReport, SyncEngine, SyncError,
};
use crate::watcher::{ExternalChangeWatcher, WatchReport};

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct StorageService {
    config: ServiceConfig,
    registry: Arc<BackendRegistry>,
    alerts: Arc<AlertManager>,
    monitor: Arc<HealthMonitor>,
    queue: Arc<OperationQueue>,
    orchestrator: Arc<StorageOrchestrator>,
    engine: Arc<SyncEngine>,
    watcher: Option<Arc<ExternalChangeWatcher>>,
    state: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<Worker>>,
}

impl StorageService {
    /// Validate the config, connect every backend and restore persisted state.
    pub async fn from_config(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let registry = BackendRegistry::from_config(&config.backends).await?;
        Self::with_registry(config, registry).await
    }

    /// Build around already-constructed adapters (tests, embedding).
    pub async fn with_registry(config: ServiceConfig, registry: BackendRegistry) -> Result<Self, ServiceError> {
        let registry = Arc::new(registry);
        let state_dir = config.sync.state_dir.as_deref();

        let alerts = Arc::new(AlertManager::new(config.alerts.clone()));
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), config.health.clone(), alerts.clone()));
        let queue = Arc::new(
            OperationQueue::open(state_dir, QueueSettings::from(&config.sync), alerts.clone()).await?,
        );
        let conflicts = Arc::new(ConflictStore::open(state_dir).await?);
        let orchestrator = Arc::new(
            StorageOrchestrator::new(registry.clone(), monitor.clone(), queue.clone())
                .with_deadlines(config.put_deadline(), config.get_deadline()),
        );
        let engine = Arc::new(SyncEngine::new(
            registry.clone(),
            monitor.clone(),
            queue.clone(),
            conflicts,
            config.sync.batch_size,
        ));
        let watcher = if config.watcher.enabled {
            let watcher = ExternalChangeWatcher::open(
                registry.clone(),
                monitor.clone(),
                queue.clone(),
                &config.watcher,
                state_dir,
            )
            .await?;
            Some(Arc::new(watcher))
        } else {
            None
        };

        let (state, state_rx) = watch::channel(ServiceState::Created);
        let (stop, _) = watch::channel(false);
        crate::metrics::set_service_state(ServiceState::Created.as_str());
        Ok(Self {
            config,
            registry,
            alerts,
            monitor,
            queue,
            orchestrator,
            engine,
            watcher,
            state,
            state_rx,
            stop,
            workers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.alerts.history()
    }

    // ========== Records and artifacts ==========

    pub async fn put(&self, record: &BusinessRecord) -> Result<PutOutcome, OrchestratorError> {
        self.orchestrator.put(record).await
    }

    pub async fn put_with_deadline(
        &self,
        record: &BusinessRecord,
        deadline: Duration,
    ) -> Result<PutOutcome, OrchestratorError> {
        self.orchestrator.put_with_deadline(record, deadline).await
    }

    pub async fn delete(&self, key: &str) -> Result<PutOutcome, OrchestratorError> {
        self.orchestrator.delete(key).await
    }

    /// Store a rendered artifact. When the watched source is one of the
    /// artifact backends, the write is marked as seen first so the watcher
    /// does not ingest it back.
    pub async fn put_artifact(&self, artifact: &Artifact) -> Result<PutOutcome, OrchestratorError> {
        if let Some(watcher) = &self.watcher {
            if self.registry.artifact_targets().any(|b| &b.id == watcher.source()) {
                watcher.note_own_write(&artifact.storage_key(), &checksum(&artifact.bytes)).await;
            }
        }
        self.orchestrator.put_artifact(artifact).await
    }

    pub async fn get(&self, key: &str) -> Result<ReadOutcome<BusinessRecord>, OrchestratorError> {
        self.orchestrator.get(key).await
    }

    pub async fn get_with_deadline(
        &self,
        key: &str,
        deadline: Duration,
    ) -> Result<ReadOutcome<BusinessRecord>, OrchestratorError> {
        self.orchestrator.get_with_deadline(key, deadline).await
    }

    pub async fn get_artifact(&self, key: &str, revision: u64) -> Result<ReadOutcome<Artifact>, OrchestratorError> {
        self.orchestrator.get_artifact(key, revision).await
    }

    pub async fn search(&self, query: &SearchQuery, page: usize, page_size: usize) -> SearchPage {
        self.orchestrator.search(query, page, page_size).await
    }

    // ========== Status and maintenance ==========

    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            state: self.state(),
            backends: self.monitor.snapshot().iter().map(BackendStatus::from).collect(),
            queue_depth: self.queue.len().await,
            dead_letters: self.queue.dead_letters().await.len(),
            last_reconciliation: self.engine.last_reconciliation(),
            unresolved_conflicts: self.engine.conflicts().unresolved_count().await,
            last_integrity: self.monitor.last_integrity_report(),
        }
    }

    /// Probe every backend now; recoveries are handed to the sync engine.
    pub async fn force_health_check(&self) -> Vec<BackendStatus> {
        for transition in self.monitor.probe_all().await {
            if let Err(e) = self.engine.handle_transition(&transition).await {
                tracing::warn!(backend = %transition.backend, error = %e, "Failed to release queued operations");
            }
        }
        self.monitor.snapshot().iter().map(BackendStatus::from).collect()
    }

    pub async fn force_integrity_check(&self) -> IntegrityReport {
        self.monitor.run_integrity_check().await
    }

    pub async fn reconcile_now(&self) -> ReconcileReport {
        self.engine.reconcile().await
    }

    pub async fn drain_now(&self) -> DrainReport {
        self.engine.drain_once().await
    }

    /// Poll the watched source now. `None` when the watcher is disabled.
    pub async fn poll_external_changes(&self) -> Option<WatchReport> {
        match &self.watcher {
            Some(watcher) => Some(watcher.poll_once().await),
            None => None,
        }
    }

    // ========== Dead letters and conflicts ==========

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters().await
    }

    pub async fn requeue_dead_letter(&self, id: Uuid) -> Result<(), QueueError> {
        self.queue.requeue_dead_letter(id).await?;
        self.engine.wake_handle().notify_one();
        Ok(())
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.engine.conflicts().all().await
    }

    pub async fn resolve_conflict(&self, id: Uuid, pick: ConflictPick) -> Result<ConflictRecord, SyncError> {
        self.engine.resolve_conflict(id, pick).await
    }
}
