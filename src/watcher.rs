// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External change watcher.
//!
//! Polls a manually managed backend (usually the archive) for files added or
//! changed outside the service, and queues `ingest` operations that copy them
//! to the artifact backends. What has been seen is tracked by checksum and
//! persisted to `watcher_seen.json`, so a restart does not re-ingest.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendId, BackendRegistry, BackendRole, ListFilter, Payload};
use crate::config::WatcherConfig;
use crate::health::HealthMonitor;
use crate::queue::{JournalError, OperationQueue, OperationRecord, SnapshotFile};

pub const WATCHER_FILE: &str = "watcher_seen.json";

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("no watch source configured and no archival backend to default to")]
    NoSource,
    #[error("watch source {0} is not a configured backend")]
    UnknownSource(BackendId),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeenEntry {
    key: String,
    checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchReport {
    pub scanned: usize,
    pub new: usize,
    pub changed: usize,
    pub queued: usize,
    pub skipped: Option<String>,
}

pub struct ExternalChangeWatcher {
    registry: Arc<BackendRegistry>,
    monitor: Arc<HealthMonitor>,
    queue: Arc<OperationQueue>,
    source: BackendId,
    prefix: Option<String>,
    seen: Mutex<HashMap<String, String>>,
    file: SnapshotFile,
}

impl ExternalChangeWatcher {
    pub async fn open(
        registry: Arc<BackendRegistry>,
        monitor: Arc<HealthMonitor>,
        queue: Arc<OperationQueue>,
        config: &WatcherConfig,
        state_dir: Option<&Path>,
    ) -> Result<Self, WatchError> {
        let source = match &config.source {
            Some(id) => id.clone(),
            None => registry
                .by_role(BackendRole::Archival)
                .map(|b| b.id.clone())
                .ok_or(WatchError::NoSource)?,
        };
        if registry.get(&source).is_none() {
            return Err(WatchError::UnknownSource(source));
        }

        let file = SnapshotFile::new(state_dir, WATCHER_FILE);
        let seen: Vec<SeenEntry> = file.load().await?;
        Ok(Self {
            registry,
            monitor,
            queue,
            source,
            prefix: config.prefix.clone(),
            seen: Mutex::new(seen.into_iter().map(|e| (e.key, e.checksum)).collect()),
            file,
        })
    }

    pub fn source(&self) -> &BackendId {
        &self.source
    }

    /// Artifact backends other than the source.
    fn targets(&self) -> Vec<BackendId> {
        self.registry
            .artifact_targets()
            .filter(|b| matches!(b.role, BackendRole::ObjectStore | BackendRole::LocalArtifacts))
            .filter(|b| b.id != self.source)
            .map(|b| b.id.clone())
            .collect()
    }

    /// Record a file the service itself is about to write to the source, so
    /// the next poll does not take it for an external addition.
    pub async fn note_own_write(&self, key: &str, checksum: &str) {
        let mut seen = self.seen.lock().await;
        if seen.get(key).is_some_and(|c| c == checksum) {
            return;
        }
        seen.insert(key.to_string(), checksum.to_string());
        self.persist(&seen).await;
    }

    async fn persist(&self, seen: &HashMap<String, String>) {
        let mut snapshot: Vec<SeenEntry> = seen
            .iter()
            .map(|(key, checksum)| SeenEntry { key: key.clone(), checksum: checksum.clone() })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        if let Err(e) = self.file.save(&snapshot).await {
            warn!(error = %e, "Failed to persist watcher state");
        }
    }

    /// Scan the source once and queue what is new or changed.
    #[tracing::instrument(skip(self), fields(source = %self.source))]
    pub async fn poll_once(&self) -> WatchReport {
        let skip = |reason: String| WatchReport { skipped: Some(reason), ..WatchReport::default() };

        if !self.monitor.is_reachable(&self.source) {
            return skip(format!("{} is unreachable", self.source));
        }
        let Some(backend) = self.registry.get(&self.source) else {
            return skip(format!("{} is not configured", self.source));
        };
        let targets = self.targets();
        if targets.is_empty() {
            return skip("no artifact backends to ingest into".to_string());
        }

        let mut filter = ListFilter::all().with_payload();
        filter.prefix = self.prefix.clone();
        let entries = match backend.call("list", backend.adapter.list(&filter)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Watch scan failed");
                return skip(format!("scan failed: {e}"));
            }
        };

        let mut report = WatchReport { scanned: entries.len(), ..WatchReport::default() };
        let mut seen = self.seen.lock().await;
        for entry in entries {
            let is_new = match seen.get(&entry.key) {
                Some(checksum) if *checksum == entry.checksum => continue,
                Some(_) => false,
                None => true,
            };
            let payload = match entry.bytes {
                Some(bytes) => Payload::new(bytes, entry.modified_at),
                None => match backend.call("fetch", backend.adapter.fetch(&entry.key)).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(key = %entry.key, error = %e, "Could not read external file");
                        continue;
                    }
                },
            };

            let op = OperationRecord::ingest(self.source.clone(), entry.key.clone(), targets.iter().cloned(), &payload);
            match self.queue.enqueue(op).await {
                Ok(_) => {
                    debug!(key = %entry.key, new = is_new, "Queued ingest");
                    if is_new {
                        report.new += 1;
                    } else {
                        report.changed += 1;
                    }
                    report.queued += 1;
                    seen.insert(entry.key, entry.checksum);
                }
                // Left unseen so the next poll retries it.
                Err(e) => warn!(key = %entry.key, error = %e, "Failed to queue ingest"),
            }
        }

        if report.queued > 0 {
            self.persist(&seen).await;
            crate::metrics::record_ingest(report.queued);
            info!(new = report.new, changed = report.changed, "External changes queued for ingest");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, RegisteredBackend};
    use crate::config::{AlertConfig, HealthConfig};
    use crate::health::AlertManager;
    use crate::queue::OperationKind;
    use chrono::Utc;
    use tempfile::tempdir;

    struct Fixture {
        archive: Arc<MemoryBackend>,
        registry: Arc<BackendRegistry>,
        monitor: Arc<HealthMonitor>,
        queue: Arc<OperationQueue>,
    }

    fn fixture() -> Fixture {
        let archive = Arc::new(MemoryBackend::new("archive"));
        let registry = Arc::new(BackendRegistry::new(vec![
            RegisteredBackend::new(BackendRole::Primary, Arc::new(MemoryBackend::new("primary"))),
            RegisteredBackend::new(BackendRole::Archival, archive.clone()),
            RegisteredBackend::new(BackendRole::ObjectStore, Arc::new(MemoryBackend::new("objects"))),
            RegisteredBackend::new(BackendRole::LocalArtifacts, Arc::new(MemoryBackend::new("local"))),
        ]));
        let alerts = Arc::new(AlertManager::new(AlertConfig::default()));
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), HealthConfig::default(), alerts.clone()));
        let queue = Arc::new(OperationQueue::in_memory(alerts));
        Fixture { archive, registry, monitor, queue }
    }

    async fn watcher(f: &Fixture, dir: Option<&Path>) -> ExternalChangeWatcher {
        ExternalChangeWatcher::open(
            f.registry.clone(),
            f.monitor.clone(),
            f.queue.clone(),
            &WatcherConfig::default(),
            dir,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_defaults_to_archive_and_targets_artifact_stores() {
        let f = fixture();
        let w = watcher(&f, None).await;
        assert_eq!(w.source().as_str(), "archive");
        assert_eq!(w.targets(), vec![BackendId::new("objects"), BackendId::new("local")]);
    }

    #[tokio::test]
    async fn test_new_then_changed_then_quiet() {
        let f = fixture();
        let w = watcher(&f, None).await;
        f.archive.insert_raw("scan-1.pdf", Payload::new(b"v1".to_vec(), Utc::now()));

        let first = w.poll_once().await;
        assert_eq!((first.new, first.queued), (1, 1));
        let op = &f.queue.pending().await[0];
        assert_eq!(op.kind, OperationKind::Ingest);
        assert_eq!(op.source, Some(BackendId::new("archive")));

        assert_eq!(w.poll_once().await.queued, 0);

        f.archive.insert_raw("scan-1.pdf", Payload::new(b"v2".to_vec(), Utc::now()));
        let third = w.poll_once().await;
        assert_eq!(third.changed, 1);
        // Same key: the queued ingest takes the newer bytes.
        assert_eq!(f.queue.len().await, 1);
        assert_eq!(f.queue.pending().await[0].payload, b"v2");
    }

    #[tokio::test]
    async fn test_own_writes_are_not_ingested() {
        let f = fixture();
        let w = watcher(&f, None).await;
        let rendered = Payload::new(b"%PDF-1.7".to_vec(), Utc::now());
        w.note_own_write("Q-9@r1", &rendered.checksum).await;
        f.archive.insert_raw("Q-9@r1", rendered);

        let report = w.poll_once().await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.queued, 0);
        assert!(f.queue.is_empty().await);

        // A later manual edit of the same file is still picked up.
        f.archive.insert_raw("Q-9@r1", Payload::new(b"%PDF-1.7 signed".to_vec(), Utc::now()));
        assert_eq!(w.poll_once().await.changed, 1);
    }

    #[tokio::test]
    async fn test_seen_set_survives_restart() {
        let dir = tempdir().unwrap();
        let f = fixture();
        f.archive.insert_raw("scan-2.pdf", Payload::new(b"x".to_vec(), Utc::now()));
        assert_eq!(watcher(&f, Some(dir.path())).await.poll_once().await.queued, 1);

        let restarted = watcher(&f, Some(dir.path())).await;
        assert_eq!(restarted.poll_once().await.queued, 0);
        assert!(dir.path().join(WATCHER_FILE).exists());
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let f = fixture();
        let config = WatcherConfig { source: Some(BackendId::new("nope")), ..WatcherConfig::default() };
        let err = ExternalChangeWatcher::open(f.registry.clone(), f.monitor.clone(), f.queue.clone(), &config, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::UnknownSource(_)));
    }
}
