// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::{gather, OrchestratorError, ReadOutcome, SearchHit, SearchPage, SearchQuery, StorageOrchestrator};
use crate::backend::{BackendId, ListFilter, Payload, RegisteredBackend};
use crate::metrics::LatencyTimer;
use crate::record::{artifact_key, Artifact, BusinessRecord};

impl StorageOrchestrator {
    pub async fn get(&self, key: &str) -> Result<ReadOutcome<BusinessRecord>, OrchestratorError> {
        self.get_with_deadline(key, self.get_deadline).await
    }

    /// Read a record from the first reachable backend that holds it.
    ///
    /// Order is primary, fallback, archive. Backends that are unreachable,
    /// fail, hold an unreadable copy or still owe a queued write for the key
    /// are reported in `skipped`.
    #[tracing::instrument(skip(self))]
    pub async fn get_with_deadline(
        &self,
        key: &str,
        deadline: Duration,
    ) -> Result<ReadOutcome<BusinessRecord>, OrchestratorError> {
        let _timer = LatencyTimer::new("orchestrator", "get");
        let readers: Vec<RegisteredBackend> = self.registry.record_readers().cloned().collect();
        self.first_hit(key, readers, Instant::now() + deadline, |payload| {
            BusinessRecord::from_bytes(&payload.bytes).map_err(|e| e.to_string())
        })
        .await
    }

    /// Read the artifact rendered for one record revision.
    #[tracing::instrument(skip(self))]
    pub async fn get_artifact(&self, key: &str, revision: u64) -> Result<ReadOutcome<Artifact>, OrchestratorError> {
        let _timer = LatencyTimer::new("orchestrator", "get_artifact");
        let storage_key = artifact_key(key, revision);
        let readers: Vec<RegisteredBackend> = self.registry.artifact_targets().cloned().collect();
        self.first_hit(&storage_key, readers, Instant::now() + self.get_deadline, |payload| {
            Ok(Artifact::new(key, revision, payload.bytes))
        })
        .await
    }

    async fn first_hit<T, F>(
        &self,
        key: &str,
        readers: Vec<RegisteredBackend>,
        deadline: Instant,
        decode: F,
    ) -> Result<ReadOutcome<T>, OrchestratorError>
    where
        F: Fn(Payload) -> Result<T, String>,
    {
        let mut skipped = Vec::new();
        let lagging = self.queue.pending_targets_for(key).await;
        for backend in readers {
            if !self.monitor.is_reachable(&backend.id) {
                debug!(backend = %backend.id, "Skipping unreachable backend");
                skipped.push(backend.id);
                continue;
            }
            // Its copy predates a write still waiting in the queue.
            if lagging.contains(&backend.id) {
                debug!(backend = %backend.id, key, "Skipping backend with queued operations for key");
                skipped.push(backend.id);
                continue;
            }

            let id = backend.id.clone();
            let owned_key = key.to_string();
            let handle = tokio::spawn(async move { backend.call("fetch", backend.adapter.fetch(&owned_key)).await });
            let mut gathered = gather(deadline, vec![(id.clone(), handle)]).await;

            let Some((_, result)) = gathered.done.pop() else {
                warn!(backend = %id, key, "Read deadline passed");
                skipped.push(id);
                continue;
            };
            match result {
                Ok(payload) => match decode(payload) {
                    Ok(value) => {
                        return Ok(ReadOutcome { value, source: id, skipped });
                    }
                    Err(e) => {
                        warn!(backend = %id, key, error = %e, "Stored copy is unreadable");
                        skipped.push(id);
                    }
                },
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(backend = %id, key, error = %e, "Read failed");
                    skipped.push(id);
                }
            }
        }
        Err(OrchestratorError::NotFound { key: key.to_string(), skipped })
    }

    /// Full-text search over primary, fallback and archive, queried concurrently.
    ///
    /// A key found on several backends is reported once, from the
    /// highest-priority one. Hits are ordered by number of matched terms,
    /// then most recent first. `page` is 1-based.
    #[tracing::instrument(skip(self, query), fields(text = %query.text))]
    pub async fn search(&self, query: &SearchQuery, page: usize, page_size: usize) -> SearchPage {
        let _timer = LatencyTimer::new("orchestrator", "search");
        let deadline = Instant::now() + self.get_deadline;
        let mut filter = ListFilter::all().with_payload();
        filter.prefix = query.key_prefix.clone();

        let mut skipped = Vec::new();
        let mut calls = Vec::new();
        for backend in self.registry.record_readers() {
            if !self.monitor.is_reachable(&backend.id) {
                skipped.push(backend.id.clone());
                continue;
            }
            let backend = backend.clone();
            let filter = filter.clone();
            let id = backend.id.clone();
            calls.push((id, tokio::spawn(async move { backend.call("list", backend.adapter.list(&filter)).await })));
        }
        let gathered = gather(deadline, calls).await;

        let mut seen: HashMap<String, SearchHit> = HashMap::new();
        for (id, result) in gathered.done {
            let entries = match result {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(backend = %id, error = %e, "Search source failed");
                    skipped.push(id);
                    continue;
                }
            };
            for entry in entries {
                if seen.contains_key(&entry.key) {
                    continue;
                }
                let Some(bytes) = entry.bytes else { continue };
                // Artifacts and foreign files share the archive; only records are searchable.
                let Ok(record) = BusinessRecord::from_bytes(&bytes) else {
                    continue;
                };
                seen.insert(entry.key, SearchHit { record, source: id.clone(), score: 0 });
            }
        }
        skipped.extend(gathered.timed_out);

        let terms = query.terms();
        let mut hits: Vec<SearchHit> = seen
            .into_values()
            .filter_map(|mut hit| {
                let text = hit.record.search_text();
                hit.score = terms.iter().filter(|t| text.contains(t.as_str())).count();
                (terms.is_empty() || hit.score > 0).then_some(hit)
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.record.last_modified.cmp(&a.record.last_modified))
                .then_with(|| a.record.key.cmp(&b.record.key))
        });

        let page = page.max(1);
        let page_size = page_size.max(1);
        let total = hits.len();
        let hits = hits.into_iter().skip((page - 1) * page_size).take(page_size).collect();
        SearchPage { hits, page, page_size, total, skipped: dedup(skipped) }
    }
}

fn dedup(mut ids: Vec<BackendId>) -> Vec<BackendId> {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    ids
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;
    use crate::backend::{BackendAdapter, ErrorKind};
    use crate::health::ProbeOutcome;
    use crate::record::LineItem;
    use chrono::Utc;

    fn record(key: &str, client: &str, item: &str) -> BusinessRecord {
        let mut record = BusinessRecord::new(key);
        record.general.client = Some(client.into());
        record.line_items.push(LineItem::new(item, 1.0, 100.0));
        record
    }

    fn payload(record: &BusinessRecord) -> Payload {
        Payload::new(record.to_bytes().unwrap(), record.last_modified)
    }

    fn mark_unreachable(f: &super::super::tests::Fixture, id: &str) {
        for _ in 0..3 {
            f.monitor.record(&BackendId::new(id), ProbeOutcome::Failure(ErrorKind::Unavailable));
        }
    }

    #[tokio::test]
    async fn test_get_prefers_primary() {
        let f = fixture();
        f.orchestrator.put(&record("Q-1", "Acme", "Pump")).await.unwrap();

        let read = f.orchestrator.get("Q-1").await.unwrap();
        assert_eq!(read.source, BackendId::new("primary"));
        assert!(!read.is_partial());
        assert_eq!(read.value.general.client.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_get_falls_through_to_archive() {
        let f = fixture();
        let r = record("Q-2", "Globex", "Valve");
        f.archive.insert_raw("Q-2", payload(&r));
        mark_unreachable(&f, "primary");

        let read = f.orchestrator.get("Q-2").await.unwrap();
        assert_eq!(read.source, BackendId::new("archive"));
        assert_eq!(read.skipped, vec![BackendId::new("primary")]);
    }

    #[tokio::test]
    async fn test_get_skips_backend_owing_a_queued_write() {
        let f = fixture();
        let mut r = record("Q-5", "Acme", "Pump");
        r.revision = 1;
        f.orchestrator.put(&r).await.unwrap();

        mark_unreachable(&f, "primary");
        r.revision = 2;
        r.general.project = Some("rev2".into());
        let written = f.orchestrator.put(&r).await.unwrap();
        assert_eq!(written.queued, vec![BackendId::new("primary")]);

        // Back, but its replay has not run yet.
        f.monitor
            .record(&BackendId::new("primary"), ProbeOutcome::Success(Duration::from_millis(1)));
        assert!(f.monitor.is_reachable(&BackendId::new("primary")));

        let read = f.orchestrator.get("Q-5").await.unwrap();
        assert_eq!(read.source, BackendId::new("fallback"));
        assert_eq!(read.skipped, vec![BackendId::new("primary")]);
        assert_eq!(read.value.revision, 2);
        assert!(read.value.last_modified >= written.last_modified);
    }

    #[tokio::test]
    async fn test_get_not_found_lists_skipped() {
        let f = fixture();
        f.fallback.fail_next(1, ErrorKind::Transient);

        let err = f.orchestrator.get("missing").await.unwrap_err();
        match err {
            OrchestratorError::NotFound { skipped, .. } => assert_eq!(skipped, vec![BackendId::new("fallback")]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_archive_copy_is_skipped() {
        let f = fixture();
        f.archive.insert_raw("Q-3", Payload::new(b"%PDF".to_vec(), Utc::now()));

        let err = f.orchestrator.get("Q-3").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { ref skipped, .. } if skipped.len() == 1));
    }

    #[tokio::test]
    async fn test_get_artifact() {
        let f = fixture();
        f.orchestrator
            .put_artifact(&Artifact::new("Q-4", 1, b"%PDF-1.7".to_vec()))
            .await
            .unwrap();
        f.archive.remove("Q-4@r1").await.unwrap();

        let read = f.orchestrator.get_artifact("Q-4", 1).await.unwrap();
        assert_eq!(read.source, BackendId::new("objects"));
        assert_eq!(read.value.bytes, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_search_ranks_and_merges() {
        let f = fixture();
        f.orchestrator.put(&record("Q-10", "Acme", "Pump housing")).await.unwrap();
        f.orchestrator.put(&record("Q-11", "Acme", "Valve")).await.unwrap();
        f.orchestrator.put(&record("Q-12", "Globex", "Pump")).await.unwrap();
        f.archive.insert_raw("Q-13", payload(&record("Q-13", "Acme", "Pump seal")));
        f.archive.insert_raw("Q-13@r1", Payload::new(b"%PDF".to_vec(), Utc::now()));

        let page = f.orchestrator.search(&SearchQuery::text("acme pump"), 1, 10).await;
        let keys: Vec<&str> = page.hits.iter().map(|h| h.record.key.as_str()).collect();

        assert_eq!(page.total, 4);
        assert!(keys[..2].contains(&"Q-10") && keys[..2].contains(&"Q-13"));
        assert_eq!(page.hits[0].score, 2);
        assert_eq!(page.hits[3].score, 1);
        assert!(page.skipped.is_empty());
        let q10 = page.hits.iter().find(|h| h.record.key == "Q-10").unwrap();
        assert_eq!(q10.source, BackendId::new("primary"));
    }

    #[tokio::test]
    async fn test_search_pages_are_one_based() {
        let f = fixture();
        for i in 0..5 {
            f.orchestrator.put(&record(&format!("P-{i}"), "Acme", "Pump")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        let first = f.orchestrator.search(&SearchQuery::text("pump"), 1, 2).await;
        let third = f.orchestrator.search(&SearchQuery::text("pump"), 3, 2).await;
        let zero = f.orchestrator.search(&SearchQuery::text("pump"), 0, 2).await;

        assert_eq!(first.total, 5);
        assert_eq!(first.hits.len(), 2);
        assert_eq!(third.hits.len(), 1);
        assert_eq!(zero.page, 1);
        // Newest first among equal scores.
        assert_eq!(first.hits[0].record.key, "P-4");
    }

    #[tokio::test]
    async fn test_search_reports_partial_results() {
        let f = fixture();
        f.orchestrator.put(&record("Q-20", "Acme", "Pump")).await.unwrap();
        mark_unreachable(&f, "primary");
        f.fallback.fail_next(1, ErrorKind::Unavailable);

        let page = f
            .orchestrator
            .search(&SearchQuery::text("pump").with_prefix("Q-"), 1, 10)
            .await;
        assert!(page.is_partial());
        assert_eq!(page.skipped, vec![BackendId::new("primary"), BackendId::new("fallback")]);
        assert_eq!(page.total, 0);
    }
}
