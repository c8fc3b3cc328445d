// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sampled cross-backend integrity check between the two durable stores.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::alerts::{AlertCondition, Severity};
use super::monitor::HealthMonitor;
use crate::backend::{BackendId, ListFilter, RegisteredBackend};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked_at: DateTime<Utc>,
    pub primary: Option<BackendId>,
    pub fallback: Option<BackendId>,
    pub sampled: usize,
    pub consistent: usize,
    pub mismatched: Vec<String>,
    pub missing_in_primary: Vec<String>,
    pub missing_in_fallback: Vec<String>,
    /// consistent / sampled; 1.0 when nothing was sampled
    pub consistency_ratio: f64,
    /// Set when the check could not run
    pub skipped: Option<String>,
}

impl IntegrityReport {
    fn skipped(primary: Option<BackendId>, fallback: Option<BackendId>, reason: impl Into<String>) -> Self {
        Self {
            checked_at: Utc::now(),
            primary,
            fallback,
            sampled: 0,
            consistent: 0,
            mismatched: Vec::new(),
            missing_in_primary: Vec::new(),
            missing_in_fallback: Vec::new(),
            consistency_ratio: 1.0,
            skipped: Some(reason.into()),
        }
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

impl HealthMonitor {
    /// Sample keys from both durable stores and compare checksums.
    ///
    /// A ratio below the critical threshold raises a critical alert and, with
    /// `auto_reconcile`, requests a full reconciliation.
    #[tracing::instrument(skip(self))]
    pub async fn run_integrity_check(&self) -> IntegrityReport {
        let report = self.integrity_pass().await;
        if !report.is_skipped() {
            crate::metrics::set_consistency_ratio(report.consistency_ratio);
            info!(
                sampled = report.sampled,
                consistent = report.consistent,
                ratio = report.consistency_ratio,
                "Integrity check complete"
            );
            if report.consistency_ratio < self.config.critical_consistency_ratio {
                self.alerts.raise(
                    None,
                    AlertCondition::IntegrityCritical,
                    Severity::Critical,
                    format!(
                        "durable stores {:.1}% consistent over {} sampled keys",
                        report.consistency_ratio * 100.0,
                        report.sampled
                    ),
                );
                if self.config.auto_reconcile {
                    self.reconcile_requests.notify_one();
                }
            }
        }
        *self.last_integrity.write() = Some(report.clone());
        report
    }

    async fn integrity_pass(&self) -> IntegrityReport {
        let primary = self.registry.primary().cloned();
        let fallback = self.registry.fallback().cloned();
        let (Some(primary), Some(fallback)) = (primary, fallback) else {
            return IntegrityReport::skipped(
                self.registry.primary().map(|b| b.id.clone()),
                self.registry.fallback().map(|b| b.id.clone()),
                "primary and fallback must both be configured",
            );
        };
        let ids = (Some(primary.id.clone()), Some(fallback.id.clone()));

        for backend in [&primary, &fallback] {
            if !self.is_reachable(&backend.id) {
                return IntegrityReport::skipped(ids.0, ids.1, format!("{} is unreachable", backend.id));
            }
        }

        let (left, right) = tokio::join!(list_checksums(&primary), list_checksums(&fallback));
        let (left, right) = match (left, right) {
            (Ok(l), Ok(r)) => (l, r),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Integrity check listing failed");
                return IntegrityReport::skipped(ids.0, ids.1, e);
            }
        };

        let union: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
        let sample: Vec<&String> = {
            let mut rng = rand::thread_rng();
            let mut picked = union.into_iter().choose_multiple(&mut rng, self.config.integrity_sample_size);
            picked.sort();
            picked
        };

        let mut report = IntegrityReport::skipped(ids.0, ids.1, "");
        report.skipped = None;
        report.sampled = sample.len();
        for key in sample {
            match (left.get(key), right.get(key)) {
                (Some(a), Some(b)) if a == b => report.consistent += 1,
                (Some(_), Some(_)) => report.mismatched.push(key.clone()),
                (None, _) => report.missing_in_primary.push(key.clone()),
                (_, None) => report.missing_in_fallback.push(key.clone()),
            }
        }
        if report.sampled > 0 {
            report.consistency_ratio = report.consistent as f64 / report.sampled as f64;
        }
        report
    }
}

async fn list_checksums(backend: &RegisteredBackend) -> Result<HashMap<String, String>, String> {
    let filter = ListFilter::all();
    backend
        .call("list", backend.adapter.list(&filter))
        .await
        .map(|entries| entries.into_iter().map(|e| (e.key, e.checksum)).collect())
        .map_err(|e| format!("{}: {e}", backend.id))
}
