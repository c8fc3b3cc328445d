// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use super::alerts::{AlertCondition, AlertManager, Severity};
use super::integrity::IntegrityReport;
use super::state::{HealthCheckState, HealthStatus, HealthTransition, ProbeOutcome, Thresholds};
use crate::backend::{BackendId, BackendRegistry};
use crate::config::HealthConfig;

const TRANSITION_CAPACITY: usize = 128;

/// Live per-backend health table fed by periodic probes.
///
/// Transitions are broadcast to subscribers; the sync engine listens for
/// `recovering` to replay queued work for that backend.
pub struct HealthMonitor {
    pub(super) registry: Arc<BackendRegistry>,
    pub(super) config: HealthConfig,
    thresholds: Thresholds,
    table: RwLock<HashMap<BackendId, HealthCheckState>>,
    pub(super) alerts: Arc<AlertManager>,
    transitions: broadcast::Sender<HealthTransition>,
    pub(super) reconcile_requests: Arc<Notify>,
    pub(super) last_integrity: RwLock<Option<IntegrityReport>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthConfig, alerts: Arc<AlertManager>) -> Self {
        let table = registry
            .all()
            .iter()
            .map(|b| (b.id.clone(), HealthCheckState::new(b.id.clone(), b.role)))
            .collect();
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            registry,
            thresholds: Thresholds::from(&config),
            config,
            table: RwLock::new(table),
            alerts,
            transitions,
            reconcile_requests: Arc::new(Notify::new()),
            last_integrity: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.transitions.subscribe()
    }

    /// Signalled when an integrity check asks for a full reconciliation.
    pub fn reconcile_requests(&self) -> Arc<Notify> {
        self.reconcile_requests.clone()
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Unknown backends report unreachable.
    #[must_use]
    pub fn status(&self, id: &BackendId) -> HealthStatus {
        self.table.read().get(id).map_or(HealthStatus::Unreachable, |s| s.status)
    }

    #[must_use]
    pub fn is_reachable(&self, id: &BackendId) -> bool {
        self.status(id).is_reachable()
    }

    /// Current table in registry (priority) order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HealthCheckState> {
        let table = self.table.read();
        self.registry
            .all()
            .iter()
            .filter_map(|b| table.get(&b.id).cloned())
            .collect()
    }

    /// Feed one probe outcome through the state machine.
    pub fn record(&self, id: &BackendId, outcome: ProbeOutcome) -> Option<HealthTransition> {
        let transition = {
            let mut table = self.table.write();
            let state = table.get_mut(id)?;
            let transition = state.apply(outcome, &self.thresholds, Utc::now());
            crate::metrics::set_backend_status(id.as_str(), state.status);
            transition
        }?;

        self.on_transition(&transition);
        Some(transition)
    }

    fn on_transition(&self, t: &HealthTransition) {
        crate::metrics::record_health_transition(t.backend.as_str(), t.to);
        let alert = match t.to {
            HealthStatus::Degraded => Some((AlertCondition::Degraded, Severity::Warning)),
            HealthStatus::Unreachable => Some((AlertCondition::Unreachable, Severity::Critical)),
            HealthStatus::Recovering => Some((AlertCondition::Recovering, Severity::Info)),
            HealthStatus::Healthy => None,
        };
        match t.to {
            HealthStatus::Healthy | HealthStatus::Recovering => {
                info!(backend = %t.backend, from = %t.from, to = %t.to, reason = %t.reason, "Backend health changed")
            }
            _ => warn!(backend = %t.backend, from = %t.from, to = %t.to, reason = %t.reason, "Backend health changed"),
        }
        if let Some((condition, severity)) = alert {
            self.alerts.raise(
                Some(&t.backend),
                condition,
                severity,
                format!("{} ({}) is {}: {}", t.backend, t.role, t.to, t.reason),
            );
        }
        let _ = self.transitions.send(t.clone());
    }

    /// Probe every backend concurrently and apply the results.
    pub async fn probe_all(&self) -> Vec<HealthTransition> {
        let probes = self.registry.all().iter().map(|backend| async move {
            let outcome = match backend.call("probe", backend.adapter.probe()).await {
                Ok(sample) => ProbeOutcome::Success(sample.latency),
                Err(e) => {
                    debug!(backend = %backend.id, error = %e, "Probe failed");
                    ProbeOutcome::Failure(e.kind())
                }
            };
            (backend.id.clone(), outcome)
        });

        join_all(probes)
            .await
            .into_iter()
            .filter_map(|(id, outcome)| self.record(&id, outcome))
            .collect()
    }

    /// Probe now and return the resulting table.
    #[tracing::instrument(skip(self))]
    pub async fn force_health_check(&self) -> Vec<HealthCheckState> {
        self.probe_all().await;
        self.snapshot()
    }

    pub fn last_integrity_report(&self) -> Option<IntegrityReport> {
        self.last_integrity.read().clone()
    }
}
