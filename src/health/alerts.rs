// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate-limited alerting.
//!
//! Alerts are keyed by (backend, condition). Within a rolling hour at most
//! `max_per_hour` alerts per key are emitted; the rest only bump a counter.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::BackendId;
use crate::config::AlertConfig;

const WINDOW: Duration = Duration::from_secs(60 * 60);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    Degraded,
    Unreachable,
    Recovering,
    DeadLetter,
    QueueEviction,
    IntegrityCritical,
    UnresolvedConflict,
}

impl AlertCondition {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Recovering => "recovering",
            Self::DeadLetter => "dead_letter",
            Self::QueueEviction => "queue_eviction",
            Self::IntegrityCritical => "integrity_critical",
            Self::UnresolvedConflict => "unresolved_conflict",
        }
    }
}

impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    /// `None` for service-wide conditions
    pub backend: Option<BackendId>,
    pub condition: AlertCondition,
    pub severity: Severity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    /// Alerts for this key suppressed since the last emitted one
    pub suppressed_before: u64,
}

type AlertKey = (Option<BackendId>, AlertCondition);

#[derive(Default)]
struct AlertState {
    windows: HashMap<AlertKey, VecDeque<Instant>>,
    pending_suppressed: HashMap<AlertKey, u64>,
    suppressed_total: HashMap<AlertKey, u64>,
    history: VecDeque<Alert>,
}

pub struct AlertManager {
    config: AlertConfig,
    state: Mutex<AlertState>,
    tx: broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            config,
            state: Mutex::new(AlertState::default()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Raise an alert now. Returns the alert if it was emitted.
    pub fn raise(
        &self,
        backend: Option<&BackendId>,
        condition: AlertCondition,
        severity: Severity,
        message: impl Into<String>,
    ) -> Option<Alert> {
        self.raise_at(Instant::now(), backend, condition, severity, message)
    }

    /// Raise an alert against an explicit clock.
    pub fn raise_at(
        &self,
        now: Instant,
        backend: Option<&BackendId>,
        condition: AlertCondition,
        severity: Severity,
        message: impl Into<String>,
    ) -> Option<Alert> {
        let message = message.into();
        let key: AlertKey = (backend.cloned(), condition);
        let mut state = self.state.lock();

        let window = state.windows.entry(key.clone()).or_default();
        while window.front().is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW) {
            window.pop_front();
        }

        if window.len() >= self.config.max_per_hour as usize {
            *state.pending_suppressed.entry(key.clone()).or_default() += 1;
            *state.suppressed_total.entry(key).or_default() += 1;
            crate::metrics::record_alert(condition.as_str(), true);
            debug!(backend = ?backend, condition = %condition, "Alert suppressed by rate limit");
            return None;
        }
        window.push_back(now);

        let alert = Alert {
            id: Uuid::new_v4(),
            backend: backend.cloned(),
            condition,
            severity,
            message,
            raised_at: Utc::now(),
            suppressed_before: state.pending_suppressed.remove(&key).unwrap_or(0),
        };

        state.history.push_back(alert.clone());
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
        drop(state);

        crate::metrics::record_alert(condition.as_str(), false);
        match severity {
            Severity::Critical => {
                error!(backend = ?backend, condition = %condition, message = %alert.message, "ALERT")
            }
            Severity::Warning => {
                warn!(backend = ?backend, condition = %condition, message = %alert.message, "ALERT")
            }
            Severity::Info => {
                info!(backend = ?backend, condition = %condition, message = %alert.message, "ALERT")
            }
        }
        // No subscribers is fine
        let _ = self.tx.send(alert.clone());
        Some(alert)
    }

    /// Total suppressed alerts for a (backend, condition) pair.
    #[must_use]
    pub fn suppressed_count(&self, backend: Option<&BackendId>, condition: AlertCondition) -> u64 {
        let key = (backend.cloned(), condition);
        self.state.lock().suppressed_total.get(&key).copied().unwrap_or(0)
    }

    /// Most recent emitted alerts, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Alert> {
        self.state.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_per_hour: u32) -> AlertManager {
        AlertManager::new(AlertConfig { max_per_hour, history_size: 10 })
    }

    #[test]
    fn test_second_alert_in_window_is_suppressed() {
        let alerts = manager(1);
        let db = BackendId::new("db");
        let t0 = Instant::now();

        assert!(alerts.raise_at(t0, Some(&db), AlertCondition::Unreachable, Severity::Critical, "down").is_some());
        assert!(alerts
            .raise_at(t0 + Duration::from_secs(600), Some(&db), AlertCondition::Unreachable, Severity::Critical, "down")
            .is_none());
        assert_eq!(alerts.suppressed_count(Some(&db), AlertCondition::Unreachable), 1);
        assert_eq!(alerts.history().len(), 1);
    }

    #[test]
    fn test_window_rolls_after_an_hour() {
        let alerts = manager(1);
        let db = BackendId::new("db");
        let t0 = Instant::now();

        alerts.raise_at(t0, Some(&db), AlertCondition::Degraded, Severity::Warning, "slow");
        alerts.raise_at(t0 + Duration::from_secs(60), Some(&db), AlertCondition::Degraded, Severity::Warning, "slow");
        let later = alerts
            .raise_at(t0 + Duration::from_secs(3600), Some(&db), AlertCondition::Degraded, Severity::Warning, "slow")
            .unwrap();
        assert_eq!(later.suppressed_before, 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let alerts = manager(1);
        let a = BackendId::new("a");
        let b = BackendId::new("b");
        let t0 = Instant::now();

        assert!(alerts.raise_at(t0, Some(&a), AlertCondition::Unreachable, Severity::Critical, "x").is_some());
        assert!(alerts.raise_at(t0, Some(&b), AlertCondition::Unreachable, Severity::Critical, "x").is_some());
        assert!(alerts.raise_at(t0, Some(&a), AlertCondition::Degraded, Severity::Warning, "x").is_some());
        assert!(alerts.raise_at(t0, None, AlertCondition::DeadLetter, Severity::Critical, "x").is_some());
    }

    #[tokio::test]
    async fn test_subscribers_receive_emitted_alerts() {
        let alerts = manager(2);
        let mut rx = alerts.subscribe();
        alerts.raise(None, AlertCondition::IntegrityCritical, Severity::Critical, "ratio 0.5");

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.condition, AlertCondition::IntegrityCritical);
        assert_eq!(alert.severity, Severity::Critical);
    }
}
