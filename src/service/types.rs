// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the storage service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::backend::{BackendError, BackendId, BackendRole, ErrorKind};
use crate::config::ConfigError;
use crate::health::{HealthCheckState, HealthStatus, IntegrityReport};
use crate::queue::{JournalError, QueueError};
use crate::watcher::WatchError;

/// Service lifecycle state.
///
/// Observe it with [`super::StorageService::state`] or
/// [`super::StorageService::state_receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Built, workers not started
    Created,
    /// Initial probe in progress
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl ServiceState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend setup failed: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Watcher(#[from] WatchError),
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: ServiceState },
}

/// One row of the health table, as reported by `system_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub id: BackendId,
    pub role: BackendRole,
    pub status: HealthStatus,
    pub since: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    pub consecutive_failures: u32,
    pub average_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
}

impl From<&HealthCheckState> for BackendStatus {
    fn from(state: &HealthCheckState) -> Self {
        let ms = |d: std::time::Duration| d.as_micros() as f64 / 1000.0;
        Self {
            id: state.backend.clone(),
            role: state.role,
            status: state.status,
            since: state.since,
            last_success: state.last_success,
            last_failure: state.last_failure,
            last_error: state.last_error,
            consecutive_failures: state.consecutive_failures,
            average_latency_ms: state.average_latency().map(ms),
            p95_latency_ms: state.p95_latency().map(ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub state: ServiceState,
    pub backends: Vec<BackendStatus>,
    pub queue_depth: usize,
    pub dead_letters: usize,
    pub last_reconciliation: Option<DateTime<Utc>>,
    pub unresolved_conflicts: usize,
    pub last_integrity: Option<IntegrityReport>,
}

impl SystemStatus {
    /// Every backend is healthy and nothing is waiting.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.queue_depth == 0
            && self.dead_letters == 0
            && self.unresolved_conflicts == 0
            && self.backends.iter().all(|b| b.status == HealthStatus::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Created.to_string(), "created");
        assert_eq!(ServiceState::ShuttingDown.to_string(), "shutting_down");
    }

    #[test]
    fn test_backend_status_from_health_state() {
        let mut state = HealthCheckState::new(BackendId::new("primary"), BackendRole::Primary);
        state.apply(
            crate::health::ProbeOutcome::Success(Duration::from_millis(12)),
            &crate::health::Thresholds::default(),
            Utc::now(),
        );
        let row = BackendStatus::from(&state);
        assert_eq!(row.status, HealthStatus::Healthy);
        assert_eq!(row.average_latency_ms, Some(12.0));

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["role"], "primary");
    }
}
