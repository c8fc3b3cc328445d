// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-backend health state machine.
//!
//! ```text
//!             latency > warn / failure
//!   Healthy ─────────────────────────────▶ Degraded
//!      ▲  ◀──────── fast success ────────────┘  │
//!      │                                        │ N consecutive failures
//!      │ K consecutive successes                │ or latency > critical
//!      │                                        ▼
//!   Recovering ◀──── first success ──────── Unreachable
//!      └──────────── any failure ──────────────▶
//! ```
//!
//! [`HealthCheckState::apply`] is a pure step function: it takes one probe
//! outcome and returns the transition, if any. No I/O happens here.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, BackendRole, ErrorKind};
use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
    Recovering,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Recovering => "recovering",
        }
    }

    /// Whether the orchestrator should send calls to this backend.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !matches!(self, Self::Unreachable)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success(Duration),
    Failure(ErrorKind),
}

/// Thresholds the state machine runs under.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub latency_warn: Duration,
    pub latency_critical: Duration,
    /// N
    pub failure_threshold: u32,
    /// K
    pub recovery_threshold: u32,
    pub latency_samples: usize,
}

impl From<&HealthConfig> for Thresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            latency_warn: config.latency_warn(),
            latency_critical: config.latency_critical(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            latency_samples: config.latency_samples.max(1),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// A status change produced by [`HealthCheckState::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub backend: BackendId,
    pub role: BackendRole,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthCheckState {
    pub backend: BackendId,
    pub role: BackendRole,
    pub status: HealthStatus,
    pub since: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    latencies: VecDeque<Duration>,
}

impl HealthCheckState {
    /// Backends start healthy until a probe says otherwise.
    pub fn new(backend: BackendId, role: BackendRole) -> Self {
        Self {
            backend,
            role,
            status: HealthStatus::Healthy,
            since: Utc::now(),
            last_success: None,
            last_failure: None,
            last_error: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            latencies: VecDeque::new(),
        }
    }

    pub fn latency_samples(&self) -> impl Iterator<Item = &Duration> {
        self.latencies.iter()
    }

    #[must_use]
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    /// 95th percentile (nearest-rank) of the rolling window.
    #[must_use]
    pub fn p95_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    /// Apply one probe outcome.
    pub fn apply(
        &mut self,
        outcome: ProbeOutcome,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        let from = self.status;
        let (to, reason) = match outcome {
            ProbeOutcome::Success(latency) => {
                self.record_latency(latency, thresholds.latency_samples);
                self.last_success = Some(now);
                self.on_success(latency, thresholds)
            }
            ProbeOutcome::Failure(kind) => {
                self.last_failure = Some(now);
                self.last_error = Some(kind);
                self.on_failure(kind, thresholds)
            }
        };

        if to == from {
            return None;
        }
        self.status = to;
        self.since = now;
        Some(HealthTransition {
            backend: self.backend.clone(),
            role: self.role,
            from,
            to,
            reason,
            at: now,
        })
    }

    fn record_latency(&mut self, latency: Duration, window: usize) {
        self.latencies.push_back(latency);
        while self.latencies.len() > window {
            self.latencies.pop_front();
        }
    }

    fn on_success(&mut self, latency: Duration, t: &Thresholds) -> (HealthStatus, String) {
        let slow = latency > t.latency_warn;
        let critical = latency > t.latency_critical;
        let ms = latency.as_millis();

        match self.status {
            HealthStatus::Degraded if critical => {
                self.consecutive_successes = 0;
                (HealthStatus::Unreachable, format!("probe latency {ms}ms above critical threshold"))
            }
            HealthStatus::Healthy | HealthStatus::Degraded => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                if slow {
                    (HealthStatus::Degraded, format!("probe latency {ms}ms above warning threshold"))
                } else {
                    (HealthStatus::Healthy, "probe latency back to normal".to_string())
                }
            }
            HealthStatus::Unreachable => {
                self.consecutive_failures = 0;
                if critical {
                    self.consecutive_successes = 0;
                    return (HealthStatus::Unreachable, String::new());
                }
                // The first success counts toward K
                self.consecutive_successes = 1;
                (HealthStatus::Recovering, "probe succeeded after outage".to_string())
            }
            HealthStatus::Recovering => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                if self.consecutive_successes >= t.recovery_threshold {
                    let to = if slow { HealthStatus::Degraded } else { HealthStatus::Healthy };
                    (to, format!("{} consecutive successful probes", self.consecutive_successes))
                } else {
                    (HealthStatus::Recovering, String::new())
                }
            }
        }
    }

    fn on_failure(&mut self, kind: ErrorKind, t: &Thresholds) -> (HealthStatus, String) {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let n = self.consecutive_failures;

        match self.status {
            HealthStatus::Healthy | HealthStatus::Degraded => {
                if n >= t.failure_threshold {
                    (HealthStatus::Unreachable, format!("{n} consecutive probe failures ({kind})"))
                } else {
                    (HealthStatus::Degraded, format!("probe failed ({kind})"))
                }
            }
            HealthStatus::Recovering => {
                (HealthStatus::Unreachable, format!("probe failed while recovering ({kind})"))
            }
            HealthStatus::Unreachable => (HealthStatus::Unreachable, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            latency_warn: Duration::from_millis(100),
            latency_critical: Duration::from_millis(1000),
            failure_threshold: 3,
            recovery_threshold: 2,
            latency_samples: 5,
        }
    }

    fn state() -> HealthCheckState {
        HealthCheckState::new(BackendId::new("db"), BackendRole::Primary)
    }

    fn ok(ms: u64) -> ProbeOutcome {
        ProbeOutcome::Success(Duration::from_millis(ms))
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Failure(ErrorKind::Unavailable)
    }

    #[test]
    fn test_failure_threshold_is_exact() {
        let t = thresholds();
        let mut s = state();
        let now = Utc::now();

        assert_eq!(s.apply(fail(), &t, now).map(|tr| tr.to), Some(HealthStatus::Degraded));
        assert!(s.apply(fail(), &t, now).is_none());
        assert_eq!(s.status, HealthStatus::Degraded);
        let tr = s.apply(fail(), &t, now).unwrap();
        assert_eq!((tr.from, tr.to), (HealthStatus::Degraded, HealthStatus::Unreachable));
    }

    #[test]
    fn test_slow_probe_degrades_then_recovers() {
        let t = thresholds();
        let mut s = state();
        let now = Utc::now();

        assert_eq!(s.apply(ok(150), &t, now).unwrap().to, HealthStatus::Degraded);
        assert!(s.apply(ok(500), &t, now).is_none());
        assert_eq!(s.apply(ok(10), &t, now).unwrap().to, HealthStatus::Healthy);
    }

    #[test]
    fn test_critical_latency_from_degraded_is_unreachable() {
        let t = thresholds();
        let mut s = state();
        let now = Utc::now();

        s.apply(ok(150), &t, now);
        assert_eq!(s.apply(ok(1500), &t, now).unwrap().to, HealthStatus::Unreachable);
    }

    #[test]
    fn test_recovery_needs_k_successes() {
        let t = thresholds();
        let mut s = state();
        let now = Utc::now();
        for _ in 0..3 {
            s.apply(fail(), &t, now);
        }
        assert_eq!(s.status, HealthStatus::Unreachable);

        assert_eq!(s.apply(ok(5), &t, now).unwrap().to, HealthStatus::Recovering);
        assert_eq!(s.apply(ok(5), &t, now).unwrap().to, HealthStatus::Healthy);
    }

    #[test]
    fn test_failure_while_recovering_returns_to_unreachable() {
        let t = thresholds();
        let mut s = state();
        let now = Utc::now();
        for _ in 0..3 {
            s.apply(fail(), &t, now);
        }
        s.apply(ok(5), &t, now);
        assert_eq!(s.apply(fail(), &t, now).unwrap().to, HealthStatus::Unreachable);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let t = thresholds();
        let mut s = state();
        let now = Utc::now();
        for ms in [1, 2, 3, 4, 5, 6, 7] {
            s.apply(ok(ms), &t, now);
        }
        assert_eq!(s.latency_samples().count(), 5);
        assert_eq!(s.average_latency(), Some(Duration::from_millis(5)));
        assert_eq!(s.p95_latency(), Some(Duration::from_millis(7)));
    }
}
