// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate; the embedding daemon chooses the exporter.
//!
//! # Metric Naming Convention
//! - `multistore_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: configured backend id
//! - `operation`: store, fetch, list, remove, probe, put, get, search
//! - `status`: success, error, timeout, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::health::HealthStatus;

/// Record one adapter call.
pub fn record_backend_call(backend: &str, operation: &str, status: &str) {
    counter!(
        "multistore_backend_calls_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_latency(scope: &str, operation: &str, duration: Duration) {
    histogram!(
        "multistore_operation_seconds",
        "scope" => scope.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Backend status gauge (0 = healthy, 1 = degraded, 2 = recovering, 3 = unreachable)
pub fn set_backend_status(backend: &str, status: HealthStatus) {
    let level = match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Recovering => 2.0,
        HealthStatus::Unreachable => 3.0,
    };
    gauge!("multistore_backend_status", "backend" => backend.to_string()).set(level);
}

pub fn record_health_transition(backend: &str, to: HealthStatus) {
    counter!(
        "multistore_health_transitions_total",
        "backend" => backend.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE - Pending and dead-lettered work
// ═══════════════════════════════════════════════════════════════════════════

pub fn set_queue_depth(depth: usize) {
    gauge!("multistore_queue_depth").set(depth as f64);
}

pub fn set_dead_letters(count: usize) {
    gauge!("multistore_dead_letters").set(count as f64);
}

pub fn record_dead_letter(reason: &str) {
    counter!("multistore_dead_letters_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_enqueue(outcome: &str) {
    counter!("multistore_enqueued_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_replay(backend: &str, status: &str) {
    counter!(
        "multistore_replays_total",
        "backend" => backend.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ALERTS / RECONCILIATION
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_alert(condition: &str, suppressed: bool) {
    counter!(
        "multistore_alerts_total",
        "condition" => condition.to_string(),
        "suppressed" => if suppressed { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_conflict(resolved: bool) {
    let outcome = if resolved { "auto_resolved" } else { "unresolved" };
    counter!("multistore_conflicts_total", "outcome" => outcome).increment(1);
}

pub fn record_reconcile(copied: usize, duration: Duration) {
    counter!("multistore_reconcile_runs_total").increment(1);
    counter!("multistore_reconcile_copied_total").increment(copied as u64);
    histogram!("multistore_reconcile_seconds").record(duration.as_secs_f64());
}

pub fn set_consistency_ratio(ratio: f64) {
    gauge!("multistore_consistency_ratio").set(ratio);
}

pub fn record_ingest(count: usize) {
    counter!("multistore_ingested_total").increment(count as u64);
}

/// Track service state transitions
pub fn set_service_state(state: &str) {
    counter!("multistore_state_transitions_total", "state" => state.to_string()).increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    scope: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(scope: &'static str, operation: &'static str) -> Self {
        Self {
            scope,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.scope, self.operation, self.start.elapsed());
    }
}
