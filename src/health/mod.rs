// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend health: probe state machine, alerting and integrity checks.

pub mod alerts;
pub mod integrity;
pub mod monitor;
pub mod state;

pub use alerts::{Alert, AlertCondition, AlertManager, Severity};
pub use integrity::IntegrityReport;
pub use monitor::HealthMonitor;
pub use state::{HealthCheckState, HealthStatus, HealthTransition, ProbeOutcome, Thresholds};
