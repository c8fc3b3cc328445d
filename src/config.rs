// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the storage service.
//!
//! # Example
//!
//! ```
//! use multistore_sync::ServiceConfig;
//!
//! // Minimal config (uses defaults, no backends yet)
//! let config = ServiceConfig::default();
//! assert_eq!(config.health.failure_threshold, 3);
//! assert_eq!(config.health.recovery_threshold, 2);
//!
//! // From TOML
//! let config = ServiceConfig::from_toml_str(r#"
//!     [[backends]]
//!     id = "primary"
//!     role = "primary"
//!     kind = "memory"
//!
//!     [[backends]]
//!     id = "fallback"
//!     role = "fallback"
//!     kind = "sql"
//!     url = "sqlite:///tmp/fallback.db"
//!
//!     [sync]
//!     max_retries = 8
//! "#).unwrap();
//! assert_eq!(config.backends.len(), 2);
//! assert_eq!(config.sync.max_retries, 8);
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::{BackendId, BackendRole};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Deadline applied to `put` when the caller gives none
    #[serde(default = "default_put_deadline_ms")]
    pub put_deadline_ms: u64,

    /// Deadline applied to `get`/`search` when the caller gives none
    #[serde(default = "default_get_deadline_ms")]
    pub get_deadline_ms: u64,
}

fn default_put_deadline_ms() -> u64 { 10_000 }
fn default_get_deadline_ms() -> u64 { 5_000 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            health: HealthConfig::default(),
            alerts: AlertConfig::default(),
            sync: SyncConfig::default(),
            watcher: WatcherConfig::default(),
            put_deadline_ms: default_put_deadline_ms(),
            get_deadline_ms: default_get_deadline_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate backend id {}", backend.id)));
            }
        }
        for role in [BackendRole::Primary, BackendRole::Fallback] {
            if self.backends.iter().filter(|b| b.role == role).count() > 1 {
                return Err(ConfigError::Invalid(format!("more than one {role} backend")));
            }
        }
        let h = &self.health;
        if h.failure_threshold == 0 || h.recovery_threshold == 0 {
            return Err(ConfigError::Invalid("health thresholds must be at least 1".into()));
        }
        if h.latency_warn_ms >= h.latency_critical_ms {
            return Err(ConfigError::Invalid(
                "latency_warn_ms must be below latency_critical_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&h.critical_consistency_ratio) {
            return Err(ConfigError::Invalid("critical_consistency_ratio must be within 0..=1".into()));
        }
        if self.sync.queue_capacity == 0 || self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("queue_capacity and batch_size must be positive".into()));
        }
        if self.watcher.enabled {
            match &self.watcher.source {
                Some(source) if !self.backends.iter().any(|b| &b.id == source) => {
                    return Err(ConfigError::Invalid(format!("watcher source {source} is not configured")));
                }
                None if !self.backends.iter().any(|b| b.role == BackendRole::Archival) => {
                    return Err(ConfigError::Invalid(
                        "watcher enabled without a source and no archival backend".into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn put_deadline(&self) -> Duration {
        Duration::from_millis(self.put_deadline_ms)
    }

    #[must_use]
    pub fn get_deadline(&self) -> Duration {
        Duration::from_millis(self.get_deadline_ms)
    }
}

/// One configured storage system.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    pub role: BackendRole,
    #[serde(flatten)]
    pub kind: BackendKind,
    /// Per-call timeout; a slower call counts as Unavailable
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 { 3_000 }

impl BackendConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// sqlx `Any` URL: `sqlite://...`, `mysql://...`, `postgres://...`
    Sql { url: String },
    Redis {
        url: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    Filesystem { root: PathBuf },
    Memory,
}

/// Health monitor thresholds and timers.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Successful probes slower than this degrade the backend
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: u64,
    /// Probes slower than this count as unreachable from degraded
    #[serde(default = "default_latency_critical_ms")]
    pub latency_critical_ms: u64,
    /// N consecutive failures before unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// K consecutive successes before recovering → healthy
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,
    #[serde(default = "default_integrity_interval_ms")]
    pub integrity_interval_ms: u64,
    #[serde(default = "default_integrity_sample_size")]
    pub integrity_sample_size: usize,
    #[serde(default = "default_critical_consistency_ratio")]
    pub critical_consistency_ratio: f64,
    /// Request a full reconciliation when integrity drops below critical
    #[serde(default = "default_auto_reconcile")]
    pub auto_reconcile: bool,
}

fn default_probe_interval_ms() -> u64 { 15_000 }
fn default_latency_warn_ms() -> u64 { 500 }
fn default_latency_critical_ms() -> u64 { 2_000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_recovery_threshold() -> u32 { 2 }
fn default_latency_samples() -> usize { 20 }
fn default_integrity_interval_ms() -> u64 { 15 * 60 * 1000 }
fn default_integrity_sample_size() -> usize { 100 }
fn default_critical_consistency_ratio() -> f64 { 0.95 }
fn default_auto_reconcile() -> bool { true }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            latency_warn_ms: default_latency_warn_ms(),
            latency_critical_ms: default_latency_critical_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            latency_samples: default_latency_samples(),
            integrity_interval_ms: default_integrity_interval_ms(),
            integrity_sample_size: default_integrity_sample_size(),
            critical_consistency_ratio: default_critical_consistency_ratio(),
            auto_reconcile: default_auto_reconcile(),
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn latency_warn(&self) -> Duration {
        Duration::from_millis(self.latency_warn_ms)
    }

    #[must_use]
    pub fn latency_critical(&self) -> Duration {
        Duration::from_millis(self.latency_critical_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Identical (backend, condition) alerts emitted per rolling hour
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,
    #[serde(default = "default_alert_history")]
    pub history_size: usize,
}

fn default_max_per_hour() -> u32 { 1 }
fn default_alert_history() -> usize { 200 }

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_per_hour: default_max_per_hour(),
            history_size: default_alert_history(),
        }
    }
}

/// Queue draining, retry and reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Directory for queue, dead-letter, conflict and watcher snapshots.
    /// `None` keeps everything in memory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_drain_interval_ms() -> u64 { 5_000 }
fn default_batch_size() -> usize { 50 }
fn default_max_retries() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 5 * 60 * 1000 }
fn default_queue_capacity() -> usize { 10_000 }
fn default_reconcile_interval_ms() -> u64 { 60 * 60 * 1000 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            state_dir: None,
        }
    }
}

/// External change watcher over a manually managed archive.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_watch_interval_ms")]
    pub poll_interval_ms: u64,
    /// Backend to poll (usually the archival role)
    #[serde(default)]
    pub source: Option<BackendId>,
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_watch_interval_ms() -> u64 { 30_000 }

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: default_watch_interval_ms(),
            source: None,
            prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.recovery_threshold, 2);
        assert_eq!(config.alerts.max_per_hour, 1);
        assert!(config.sync.state_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_kinds_parse() {
        let config = ServiceConfig::from_toml_str(
            r#"
            [[backends]]
            id = "primary"
            role = "primary"
            kind = "sql"
            url = "mysql://app:secret@db/records"
            timeout_ms = 1500

            [[backends]]
            id = "objects"
            role = "object_store"
            kind = "redis"
            url = "redis://cache:6379"
            prefix = "docs:"

            [[backends]]
            id = "archive"
            role = "archival"
            kind = "filesystem"
            root = "/srv/archive"

            [watcher]
            enabled = true
            source = "archive"
            "#,
        )
        .unwrap();

        assert_eq!(config.backends[0].timeout(), Duration::from_millis(1500));
        assert!(matches!(config.backends[1].kind, BackendKind::Redis { ref prefix, .. } if prefix.as_deref() == Some("docs:")));
        assert!(matches!(config.backends[2].kind, BackendKind::Filesystem { .. }));
        assert_eq!(config.backends[2].timeout_ms, 3_000);
        assert!(config.watcher.enabled);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = ServiceConfig::from_toml_str(
            r#"
            [[backends]]
            id = "a"
            role = "primary"
            kind = "memory"

            [[backends]]
            id = "a"
            role = "fallback"
            kind = "memory"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_watcher_needs_known_source() {
        let err = ServiceConfig::from_toml_str(
            r#"
            [watcher]
            enabled = true
            source = "nowhere"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_watcher_source_defaults_to_archive() {
        let toml = r#"
            [[backends]]
            id = "share"
            role = "archival"
            kind = "memory"

            [watcher]
            enabled = true
            "#;
        assert!(ServiceConfig::from_toml_str(toml).is_ok());

        let mut config = ServiceConfig::default();
        config.watcher.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_latency_thresholds_rejected() {
        let mut config = ServiceConfig::default();
        config.health.latency_warn_ms = 5_000;
        assert!(config.validate().is_err());
    }
}
