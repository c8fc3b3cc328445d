// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::checksum;

/// Stable identifier of a configured backend (e.g. `primary`, `fallback`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What a backend is used for. Declaration order is read priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    /// Authoritative durable record store
    Primary,
    /// Local durable record store used when the primary is down
    Fallback,
    /// Manually managed archive; read for records, written for artifacts
    Archival,
    /// Remote object store for artifacts
    ObjectStore,
    /// Local artifact directory
    LocalArtifacts,
}

impl BackendRole {
    #[must_use]
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Primary | Self::Fallback)
    }

    #[must_use]
    pub fn holds_artifacts(&self) -> bool {
        matches!(self, Self::Archival | Self::ObjectStore | Self::LocalArtifacts)
    }

    /// Roles consulted when reading a record, in priority order.
    #[must_use]
    pub fn serves_record_reads(&self) -> bool {
        matches!(self, Self::Primary | Self::Fallback | Self::Archival)
    }
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
            Self::Archival => write!(f, "archival"),
            Self::ObjectStore => write!(f, "object_store"),
            Self::LocalArtifacts => write!(f, "local_artifacts"),
        }
    }
}

/// Normalized failure class. Every adapter maps its driver errors onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unavailable,
    AuthError,
    NotFound,
    QuotaExceeded,
    Transient,
    Fatal,
}

impl ErrorKind {
    /// Whether the sync engine should retry an operation that hit this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::QuotaExceeded | Self::Transient)
    }

    /// Multiplier applied to the base retry delay.
    ///
    /// Transient failures retry immediately; quota failures wait much longer.
    #[must_use]
    pub fn backoff_factor(&self) -> f64 {
        match self {
            Self::Transient => 0.0,
            Self::Unavailable => 1.0,
            Self::QuotaExceeded => 8.0,
            Self::AuthError | Self::NotFound | Self::Fatal => 0.0,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::AuthError => "auth_error",
            Self::NotFound => "not_found",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("authentication failed: {0}")]
    AuthError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::AuthError(_) => ErrorKind::AuthError,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Build an error of the given kind.
    pub fn of_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::Unavailable => Self::Unavailable(msg),
            ErrorKind::AuthError => Self::AuthError(msg),
            ErrorKind::NotFound => Self::NotFound(msg),
            ErrorKind::QuotaExceeded => Self::QuotaExceeded(msg),
            ErrorKind::Transient => Self::Transient(msg),
            ErrorKind::Fatal => Self::Fatal(msg),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Bytes plus the metadata every backend keeps alongside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub modified_at: DateTime<Utc>,
    /// SHA-256 of `bytes`, hex
    pub checksum: String,
}

impl Payload {
    pub fn new(bytes: Vec<u8>, modified_at: DateTime<Utc>) -> Self {
        let checksum = checksum(&bytes);
        Self { bytes, modified_at, checksum }
    }
}

/// One key returned from [`BackendAdapter::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub checksum: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    /// Present only when the filter asked for payloads
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub prefix: Option<String>,
    pub include_payload: bool,
    pub limit: Option<usize>,
}

impl ListFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: Some(prefix.into()), ..Self::default() }
    }

    #[must_use]
    pub fn with_payload(mut self) -> Self {
        self.include_payload = true;
        self
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
    }
}

/// Result of a successful health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub latency: Duration,
}

/// Uniform interface over one storage system.
///
/// `store` must be an idempotent upsert: retrying with the same key and
/// payload never appends.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn id(&self) -> &BackendId;

    async fn store(&self, key: &str, payload: &Payload) -> Result<(), BackendError>;

    /// Fetch a payload. Absent keys yield [`BackendError::NotFound`].
    async fn fetch(&self, key: &str) -> Result<Payload, BackendError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ListEntry>, BackendError>;

    /// Remove a key. Absent keys yield [`BackendError::NotFound`].
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    async fn probe(&self) -> Result<HealthSample, BackendError>;
}
