// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public result and error types for the orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendId;
use crate::queue::QueueError;
use crate::record::BusinessRecord;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No backend accepted the write and it could not be queued either
    #[error("no backend accepted {key}: {reason}")]
    NoBackendAccepted { key: String, reason: String },

    #[error("stale revision for {key}: {attempted} is below accepted revision {current}")]
    StaleRevision { key: String, attempted: u64, current: u64 },

    #[error("{key} not found (skipped: {skipped:?})")]
    NotFound { key: String, skipped: Vec<BackendId> },

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Which backends took a write.
///
/// `accepted` lists only backends that confirmed the write; everything else
/// is in `queued` and will be replayed by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    pub key: String,
    pub revision: u64,
    pub last_modified: DateTime<Utc>,
    pub accepted: Vec<BackendId>,
    pub queued: Vec<BackendId>,
    pub operation_id: Option<Uuid>,
    /// Backends whose call was still running when the deadline passed
    pub timed_out: Vec<BackendId>,
}

impl PutOutcome {
    #[must_use]
    pub fn is_fully_replicated(&self) -> bool {
        self.queued.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome<T> {
    pub value: T,
    pub source: BackendId,
    /// Higher-priority backends that could not be consulted
    pub skipped: Vec<BackendId>,
}

impl<T> ReadOutcome<T> {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Whitespace-separated terms, matched case-insensitively
    pub text: String,
    pub key_prefix: Option<String>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), key_prefix: None }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub(crate) fn terms(&self) -> Vec<String> {
        self.text.split_whitespace().map(str::to_lowercase).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: BusinessRecord,
    pub source: BackendId,
    pub score: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    /// 1-based
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    /// Sources that failed, timed out or were unreachable
    pub skipped: Vec<BackendId>,
}

impl SearchPage {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}
