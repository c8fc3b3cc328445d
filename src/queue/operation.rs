// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{BackendId, ErrorKind, Payload};
use crate::record::{hex_bytes, intent_checksum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Externally added file picked up by the change watcher
    Ingest,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Ingest => "ingest",
        }
    }

    fn default_priority(&self) -> Priority {
        match self {
            Self::Delete => Priority::High,
            Self::Create | Self::Update => Priority::Normal,
            Self::Ingest => Priority::Low,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain order: higher first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// A durable write or delete intent waiting for one or more backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Storage key the operation applies to
    pub key: String,
    pub targets: BTreeSet<BackendId>,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Modification stamp carried to the backends with the payload
    pub modified_at: DateTime<Utc>,
    /// Dedup key over (key, payload)
    pub checksum: String,
    /// Origin of an ingest (backend the file was found on)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<BackendId>,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_kind: Option<ErrorKind>,
    pub next_attempt_at: DateTime<Utc>,
}

impl OperationRecord {
    fn build(
        kind: OperationKind,
        key: impl Into<String>,
        targets: impl IntoIterator<Item = BackendId>,
        payload: Vec<u8>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        let key = key.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            checksum: intent_checksum(&key, &payload),
            key,
            targets: targets.into_iter().collect(),
            payload,
            modified_at,
            source: None,
            created_at: now,
            priority: kind.default_priority(),
            retry_count: 0,
            max_retries: 0,
            last_error: None,
            last_error_kind: None,
            next_attempt_at: now,
        }
    }

    /// Store `payload` under `key` on every target.
    pub fn write(
        kind: OperationKind,
        key: impl Into<String>,
        targets: impl IntoIterator<Item = BackendId>,
        payload: &Payload,
    ) -> Self {
        Self::build(kind, key, targets, payload.bytes.clone(), payload.modified_at)
    }

    pub fn delete(key: impl Into<String>, targets: impl IntoIterator<Item = BackendId>) -> Self {
        Self::build(OperationKind::Delete, key, targets, Vec::new(), Utc::now())
    }

    /// Copy an externally added file to the artifact backends.
    pub fn ingest(
        source: BackendId,
        key: impl Into<String>,
        targets: impl IntoIterator<Item = BackendId>,
        payload: &Payload,
    ) -> Self {
        let mut op = Self::build(
            OperationKind::Ingest,
            key,
            targets,
            payload.bytes.clone(),
            payload.modified_at,
        );
        op.source = Some(source);
        op
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Payload as stored on backends.
    #[must_use]
    pub fn to_payload(&self) -> Payload {
        Payload::new(self.payload.clone(), self.modified_at)
    }

    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }
}

/// An operation that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub operation: OperationRecord,
    /// `max_retries`, `evicted`, or the terminal error kind
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}
