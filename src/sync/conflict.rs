// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict records produced by reconciliation, and their persisted log.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::BackendId;
use crate::queue::{JournalError, SnapshotFile};
use crate::record::diverging_fields;

pub const CONFLICT_FILE: &str = "conflicts.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    /// Equal timestamps: an operator has to pick a side
    Manual,
}

/// One backend's version of a diverging key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub backend: BackendId,
    pub payload: Value,
    pub checksum: String,
    pub modified_at: DateTime<Utc>,
}

impl ConflictSide {
    pub fn new(backend: BackendId, bytes: &[u8], checksum: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        let payload = serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()));
        Self {
            backend,
            payload,
            checksum: checksum.into(),
            modified_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPick {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub key: String,
    /// Primary's version
    pub left: ConflictSide,
    /// Fallback's version
    pub right: ConflictSide,
    pub diverging_fields: Vec<String>,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<Value>,
    #[serde(default)]
    pub winner: Option<BackendId>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Classify a divergence: the later timestamp wins; a tie stays unresolved.
    pub fn detect(key: impl Into<String>, left: ConflictSide, right: ConflictSide) -> Self {
        let now = Utc::now();
        let fields = diverging_fields(&left.payload, &right.payload);
        let winner = match left.modified_at.cmp(&right.modified_at) {
            std::cmp::Ordering::Greater => Some(&left),
            std::cmp::Ordering::Less => Some(&right),
            std::cmp::Ordering::Equal => None,
        };
        let (strategy, resolution, winner_id, resolved_at) = match winner {
            Some(side) => (
                ResolutionStrategy::LastWriteWins,
                Some(side.payload.clone()),
                Some(side.backend.clone()),
                Some(now),
            ),
            None => (ResolutionStrategy::Manual, None, None, None),
        };
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            diverging_fields: fields,
            strategy,
            resolved: resolution.is_some(),
            resolution,
            winner: winner_id,
            detected_at: now,
            resolved_at,
            left,
            right,
        }
    }

    /// Same key and the same pair of versions, in either order.
    pub fn covers(&self, key: &str, a: &str, b: &str) -> bool {
        self.key == key
            && ((self.left.checksum == a && self.right.checksum == b)
                || (self.left.checksum == b && self.right.checksum == a))
    }

    pub fn side(&self, pick: ConflictPick) -> &ConflictSide {
        match pick {
            ConflictPick::Left => &self.left,
            ConflictPick::Right => &self.right,
        }
    }
}

/// Append-mostly conflict log, persisted after every change.
pub struct ConflictStore {
    records: Mutex<Vec<ConflictRecord>>,
    file: SnapshotFile,
}

impl ConflictStore {
    pub async fn open(state_dir: Option<&Path>) -> Result<Self, JournalError> {
        let file = SnapshotFile::new(state_dir, CONFLICT_FILE);
        let records = file.load().await?;
        Ok(Self { records: Mutex::new(records), file })
    }

    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            file: SnapshotFile::new(None, CONFLICT_FILE),
        }
    }

    pub async fn add(&self, record: ConflictRecord) -> Result<(), JournalError> {
        let mut records = self.records.lock().await;
        records.push(record);
        self.file.save(&records).await
    }

    /// An unresolved record already exists for this key and version pair.
    pub async fn has_unresolved(&self, key: &str, a: &str, b: &str) -> bool {
        self.records
            .lock()
            .await
            .iter()
            .any(|r| !r.resolved && r.covers(key, a, b))
    }

    pub async fn get(&self, id: Uuid) -> Option<ConflictRecord> {
        self.records.lock().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<ConflictRecord> {
        self.records.lock().await.clone()
    }

    pub async fn unresolved(&self) -> Vec<ConflictRecord> {
        self.records.lock().await.iter().filter(|r| !r.resolved).cloned().collect()
    }

    pub async fn unresolved_count(&self) -> usize {
        self.records.lock().await.iter().filter(|r| !r.resolved).count()
    }

    /// Mark a conflict resolved. Returns `None` if it does not exist.
    pub(crate) async fn mark_resolved(
        &self,
        id: Uuid,
        winner: BackendId,
        resolution: Value,
    ) -> Result<Option<ConflictRecord>, JournalError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        record.resolved = true;
        record.winner = Some(winner);
        record.resolution = Some(resolution);
        record.resolved_at = Some(Utc::now());
        let updated = record.clone();
        self.file.save(&records).await?;
        Ok(Some(updated))
    }
}
