// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flat JSON snapshot files, rewritten atomically after every mutation.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;

use crate::backend::fs::write_atomic;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One ordered list persisted as a JSON array.
///
/// Without a state directory the snapshot is disabled and every call is a
/// no-op (state lives in memory only).
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: Option<PathBuf>,
}

impl SnapshotFile {
    pub fn new(dir: Option<&Path>, name: &str) -> Self {
        Self {
            path: dir.map(|d| d.join(name)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the list; a missing file is an empty list.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, JournalError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(JournalError::Io { path: path.clone(), source }),
        };
        serde_json::from_slice(&raw).map_err(|source| JournalError::Corrupt { path: path.clone(), source })
    }

    pub async fn save<T: Serialize>(&self, items: &[T]) -> Result<(), JournalError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(items)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| JournalError::Io { path: parent.to_path_buf(), source })?;
        }
        write_atomic(path, &bytes)
            .await
            .map_err(|source| JournalError::Io { path: path.clone(), source })
    }
}
