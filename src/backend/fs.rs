// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filesystem backend: local artifact store and the manually managed archive.
//!
//! Each key is one file under the root directory, with an optional
//! `<file>.meta.json` sidecar holding the modification stamp. Files dropped
//! into the directory by hand have no sidecar; their stamp comes from the
//! file's mtime. The checksum is always taken from the bytes, and a sidecar
//! whose checksum no longer matches them (a hand edit, or a crash between the
//! two renames in `store`) is ignored.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::traits::{
    BackendAdapter, BackendError, BackendId, HealthSample, ListEntry, ListFilter, Payload,
};
use crate::record::checksum;

const META_SUFFIX: &str = ".meta.json";
const TMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    modified_at: DateTime<Utc>,
    checksum: String,
}

pub struct FsBackend {
    id: BackendId,
    root: PathBuf,
}

impl FsBackend {
    /// Open (creating if needed) a directory-backed store.
    pub async fn open(id: impl Into<BackendId>, root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(normalize)?;
        Ok(Self { id: id.into(), root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{META_SUFFIX}", encode_key(key)))
    }

    async fn read_sidecar(&self, key: &str) -> Option<Sidecar> {
        let raw = fs::read(self.meta_path(key)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Stamp for `bytes`: the sidecar's if it describes these bytes, else the mtime.
    async fn stamp_for(&self, key: &str, sum: &str, metadata: &std::fs::Metadata) -> DateTime<Utc> {
        match self.read_sidecar(key).await {
            Some(meta) if meta.checksum == sum => meta.modified_at,
            stale => {
                if stale.is_some() {
                    debug!(backend = %self.id, key, "Sidecar does not match file contents, using mtime");
                }
                metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
            }
        }
    }

    async fn describe(&self, key: &str, path: &Path, with_payload: bool) -> Result<ListEntry, BackendError> {
        let metadata = fs::metadata(path).await.map_err(normalize)?;
        let bytes = fs::read(path).await.map_err(normalize)?;
        let sum = checksum(&bytes);
        let modified_at = self.stamp_for(key, &sum, &metadata).await;
        Ok(ListEntry {
            key: key.to_string(),
            checksum: sum,
            modified_at,
            size: metadata.len(),
            bytes: if with_payload { Some(bytes) } else { None },
        })
    }
}

/// Write via temp file + rename so readers never see a partial file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("object");
    let tmp = path.with_file_name(format!("{TMP_PREFIX}{}-{file_name}", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl BackendAdapter for FsBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn store(&self, key: &str, payload: &Payload) -> Result<(), BackendError> {
        write_atomic(&self.data_path(key), &payload.bytes).await.map_err(normalize)?;
        let sidecar = Sidecar { modified_at: payload.modified_at, checksum: payload.checksum.clone() };
        let meta = serde_json::to_vec(&sidecar).map_err(|e| BackendError::Fatal(e.to_string()))?;
        write_atomic(&self.meta_path(key), &meta).await.map_err(normalize)?;
        debug!(backend = %self.id, key, size = payload.bytes.len(), "Stored file");
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Payload, BackendError> {
        let bytes = match fs::read(self.data_path(key)).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_string()))
            }
            Err(e) => return Err(normalize(e)),
        };
        let metadata = fs::metadata(self.data_path(key)).await.map_err(normalize)?;
        let mut payload = Payload::new(bytes, Utc::now());
        payload.modified_at = self.stamp_for(key, &payload.checksum, &metadata).await;
        Ok(payload)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ListEntry>, BackendError> {
        let mut dir = fs::read_dir(&self.root).await.map_err(normalize)?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(normalize)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(META_SUFFIX) || name.starts_with(TMP_PREFIX) || name.starts_with('.') {
                continue;
            }
            if !entry.file_type().await.map_err(normalize)?.is_file() {
                continue;
            }
            let key = decode_key(&name);
            if filter.matches(&key) {
                keys.push((key, entry.path()));
            }
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = filter.limit {
            keys.truncate(limit);
        }

        let mut entries = Vec::with_capacity(keys.len());
        for (key, path) in keys {
            match self.describe(&key, &path, filter.include_payload).await {
                Ok(entry) => entries.push(entry),
                // Removed between read_dir and describe
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        match fs::remove_file(self.data_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_string()))
            }
            Err(e) => return Err(normalize(e)),
        }
        let _ = fs::remove_file(self.meta_path(key)).await;
        Ok(())
    }

    async fn probe(&self) -> Result<HealthSample, BackendError> {
        let start = Instant::now();
        let metadata = fs::metadata(&self.root).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackendError::Unavailable(format!("{} is missing", self.root.display())),
            _ => normalize(e),
        })?;
        if !metadata.is_dir() {
            return Err(BackendError::Fatal(format!("{} is not a directory", self.root.display())));
        }
        let probe = self.root.join(".probe");
        fs::write(&probe, b"ok").await.map_err(normalize)?;
        let _ = fs::remove_file(&probe).await;
        Ok(HealthSample { latency: start.elapsed() })
    }
}

/// Percent-encode everything outside a conservative filename alphabet.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'@' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

fn decode_key(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn normalize(err: io::Error) -> BackendError {
    match err.raw_os_error() {
        // ENOSPC, EDQUOT
        Some(28) | Some(122) => return BackendError::QuotaExceeded(err.to_string()),
        _ => {}
    }
    match err.kind() {
        io::ErrorKind::NotFound => BackendError::NotFound(err.to_string()),
        io::ErrorKind::PermissionDenied => BackendError::AuthError(err.to_string()),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            BackendError::Transient(err.to_string())
        }
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => BackendError::Fatal(err.to_string()),
        _ => BackendError::Unavailable(err.to_string()),
    }
}
