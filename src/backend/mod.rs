// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends behind one adapter trait.
//!
//! - [`SqlBackend`]: primary (MySQL/Postgres) and local fallback (SQLite)
//! - [`RedisBackend`]: remote object store for artifacts
//! - [`FsBackend`]: local artifact directory and the manually managed archive
//! - [`MemoryBackend`]: tests and local development, with fault injection
//!
//! [`BackendRegistry`] holds the configured set ordered by role.

pub mod fs;
pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

pub use self::fs::FsBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;
pub use self::sql::SqlBackend;
pub use self::traits::{
    BackendAdapter, BackendError, BackendId, BackendRole, ErrorKind, HealthSample, ListEntry,
    ListFilter, Payload,
};

use crate::config::{BackendConfig, BackendKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// A configured backend: adapter plus the role and per-call timeout it runs under.
#[derive(Clone)]
pub struct RegisteredBackend {
    pub id: BackendId,
    pub role: BackendRole,
    pub adapter: Arc<dyn BackendAdapter>,
    pub timeout: Duration,
}

impl RegisteredBackend {
    pub fn new(role: BackendRole, adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            id: adapter.id().clone(),
            role,
            adapter,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one adapter call under the per-backend timeout.
    ///
    /// A call that exceeds the timeout is reported as `Unavailable`.
    pub async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_backend_call(self.id.as_str(), operation, "timeout");
                return Err(BackendError::Unavailable(format!(
                    "{} {operation} timed out after {:?}",
                    self.id, self.timeout
                )));
            }
        };
        let status = match &result {
            Ok(_) => "success",
            Err(e) if e.is_not_found() => "not_found",
            Err(_) => "error",
        };
        crate::metrics::record_backend_call(self.id.as_str(), operation, status);
        crate::metrics::record_latency(self.id.as_str(), operation, start.elapsed());
        result
    }
}

impl std::fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The configured backends, ordered by role priority then id.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<RegisteredBackend>,
}

impl BackendRegistry {
    pub fn new(mut backends: Vec<RegisteredBackend>) -> Self {
        backends.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.id.cmp(&b.id)));
        Self { backends }
    }

    /// Connect every configured backend.
    ///
    /// Connection uses the adapters' startup retry; a backend that still
    /// cannot connect fails the whole build so bad config surfaces early.
    pub async fn from_config(configs: &[BackendConfig]) -> Result<Self, BackendError> {
        let mut backends = Vec::with_capacity(configs.len());
        for config in configs {
            let adapter: Arc<dyn BackendAdapter> = match &config.kind {
                BackendKind::Sql { url } => Arc::new(SqlBackend::connect(config.id.clone(), url).await?),
                BackendKind::Redis { url, prefix } => {
                    Arc::new(RedisBackend::connect(config.id.clone(), url, prefix.as_deref()).await?)
                }
                BackendKind::Filesystem { root } => Arc::new(FsBackend::open(config.id.clone(), root).await?),
                BackendKind::Memory => {
                    warn!(backend = %config.id, "Using in-memory backend; contents are lost on restart");
                    Arc::new(MemoryBackend::new(config.id.clone()))
                }
            };
            info!(backend = %config.id, role = %config.role, "Backend registered");
            backends.push(RegisteredBackend::new(config.role, adapter).with_timeout(config.timeout()));
        }
        Ok(Self::new(backends))
    }

    pub fn all(&self) -> &[RegisteredBackend] {
        &self.backends
    }

    pub fn get(&self, id: &BackendId) -> Option<&RegisteredBackend> {
        self.backends.iter().find(|b| &b.id == id)
    }

    pub fn by_role(&self, role: BackendRole) -> Option<&RegisteredBackend> {
        self.backends.iter().find(|b| b.role == role)
    }

    pub fn primary(&self) -> Option<&RegisteredBackend> {
        self.by_role(BackendRole::Primary)
    }

    pub fn fallback(&self) -> Option<&RegisteredBackend> {
        self.by_role(BackendRole::Fallback)
    }

    /// Primary then fallback.
    pub fn durable(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter().filter(|b| b.role.is_durable())
    }

    /// Primary, fallback, archival, in that order.
    pub fn record_readers(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter().filter(|b| b.role.serves_record_reads())
    }

    pub fn artifact_targets(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter().filter(|b| b.role.holds_artifacts())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
