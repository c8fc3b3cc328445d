// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for durable record storage.
//!
//! One adapter type serves both durable roles: the primary points at a
//! MySQL or Postgres URL, the local fallback at a SQLite file. Objects are
//! stored as opaque blobs with their checksum and modification time:
//!
//! ```sql
//! CREATE TABLE multistore_objects (
//!   object_key VARCHAR(255) PRIMARY KEY,
//!   payload BLOB NOT NULL,
//!   checksum VARCHAR(64) NOT NULL,
//!   modified_at_ms BIGINT NOT NULL,
//!   size_bytes BIGINT NOT NULL
//! )
//! ```
//!
//! ## sqlx Any driver quirks
//!
//! The `Any` driver does not rewrite placeholders, so Postgres gets `$n`
//! while SQLite and MySQL get `?`. Text columns may come back as bytes on
//! MySQL, so string reads fall back to UTF-8 decoding.

use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{
    BackendAdapter, BackendError, BackendId, HealthSample, ListEntry, ListFilter, Payload,
};
use crate::resilience::retry::{retry_backend, RetryConfig};

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite:") {
            Self::Sqlite
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Self::Postgres
        } else {
            Self::MySql
        }
    }

    /// Placeholder for the 1-based parameter `n`.
    fn ph(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    fn create_table(&self) -> &'static str {
        match self {
            Self::Sqlite => {
                "CREATE TABLE IF NOT EXISTS multistore_objects (
                    object_key TEXT PRIMARY KEY,
                    payload BLOB NOT NULL,
                    checksum TEXT NOT NULL,
                    modified_at_ms INTEGER NOT NULL,
                    size_bytes INTEGER NOT NULL
                )"
            }
            Self::MySql => {
                "CREATE TABLE IF NOT EXISTS multistore_objects (
                    object_key VARCHAR(255) PRIMARY KEY,
                    payload LONGBLOB NOT NULL,
                    checksum VARCHAR(64) NOT NULL,
                    modified_at_ms BIGINT NOT NULL,
                    size_bytes BIGINT NOT NULL
                )"
            }
            Self::Postgres => {
                "CREATE TABLE IF NOT EXISTS multistore_objects (
                    object_key VARCHAR(255) PRIMARY KEY,
                    payload BYTEA NOT NULL,
                    checksum VARCHAR(64) NOT NULL,
                    modified_at_ms BIGINT NOT NULL,
                    size_bytes BIGINT NOT NULL
                )"
            }
        }
    }

    fn upsert(&self) -> String {
        let values = (1..=5).map(|n| self.ph(n)).collect::<Vec<_>>().join(", ");
        let insert = format!(
            "INSERT INTO multistore_objects (object_key, payload, checksum, modified_at_ms, size_bytes) VALUES ({values})"
        );
        match self {
            Self::MySql => format!(
                "{insert} ON DUPLICATE KEY UPDATE payload = VALUES(payload), checksum = VALUES(checksum), \
                 modified_at_ms = VALUES(modified_at_ms), size_bytes = VALUES(size_bytes)"
            ),
            _ => format!(
                "{insert} ON CONFLICT(object_key) DO UPDATE SET payload = excluded.payload, \
                 checksum = excluded.checksum, modified_at_ms = excluded.modified_at_ms, \
                 size_bytes = excluded.size_bytes"
            ),
        }
    }
}

pub struct SqlBackend {
    id: BackendId,
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlBackend {
    /// Connect with startup retry and create the table if needed.
    pub async fn connect(id: impl Into<BackendId>, url: &str) -> Result<Self, BackendError> {
        install_drivers();
        let id = id.into();
        let dialect = Dialect::from_url(url);
        let url = if dialect == Dialect::Sqlite && !url.contains("mode=") {
            if url.contains('?') { format!("{url}&mode=rwc") } else { format!("{url}?mode=rwc") }
        } else {
            url.to_string()
        };

        let pool = retry_backend("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if dialect == Dialect::Sqlite { 4 } else { 16 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(&url)
                .await
                .map_err(normalize)
        })
        .await?;

        let backend = Self { id, pool, dialect };
        if dialect == Dialect::Sqlite {
            backend.enable_wal_mode().await?;
        }
        backend.init_schema().await?;
        info!(backend = %backend.id, dialect = ?dialect, "SQL backend connected");
        Ok(backend)
    }

    async fn enable_wal_mode(&self) -> Result<(), BackendError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(normalize)?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(normalize)?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), BackendError> {
        let ddl = self.dialect.create_table();
        retry_backend("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(ddl).execute(&self.pool).await.map_err(normalize)?;
            Ok(())
        })
        .await
    }

    fn entry_from_row(row: &AnyRow, with_payload: bool) -> Result<ListEntry, BackendError> {
        let key = read_string(row, "object_key")?;
        let checksum = read_string(row, "checksum")?;
        let modified_ms: i64 = row.try_get("modified_at_ms").map_err(normalize)?;
        let size: i64 = row.try_get("size_bytes").map_err(normalize)?;
        let bytes = if with_payload {
            Some(row.try_get::<Vec<u8>, _>("payload").map_err(normalize)?)
        } else {
            None
        };
        Ok(ListEntry {
            key,
            checksum,
            modified_at: millis_to_datetime(modified_ms),
            size: size.max(0) as u64,
            bytes,
        })
    }
}

#[async_trait]
impl BackendAdapter for SqlBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    async fn store(&self, key: &str, payload: &Payload) -> Result<(), BackendError> {
        let sql = self.dialect.upsert();
        sqlx::query(&sql)
            .bind(key.to_string())
            .bind(payload.bytes.clone())
            .bind(payload.checksum.clone())
            .bind(payload.modified_at.timestamp_millis())
            .bind(payload.bytes.len() as i64)
            .execute(&self.pool)
            .await
            .map_err(normalize)?;
        debug!(backend = %self.id, key, "Stored object");
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Payload, BackendError> {
        let sql = format!(
            "SELECT payload, checksum, modified_at_ms FROM multistore_objects WHERE object_key = {}",
            self.dialect.ph(1)
        );
        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(normalize)?
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;

        let bytes: Vec<u8> = row.try_get("payload").map_err(normalize)?;
        let checksum = read_string(&row, "checksum")?;
        let modified_ms: i64 = row.try_get("modified_at_ms").map_err(normalize)?;
        Ok(Payload { bytes, modified_at: millis_to_datetime(modified_ms), checksum })
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ListEntry>, BackendError> {
        let columns = if filter.include_payload {
            "object_key, checksum, modified_at_ms, size_bytes, payload"
        } else {
            "object_key, checksum, modified_at_ms, size_bytes"
        };
        let mut sql = format!("SELECT {columns} FROM multistore_objects");
        if filter.prefix.is_some() {
            sql.push_str(&format!(" WHERE object_key LIKE {} ESCAPE '!'", self.dialect.ph(1)));
        }
        sql.push_str(" ORDER BY object_key");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(prefix) = &filter.prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        let rows = query.fetch_all(&self.pool).await.map_err(normalize)?;

        rows.iter()
            .map(|row| Self::entry_from_row(row, filter.include_payload))
            .collect()
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        let sql = format!("DELETE FROM multistore_objects WHERE object_key = {}", self.dialect.ph(1));
        let result = sqlx::query(&sql)
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .map_err(normalize)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn probe(&self) -> Result<HealthSample, BackendError> {
        let start = Instant::now();
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map_err(normalize)?;
        Ok(HealthSample { latency: start.elapsed() })
    }
}

fn read_string(row: &AnyRow, column: &str) -> Result<String, BackendError> {
    if let Ok(s) = row.try_get::<String, _>(column) {
        return Ok(s);
    }
    let bytes: Vec<u8> = row.try_get(column).map_err(normalize)?;
    String::from_utf8(bytes).map_err(|e| BackendError::Fatal(format!("column {column} is not UTF-8: {e}")))
}

fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '!') {
            out.push('!');
        }
        out.push(c);
    }
    out
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Map sqlx errors onto the normalized taxonomy.
fn normalize(err: sqlx::Error) -> BackendError {
    match &err {
        sqlx::Error::RowNotFound => BackendError::NotFound(err.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            BackendError::Unavailable(err.to_string())
        }
        sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => BackendError::Transient(err.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_lowercase();
            match code.as_str() {
                // MySQL access denied, Postgres invalid password / authorization
                "1045" | "28P01" | "28000" => BackendError::AuthError(err.to_string()),
                // MySQL deadlock / lock wait, Postgres deadlock / serialization, SQLite busy / locked
                "1213" | "1205" | "40P01" | "40001" | "5" | "6" => BackendError::Transient(err.to_string()),
                // SQLite full, MySQL table full, Postgres disk full / too many connections
                "13" | "1114" | "53100" | "53300" => BackendError::QuotaExceeded(err.to_string()),
                _ if message.contains("locked") || message.contains("busy") => {
                    BackendError::Transient(err.to_string())
                }
                _ => BackendError::Fatal(err.to_string()),
            }
        }
        _ => BackendError::Fatal(err.to_string()),
    }
}
