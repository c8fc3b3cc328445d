// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Multistore Sync
//!
//! Keeps one logical business record durable and eventually consistent
//! across several independent storage backends, without silently losing a
//! write.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Storage Orchestrator                     │
//! │  • put / get / search / put_artifact with caller deadlines  │
//! │  • concurrent fan-out to every reachable backend            │
//! │  • unreachable or failed targets → one queued operation     │
//! └─────────────────────────────────────────────────────────────┘
//!            │                    │                    ▲
//!            ▼                    ▼                    │ status
//! ┌────────────────────┐ ┌────────────────────┐ ┌─────────────────┐
//! │  Backend Adapters  │ │  Operation Queue   │ │ Health Monitor  │
//! │  SQL, Redis, files │ │  dedup, priority,  │ │ probes, alerts, │
//! │  normalized errors │ │  dead-letter, JSON │ │ integrity check │
//! └────────────────────┘ └────────────────────┘ └─────────────────┘
//!                                 │                    │ recovering
//!                                 ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sync Engine                          │
//! │  • drains the queue with backoff, dead-letters exhausted ops│
//! │  • reconciles primary ↔ fallback, last write wins           │
//! │  • equal timestamps → unresolved conflict for an operator   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use multistore_sync::{BusinessRecord, LineItem, ServiceConfig, StorageService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::from_toml_str(r#"
//!         [[backends]]
//!         id = "primary"
//!         role = "primary"
//!         kind = "sql"
//!         url = "sqlite://records.db?mode=rwc"
//!
//!         [[backends]]
//!         id = "local"
//!         role = "fallback"
//!         kind = "filesystem"
//!         root = "./fallback"
//!     "#)?;
//!
//!     let service = StorageService::from_config(config).await?;
//!     service.start().await?;
//!
//!     let mut record = BusinessRecord::new("Q-2025-0001");
//!     record.line_items.push(LineItem::new("Pump housing", 2.0, 140.0));
//!     let outcome = service.put(&record).await?;
//!     println!("accepted by {:?}", outcome.accepted);
//!
//!     let read = service.get("Q-2025-0001").await?;
//!     println!("read from {}", read.source);
//!
//!     service.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: adapter contract and the SQL, Redis, filesystem and memory adapters
//! - [`health`]: per-backend state machine, rate-limited alerts, integrity check
//! - [`orchestrator`]: the write/read/search entry point
//! - [`queue`]: durable operation queue and dead-letter log
//! - [`sync`]: queue drain, reconciliation, conflict log
//! - [`watcher`]: ingest of files added to the archive by hand
//! - [`service`]: wiring, workers and lifecycle

pub mod backend;
pub mod config;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod record;
pub mod resilience;
pub mod service;
pub mod sync;
pub mod watcher;

pub use backend::{
    BackendAdapter, BackendError, BackendId, BackendRegistry, BackendRole, ErrorKind, Payload,
    RegisteredBackend,
};
pub use config::{BackendConfig, BackendKind, ConfigError, ServiceConfig};
pub use health::{Alert, AlertCondition, HealthStatus, IntegrityReport, Severity};
pub use metrics::LatencyTimer;
pub use orchestrator::{OrchestratorError, PutOutcome, ReadOutcome, SearchPage, SearchQuery};
pub use queue::{DeadLetter, OperationKind, OperationRecord, Priority};
pub use record::{Artifact, BusinessRecord, GeneralInfo, LineItem};
pub use resilience::retry::RetryConfig;
pub use service::{ServiceError, ServiceState, StorageService, SystemStatus};
pub use sync::{ConflictPick, ConflictRecord, ReconcileReport, SyncError};
