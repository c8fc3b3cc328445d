// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic multistore-sync usage example.
//!
//! Demonstrates:
//! 1. Building a service from TOML (SQLite primary, filesystem fallback and archive)
//! 2. Writing a few quotations and reading one back
//! 3. Storing a rendered PDF as an artifact
//! 4. Searching across the stores
//! 5. Reconciling and printing the system status
//! 6. Clean shutdown
//!
//! Everything lives in a temporary directory, so no infrastructure is needed.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::time::Duration;

use multistore_sync::{Artifact, BusinessRecord, LineItem, SearchQuery, ServiceConfig, StorageService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           multistore-sync: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the service
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let root = dir.path().display();
    let config = ServiceConfig::from_toml_str(&format!(
        r#"
        put_deadline_ms = 5000

        [[backends]]
        id = "sqlite"
        role = "primary"
        kind = "sql"
        url = "sqlite://{root}/records.db?mode=rwc"

        [[backends]]
        id = "local"
        role = "fallback"
        kind = "filesystem"
        root = '{root}/fallback'

        [[backends]]
        id = "share"
        role = "archival"
        kind = "filesystem"
        root = '{root}/archive'

        [sync]
        drain_interval_ms = 500
        state_dir = '{root}/state'
        "#
    ))?;

    let service = StorageService::from_config(config).await?;
    println!("📦 State: {}", service.state());
    service.start().await?;
    println!("🚀 State: {}\n", service.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write and read records
    // ─────────────────────────────────────────────────────────────────────────
    let projects = [
        ("Q-2025-0001", "Pump station refit", "Pump housing"),
        ("Q-2025-0002", "Conveyor upgrade", "Drive belt"),
        ("Q-2025-0003", "Valve replacement", "Gate valve DN100"),
    ];
    for (key, project, line) in projects {
        let mut record = BusinessRecord::new(key);
        record.general.client = Some("Acme Industrial".into());
        record.general.project = Some(project.into());
        record.general.currency = Some("EUR".into());
        record.line_items.push(LineItem::new(line, 2.0, 140.0));
        record.conditions.insert("payment".into(), "30 days net".into());

        let outcome = service.put(&record).await?;
        println!("✍️  {key}: accepted by {:?}, queued for {:?}", outcome.accepted, outcome.queued);
    }

    let read = service.get("Q-2025-0002").await?;
    println!(
        "\n📖 Read {} from {} (project: {:?}, total: {:.2})",
        read.value.key,
        read.source,
        read.value.general.project,
        read.value.total()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Artifacts
    // ─────────────────────────────────────────────────────────────────────────
    let pdf = Artifact::new("Q-2025-0002", read.value.revision, b"%PDF-1.7 demo".to_vec());
    let outcome = service.put_artifact(&pdf).await?;
    println!("📄 Artifact {} stored on {:?}", pdf.storage_key(), outcome.accepted);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Search
    // ─────────────────────────────────────────────────────────────────────────
    let page = service.search(&SearchQuery::text("valve pump"), 1, 10).await;
    println!("\n🔎 Search 'valve pump': {} hit(s)", page.total);
    for hit in &page.hits {
        println!("   {} (score {}, from {})", hit.record.key, hit.score, hit.source);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Reconcile and status
    // ─────────────────────────────────────────────────────────────────────────
    let report = service.reconcile_now().await;
    println!(
        "\n🔄 Reconciled {} key(s): {} consistent, {} copied",
        report.scanned,
        report.consistent,
        report.copied()
    );

    let status = service.system_status().await;
    println!("\n📊 System status (converged: {})", status.is_converged());
    println!("{}", serde_json::to_string_pretty(&status)?);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    let clean = service.shutdown(Duration::from_secs(5)).await;
    println!("\n🛑 State: {} (clean: {clean})", service.state());
    Ok(())
}
