//! Basic change capture example
//!
//! This example demonstrates how to:
//! - Load a capture configuration from TOML or the standard `PG*` variables
//! - Snapshot the configured tables before streaming
//! - Print every captured change
//! - Acknowledge positions once a batch has been handled
//!
//! ## Prerequisites
//!
//! 1. PostgreSQL server with logical decoding enabled in postgresql.conf:
//!    ```text
//!    wal_level = logical
//!    max_replication_slots = 4
//!    max_wal_senders = 4
//!    ```
//! 2. The `wal2json` output plugin installed on the server
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example basic_capture -- capture.toml
//! # or
//! PGHOST=localhost PGUSER=postgres PGPASSWORD=postgres PGDATABASE=shop \
//!     CAPTURE_TABLES=orders,customers cargo run --example basic_capture
//! ```

use pg_capture::{Capture, CaptureConfig, ChangeBatch, ColumnValue, TypeConverter};
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn config_from_env() -> CaptureConfig {
    let var = |name: &str, default: &str| env::var(name).unwrap_or_else(|_| default.to_string());

    CaptureConfig {
        host: var("PGHOST", "localhost"),
        port: var("PGPORT", "5432").parse().unwrap_or(5432),
        user: var("PGUSER", "postgres"),
        password: var("PGPASSWORD", "postgres"),
        database: var("PGDATABASE", "postgres"),
        schema: var("CAPTURE_SCHEMA", "public"),
        tables: var("CAPTURE_TABLES", "orders")
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        slot_name: var("CAPTURE_SLOT", "example_capture"),
        stream_old_data: true,
        ..Default::default()
    }
}

fn print_batch(batch: &ChangeBatch, converter: &TypeConverter) {
    match batch.position {
        Some(position) if batch.is_heartbeat() => info!("Snapshot complete, streaming from {}", position),
        Some(position) => info!("Batch of {} changes at {}", batch.len(), position),
        None => info!("Snapshot page of {} rows", batch.len()),
    }

    for record in &batch.records {
        let columns: Vec<String> = record
            .column_names
            .iter()
            .zip(&record.column_types)
            .zip(&record.column_values)
            .map(|((name, ty), value)| {
                let rendered = converter
                    .convert(ty, value)
                    .map(|v: ColumnValue| v.render())
                    .unwrap_or_else(|e| format!("<{e}>"));
                format!("{name}={rendered}")
            })
            .collect();
        println!("{:?} {}: {}", record.kind, record.full_table_name(), columns.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = match env::args().nth(1) {
        Some(path) => CaptureConfig::from_file(path)?,
        None => config_from_env(),
    };
    let converter = TypeConverter::new(config.time_zone_offset()?);

    let capture = Capture::new(config)?;
    let handle = capture.handle();

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping capture...");
            stopper.stop();
        }
    });

    info!("Capturing changes... (Press Ctrl+C to stop)");

    let result = capture
        .run(move |batch| {
            let handle = handle.clone();
            print_batch(&batch, &converter);
            async move {
                if let Some(position) = batch.position {
                    if let Err(e) = handle.acknowledge(position).await {
                        warn!("Acknowledging {} failed: {}", position, e);
                    }
                }
                Ok(())
            }
        })
        .await;

    match result {
        Ok(()) => info!("Capture stopped"),
        Err(e) => {
            error!("Capture failed: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}
