// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Telemetry Ingest CLI
//!
//! Queries the ingest database and runs a loopback outage/backfill
//! simulation.
//!
//! # Usage
//!
//! ```bash
//! # Per-stream ack watermarks
//! hdds-ingest --db hdds_ingest.db watermarks
//!
//! # Stored records of one stream
//! hdds-ingest samples node-7 rain_gauge --from 100 --limit 20
//!
//! # Simulate a 60-sample outage and watch the backlog drain
//! hdds-ingest simulate --outage 60
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hdds_ingest::{IngestConfig, IngestService, SqliteStore, TelemetryStore};
use hdds_spool::{LinkState, LoopbackBroker, NodeConfig, NodeHandle, NodeRuntime, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long the simulation waits for the backlog to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "hdds-ingest")]
#[command(about = "HDDS Telemetry Ingest - idempotent storage with ack watermarks", long_about = None)]
#[command(version)]
struct Args {
    /// Database path (SQLite file)
    #[arg(short, long, default_value = "hdds_ingest.db")]
    db: PathBuf,

    /// Configuration file (TOML); overrides --db
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List per-stream ack watermarks
    Watermarks,
    /// Show per-stream totals
    Stats,
    /// Print stored records of a stream
    Samples {
        node: String,
        stream: String,

        /// First seq to print
        #[arg(long, default_value_t = 1)]
        from: u64,

        /// Maximum records to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print change-of-value transitions of a flag/state stream
    Transitions { node: String, stream: String },
    /// Run a node and the ingest service over a loopback broker
    Simulate {
        /// Node identity
        #[arg(long, default_value = "sim-node")]
        node: String,

        /// Spool root of the simulated node
        #[arg(long, default_value = "hdds_spool_sim")]
        spool_dir: PathBuf,

        /// Samples recorded before the outage
        #[arg(long, default_value_t = 20)]
        before: u32,

        /// Samples recorded while the link is down
        #[arg(long, default_value_t = 60)]
        outage: u32,

        /// Samples recorded after the link comes back
        #[arg(long, default_value_t = 20)]
        after: u32,

        /// Sampling interval in milliseconds
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => IngestConfig::new(&args.db),
    };
    let store = SqliteStore::new(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;

    match args.command {
        Commands::Simulate {
            node,
            spool_dir,
            before,
            outage,
            after,
            interval_ms,
        } => {
            let plan = SimulationPlan {
                node_id: node,
                spool_dir,
                before,
                outage,
                after,
                interval: Duration::from_millis(interval_ms),
            };
            simulate(config, store, plan).await
        }
        cmd => handle_command(cmd, &store),
    }
}

fn format_ns(ns: u64) -> String {
    let secs = (ns / 1_000_000_000) as i64;
    let nanos = (ns % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ns.to_string())
}

fn handle_command(cmd: Commands, store: &SqliteStore) -> Result<()> {
    match cmd {
        Commands::Watermarks => {
            let rows = store.watermarks()?;
            println!("{} stream watermarks:", rows.len());
            for row in &rows {
                println!(
                    "  {}/{} acked={} committed={}",
                    row.node_id,
                    row.stream_id,
                    row.acked_seq,
                    format_ns(row.committed_at_ns)
                );
            }
        }
        Commands::Stats => {
            for stats in store.stream_stats()? {
                println!(
                    "  {}/{}: {} samples, seq {}..={}, acked {}",
                    stats.node_id,
                    stats.stream_id,
                    stats.samples,
                    stats.min_seq,
                    stats.max_seq,
                    stats.acked_seq
                );
            }
        }
        Commands::Samples {
            node,
            stream,
            from,
            limit,
        } => {
            let records = store.samples(&node, &stream, from, limit)?;
            println!("{} records of {}/{} from seq {}:", records.len(), node, stream, from);
            for record in &records {
                println!(
                    "  seq={} t={} {:?}",
                    record.seq,
                    format_ns(record.sample_time_ns),
                    record.value
                );
            }
        }
        Commands::Transitions { node, stream } => {
            for t in store.transitions(&node, &stream)? {
                println!(
                    "  seq={} t={} {:?} -> {:?}",
                    t.seq,
                    format_ns(t.sample_time_ns),
                    t.from,
                    t.to
                );
            }
        }
        Commands::Simulate { .. } => anyhow::bail!("simulate is not a query command"),
    }
    Ok(())
}

struct SimulationPlan {
    node_id: String,
    spool_dir: PathBuf,
    before: u32,
    outage: u32,
    after: u32,
    interval: Duration,
}

async fn simulate(config: IngestConfig, store: SqliteStore, plan: SimulationPlan) -> Result<()> {
    let broker = LoopbackBroker::new();
    let service = Arc::new(IngestService::new(
        config,
        Arc::new(store),
        Arc::new(broker.client("ingest")),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingest = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run(shutdown_rx).await })
    };

    let (interrupt_tx, interrupted) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping simulation...");
            let _ = interrupt_tx.send(true);
        }
    });

    let mut node_config = NodeConfig::new(&plan.node_id, &plan.spool_dir);
    node_config.heartbeat_interval_secs = 1;
    let link = broker.client(&plan.node_id);
    let (producer, node) = NodeRuntime::start(node_config, Arc::new(link.clone()))?;

    let mut total_rain = 0u64;
    let phases = [
        (LinkState::Up, plan.before),
        (LinkState::Down, plan.outage),
        (LinkState::Up, plan.after),
    ];
    'phases: for (state, count) in phases {
        link.set_link(state);
        tracing::info!("Link {:?}: recording {} samples", state, count);
        for i in 0..count {
            if *interrupted.borrow() {
                // Leave the link up so the backlog can still drain.
                link.set_link(LinkState::Up);
                break 'phases;
            }
            producer.record("rain_gauge", Value::Counter(1))?;
            producer.record("temperature", Value::Float(20.0 + f64::from(i % 10) * 0.1))?;
            total_rain += 1;
            tokio::time::sleep(plan.interval).await;
        }
    }

    wait_for_drain(&node, DRAIN_TIMEOUT, &interrupted).await;

    println!("{}", serde_json::to_string_pretty(&node.health())?);
    println!("{}", serde_json::to_string_pretty(&service.liveness())?);
    let stored = service
        .consumer()
        .store()
        .counter_total(&plan.node_id, "rain_gauge")?;
    println!("rain_gauge: recorded {}, stored total {}", total_rain, stored);

    node.shutdown().await?;
    let _ = shutdown_tx.send(true);
    ingest.await??;
    Ok(())
}

/// Wait for the node's backlog to drain; returns the records still pending.
async fn wait_for_drain(
    node: &NodeHandle,
    timeout: Duration,
    interrupted: &watch::Receiver<bool>,
) -> u64 {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let backlog = node.health().total_backlog();
        if backlog == 0 {
            return 0;
        }
        if *interrupted.borrow() {
            tracing::warn!("Interrupted with {} records left", backlog);
            return backlog;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("Backlog not drained: {} records left", backlog);
            return backlog;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
