// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hdds-spool - Inspect and repair field-node spools.
//!
//! Usage:
//!   hdds-spool inspect /var/lib/hdds/spool
//!   hdds-spool dump /var/lib/hdds/spool/rain_gauge --from 120
//!   hdds-spool recover /var/lib/hdds/spool/rain_gauge --node node-7

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hdds_spool::ack::load_watermark;
use hdds_spool::segment::{list_segments, open_frames, SegmentHeader};
use hdds_spool::spool::stream_id_from_dir_name;
use hdds_spool::{ScanStop, Spool, SpoolConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hdds-spool")]
#[command(about = "Inspect and repair HDDS telemetry spools")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show segments and watermarks (read-only)
    Inspect {
        /// Spool root or a single stream directory
        dir: PathBuf,
    },
    /// Print the records of a stream directory
    Dump {
        /// Stream directory
        dir: PathBuf,

        /// First seq to print
        #[arg(long, default_value_t = 1)]
        from: u64,

        /// Maximum records to print (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Run crash recovery on a stream directory (truncates torn tails)
    Recover {
        /// Stream directory
        dir: PathBuf,

        /// Node identity owning the spool
        #[arg(long)]
        node: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Commands::Inspect { dir } => inspect(&dir),
        Commands::Dump {
            dir,
            from,
            limit,
            json,
        } => dump(&dir, from, limit, json),
        Commands::Recover { dir, node } => recover(&dir, &node),
    }
}

fn format_ns(ns: u64) -> String {
    let secs = (ns / 1_000_000_000) as i64;
    let nanos = (ns % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ns.to_string())
}

fn stream_id_of(dir: &Path) -> Result<String> {
    dir.file_name()
        .and_then(|n| n.to_str())
        .and_then(stream_id_from_dir_name)
        .with_context(|| format!("{} is not a stream directory", dir.display()))
}

fn stream_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !list_segments(root)?.is_empty() || root.join("acked.json").exists() {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn inspect(root: &Path) -> Result<()> {
    let dirs = stream_dirs(root)?;
    if dirs.is_empty() {
        println!("No streams under {}", root.display());
        return Ok(());
    }

    for dir in dirs {
        let stream_id = stream_id_of(&dir).unwrap_or_else(|_| dir.display().to_string());
        println!("Stream {}", stream_id);

        match load_watermark(&dir)? {
            Some(w) => println!(
                "  acked_seq: {} (node {}, committed {})",
                w.acked_seq,
                w.node_id,
                format_ns(w.committed_at_ns)
            ),
            None => println!("  acked_seq: 0 (no watermark)"),
        }

        let segments = list_segments(&dir)?;
        println!("  segments: {}", segments.len());
        for (first_seq, path) in segments {
            let header = SegmentHeader::read(&mut BufReader::new(File::open(&path)?))
                .with_context(|| format!("Bad header in {}", path.display()))?;
            let size = std::fs::metadata(&path)?.len();

            let mut scanner = open_frames(&path)?;
            let mut count = 0u64;
            let mut last = None;
            for frame in scanner.by_ref() {
                count += 1;
                last = Some(frame.seq());
            }
            let status = match scanner.stop() {
                Some(ScanStop::Footer { .. }) => "sealed".to_string(),
                Some(ScanStop::End) | None => "open".to_string(),
                Some(ScanStop::TornTail { offset }) => format!("torn tail at {}", offset),
                Some(ScanStop::Corrupt { offset, reason }) => {
                    format!("CORRUPT at {}: {}", offset, reason)
                }
                Some(ScanStop::Io(e)) => format!("read error: {}", e),
            };
            let range = match last {
                Some(last) => format!("{}..={}", first_seq, last),
                None => format!("{} (empty)", first_seq),
            };
            println!(
                "  {:<24} seq {:<20} frames {:<6} {:>10} bytes  created {}  {}",
                path.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
                range,
                count,
                size,
                format_ns(header.created_at_ns),
                status
            );
        }
    }
    Ok(())
}

fn dump(dir: &Path, from: u64, limit: usize, json: bool) -> Result<()> {
    let segments = list_segments(dir)?;
    if segments.is_empty() {
        bail!("No segments in {}", dir.display());
    }

    let mut printed = 0usize;
    for (_, path) in segments {
        let mut scanner = open_frames(&path)?;
        for frame in scanner.by_ref() {
            if frame.seq() < from {
                continue;
            }
            let record = frame.into_record();
            if json {
                println!("{}", serde_json::to_string(&record)?);
            } else {
                println!(
                    "{:>10}  {}  {}/{}  {:?}",
                    record.seq,
                    format_ns(record.sample_time_ns),
                    record.node_id,
                    record.stream_id,
                    record.value
                );
            }
            printed += 1;
            if limit > 0 && printed >= limit {
                return Ok(());
            }
        }
        if let Some(ScanStop::Corrupt { offset, reason }) = scanner.stop() {
            bail!("{} corrupt at offset {}: {}", path.display(), offset, reason);
        }
    }
    Ok(())
}

fn recover(dir: &Path, node: &str) -> Result<()> {
    let stream_id = stream_id_of(dir)?;
    let config = SpoolConfig::new(dir.parent().unwrap_or(dir));
    let spool = Spool::open_at(dir, &config, node, &stream_id)
        .with_context(|| format!("Recovery of {} failed", dir.display()))?;

    let health = spool.health();
    info!(
        "Recovered {}: oldest {}, acked {}, next {}, {} segments ({} bytes)",
        stream_id,
        health.oldest_retained_seq,
        health.acked_seq,
        health.next_seq,
        health.segment_count,
        health.total_bytes
    );
    println!("{}", serde_json::to_string_pretty(&health)?);
    spool.close()?;
    Ok(())
}
