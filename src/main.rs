//! # notesync CLI
//!
//! ```bash
//! notesync --config ./config/notesync.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `notesync init` | Create the SQLite database and run schema migrations |
//! | `notesync run` | Run every consumer group and sweep job until Ctrl-C |
//! | `notesync sweep --cadence minor --index note` | Run one reconciliation sweep now |
//! | `notesync decode <file>` | Decode a CDC envelope and print the snapshot and hashes |
//! | `notesync publish --topic T <file>` | Append a file's bytes to a topic |
//! | `notesync dlq list <topic>` | Show dead letters of a topic |
//! | `notesync dlq replay <topic>` | Republish dead letters to their original topic |
//! | `notesync hash <file>` | Hash a snapshot JSON file |
//!
//! Logging goes to stderr and is controlled by `NOTESYNC_LOG` (an
//! `EnvFilter` directive, default `info`).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use notesync::app::Engine;
use notesync::config::{self, Config};
use notesync::sqlite_broker::SqliteBroker;
use notesync::{db, dlq, migrate};
use notesync_core::broker::MessageBroker;
use notesync_core::decode::Decoder;
use notesync_core::hash::compute_hash;
use notesync_core::projection;
use notesync_core::{Cadence, IndexKind, NoteSnapshot};

/// notesync: keeps a search index consistent with a note store.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/notesync.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "notesync", version, about = "CDC and reconciliation sync between a note store and a search index")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/notesync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run all consumer groups and scheduled sweeps until interrupted.
    Run,

    /// Run one reconciliation sweep immediately.
    Sweep {
        /// `minor` or `major`.
        #[arg(long)]
        cadence: Cadence,

        /// `note` or `field`.
        #[arg(long)]
        index: IndexKind,

        /// Anchor instant (RFC 3339). Defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Decode a CDC envelope file and print the resulting snapshot.
    Decode {
        file: PathBuf,
    },

    /// Publish a file's contents to a topic.
    Publish {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        key: Option<String>,

        file: PathBuf,
    },

    /// Inspect or replay dead letters.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Print content hashes of a snapshot JSON file.
    Hash {
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead letters of `<topic>.dlq`.
    List { topic: String },
    /// Republish not-yet-replayed dead letters to their original topic.
    Replay { topic: String },
}

fn init_tracing() {
    let env = std::env::var("NOTESYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Hash { file } = &cli.command {
        return run_hash(file);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run => {
            let engine = Engine::open(cfg).await?;
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    let _ = tx.send(true);
                }
            });
            engine.run(rx).await?;
        }
        Commands::Sweep {
            cadence,
            index,
            at,
            batch_size,
        } => {
            let batch_size = batch_size.unwrap_or(cfg.sink.job(index, cadence).batch_size);
            let engine = Engine::open(cfg).await?;
            let report = engine
                .sweeper()
                .sweep(cadence, index, at.unwrap_or_else(Utc::now), batch_size, None)
                .await?;
            println!("sweep {}/{}", index, cadence);
            println!("  window: {}", report.window);
            println!("  batches: {} ({} failed)", report.batches, report.failed_batches);
            println!("  candidates: {}", report.totals.candidates);
            println!("  written: {}", report.totals.written);
            println!("  removed: {}", report.totals.removed);
            println!("  unchanged: {}", report.totals.unchanged);
            println!("  stale: {}", report.totals.stale);
            if cadence == Cadence::Major {
                println!(
                    "  ledger: {} entries, {} orphaned, {} removed, {} pruned",
                    report.audit.entries,
                    report.audit.orphaned,
                    report.audit.removed,
                    report.audit.pruned
                );
            }
        }
        Commands::Decode { file } => {
            run_decode(&cfg, &file)?;
        }
        Commands::Publish { topic, key, file } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let broker = open_broker(&cfg).await?;
            let offset = broker.publish(&topic, key.as_deref(), &payload).await?;
            println!("published {}#{}", topic, offset);
        }
        Commands::Dlq { action } => {
            let broker = open_broker(&cfg).await?;
            match action {
                DlqAction::List { topic } => {
                    let records = dlq::list(&broker, &topic).await?;
                    if records.is_empty() {
                        println!("no dead letters for {}", topic);
                    }
                    for (offset, r) in records {
                        println!(
                            "{}  {}#{}  group={}  failed_at={}  reason={}",
                            offset,
                            r.original_topic,
                            r.original_offset,
                            r.consumer_group,
                            r.failed_at.to_rfc3339(),
                            r.failure_reason
                        );
                    }
                }
                DlqAction::Replay { topic } => {
                    let report = dlq::replay(&broker, &topic).await?;
                    println!("replayed: {}", report.replayed);
                    println!("skipped: {}", report.skipped);
                }
            }
        }
        Commands::Hash { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

async fn open_broker(cfg: &Config) -> Result<SqliteBroker> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteBroker::new(pool))
}

fn print_hashes(snapshot: &NoteSnapshot) -> Result<()> {
    println!("content: {}", compute_hash(snapshot)?);
    for index in IndexKind::ALL {
        println!("{}: {}", index, projection::content_hash(index, snapshot)?);
    }
    Ok(())
}

fn run_decode(cfg: &Config, file: &Path) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let decoder = Decoder::new(cfg.decoder.offset()?);
    let change = decoder.decode(&raw)?;
    println!("op: {}", change.op.code());
    if let Some(ts) = change.source_ts {
        println!("source_ts: {}", ts.to_rfc3339());
    }
    println!("{}", serde_json::to_string_pretty(&change.snapshot)?);
    print_hashes(&change.snapshot)
}

fn run_hash(file: &Path) -> Result<()> {
    let raw =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let snapshot: NoteSnapshot =
        serde_json::from_str(&raw).context("file is not a note snapshot")?;
    print_hashes(&snapshot)
}
