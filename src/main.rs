//! # casechunk CLI
//!
//! Operator interface for the chunked OCR pipeline.
//!
//! ## Usage
//!
//! ```bash
//! casechunk --config ./config/casechunk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `casechunk init` | Create the SQLite database and schema |
//! | `casechunk ingest <pdf> --matter <id>` | Upload a PDF as a new document |
//! | `casechunk process <doc>` | Drive a document through split, OCR and merge |
//! | `casechunk status [<doc>]` | Document overview, or one document's chunk progress |
//! | `casechunk retry <doc> --stage <stage>` | Retry a failed document from a stage |
//! | `casechunk stuck` | List stuck documents and chunks |
//! | `casechunk reset --document <id>` | Reset a stuck document (or `--chunk <id>`) |
//! | `casechunk validate <doc>` | Run the integrity check |
//! | `casechunk sweep` | Purge chunks past the retention window |
//! | `casechunk orphans` | Find and reclaim orphaned chunk objects |
//! | `casechunk serve` | Start the admin HTTP server and timers |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use casechunk::config::{self, Config};
use casechunk::migrate;
use casechunk::pipeline::{Pipeline, Stage};
use casechunk::progress::ProgressMode;
use casechunk::status;
use casechunk::{server, unix_now};

/// casechunk: split oversized legal PDFs into page ranges, OCR them in
/// parallel and merge the results back into one document record.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/casechunk.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "casechunk", version, about = "Chunked OCR pipeline for oversized legal PDFs")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/casechunk.toml")]
    config: PathBuf,

    /// Progress output on stderr: `human`, `json` or `off`.
    /// Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s).ok_or_else(|| format!("expected human, json or off, got '{}'", s))
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Upload a PDF as a new document in `uploaded` status.
    Ingest {
        /// Path to the PDF.
        pdf: PathBuf,

        /// Matter (case) the document belongs to.
        #[arg(long)]
        matter: String,

        /// Run the pipeline right away.
        #[arg(long)]
        process: bool,
    },

    /// Drive a document through split, OCR and merge.
    ///
    /// Picks up from the document's current status. A document already
    /// complete, failed, or mid-stage elsewhere is left alone.
    Process {
        /// Document id.
        document: String,
    },

    /// Show document status.
    ///
    /// Without an id, lists all documents newest first. With an id, shows
    /// per-chunk progress, failed page ranges and their errors.
    Status {
        /// Document id.
        document: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Retry an `ocr_failed` document from a stage.
    Retry {
        /// Document id.
        document: String,

        /// `split` re-splits from scratch, `ocr` requeues failed chunks only,
        /// `merge` re-merges the existing results.
        #[arg(long, value_enum, default_value = "ocr")]
        stage: Stage,
    },

    /// List documents and chunks with no progress past the stuck threshold.
    Stuck {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Reset a stuck document or chunk so it can be processed again.
    ///
    /// Only work idle past the stuck threshold is touched; completed
    /// chunks are kept.
    #[command(group(ArgGroup::new("target").required(true).args(["document", "chunk"])))]
    Reset {
        #[arg(long)]
        document: Option<String>,

        #[arg(long)]
        chunk: Option<String>,
    },

    /// Check bbox references and chunk links of a document.
    ///
    /// Exits non-zero when the report is unhealthy.
    Validate {
        /// Document id.
        document: String,
    },

    /// Purge chunk rows and objects of terminal documents past retention.
    Sweep,

    /// Find chunk objects no chunk row accounts for.
    ///
    /// Orphans older than the retention window are deleted.
    Orphans,

    /// Start the admin HTTP server with the retention and stuck-job timers.
    Serve,
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(if matches!(cli.command, Commands::Serve) {
        "info"
    } else {
        "warn"
    });

    let cfg: Config = config::load_config(&cli.config)?;
    migrate::run_migrations(&cfg).await?;

    if let Commands::Init = cli.command {
        println!("Database initialized at {}", cfg.db.path.display());
        return Ok(());
    }

    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let pipeline = Arc::new(Pipeline::open(&cfg, progress.reporter()).await?);
    let now = unix_now();

    match cli.command {
        Commands::Init => {}
        Commands::Ingest {
            pdf,
            matter,
            process,
        } => {
            let bytes = std::fs::read(&pdf)
                .with_context(|| format!("Failed to read {}", pdf.display()))?;
            let doc = pipeline.ingest(bytes, &matter).await?;
            println!("{}  {} pages  {}", doc.id, doc.total_pages, doc.status);
            if process {
                let doc = pipeline.process(&doc.id).await?;
                println!("{}  {}", doc.id, doc.status);
            }
        }
        Commands::Process { document } => {
            let doc = pipeline.process(&document).await?;
            println!("{}  {}", doc.id, doc.status);
            if let Some(err) = &doc.last_error {
                println!("  {}", err);
            }
        }
        Commands::Status { document, json } => match document {
            Some(id) => {
                let view = status::document_view(pipeline.store().as_ref(), &id)
                    .await?
                    .with_context(|| format!("document {} not found", id))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&view)?);
                } else {
                    status::print_document(&view, now);
                }
            }
            None => {
                let docs = pipeline.store().list_documents(None).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&docs)?);
                } else {
                    status::print_overview(&docs, now);
                }
            }
        },
        Commands::Retry { document, stage } => {
            let doc = pipeline.retry(&document, stage).await?;
            println!("{}  {}", doc.id, doc.status);
        }
        Commands::Stuck { json } => {
            let report = pipeline.monitor().find_stuck(now).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                status::print_stuck(&report, now);
            }
        }
        Commands::Reset { document, chunk } => {
            if let Some(id) = document {
                let outcome = pipeline.reset_document(&id).await?;
                println!(
                    "{}  {} chunk(s) reset{}",
                    id,
                    outcome.chunks_reset,
                    if outcome.documents.is_empty() {
                        ""
                    } else {
                        ", document rolled back"
                    }
                );
            } else if let Some(id) = chunk {
                if pipeline.reset_chunk(&id).await? {
                    println!("{}  reset to pending", id);
                } else {
                    println!("{}  not stuck, left alone", id);
                }
            }
        }
        Commands::Validate { document } => {
            let report = pipeline.validate(&document).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy {
                bail!("document {} failed the integrity check", document);
            }
        }
        Commands::Sweep => {
            let report = pipeline.cleanup().sweep_retention(now).await?;
            println!(
                "Swept {} document(s): {} object(s), {} row(s) deleted, {} error(s)",
                report.documents,
                report.objects_deleted,
                report.rows_deleted,
                report.errors.len()
            );
        }
        Commands::Orphans => {
            let report = pipeline.cleanup().detect_orphans(now).await?;
            for key in &report.orphans {
                println!("  {}", key);
            }
            println!(
                "{} orphan(s), {} deleted, {} error(s)",
                report.orphans.len(),
                report.objects_deleted,
                report.errors.len()
            );
        }
        Commands::Serve => {
            server::run_server(&cfg, pipeline).await?;
        }
    }

    Ok(())
}
