//! # Campus KB CLI (`kb`)
//!
//! The `kb` binary builds and queries a knowledge base of one institutional
//! website: it refreshes pages and PDFs into a deduplicated store and returns
//! token-budgeted excerpts for prompts.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and schema |
//! | `kb refresh [--full]` | Run one refresh against the site |
//! | `kb schedule` | Refresh whenever the store goes stale, until Ctrl-C |
//! | `kb retrieve "<query>"` | Print budgeted excerpts for a query |
//! | `kb list` | List active entries |
//! | `kb get <id>` | Print one entry in full |
//! | `kb load <dir>` | Load manual content from a directory |
//! | `kb compact` | Erase long-inactive entries |
//! | `kb stats` | Entry counts and last refresh |
//! | `kb serve` | Start the HTTP API and the refresh timer |
//!
//! Log verbosity follows `RUST_LOG` (default `campus_kb=info`); logs go to
//! stderr so command output stays machine-readable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use campus_kb::models::SourceType;
use campus_kb::{config, get, manual, migrate, retrieve, scheduler, server, stats};

/// Campus KB: a deduplicated knowledge base of one website, with
/// token-budgeted retrieval for LLM prompts.
#[derive(Parser)]
#[command(name = "kb", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Fetch every source once and update the store.
    Refresh {
        /// Refetch sources even if they were confirmed recently.
        #[arg(long)]
        full: bool,
    },

    /// Run the refresh timer in the foreground.
    Schedule,

    /// Retrieve excerpts relevant to a query within a token budget.
    Retrieve {
        query: String,

        /// Token budget (defaults to `[retrieval] token_budget`).
        #[arg(long)]
        budget: Option<usize>,

        /// Print the full retrieval outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List active entries.
    List {
        /// Only entries of this type: page, pdf, or manual.
        #[arg(long)]
        source_type: Option<SourceType>,

        /// Only entries whose source URL starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print one entry by id, active or not.
    Get { id: String },

    /// Load `.txt`, `.md`, `.pdf` and `.json` files as manual entries.
    Load { dir: PathBuf },

    /// Erase entries inactive for longer than the retention window.
    Compact {
        /// Overrides `[store] retention_days`.
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Show knowledge-base statistics.
    Stats,

    /// Start the HTTP API with the refresh timer running alongside.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("campus_kb=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Refresh { full } => {
            scheduler::run_refresh(&cfg, full).await?;
        }
        Commands::Schedule => {
            scheduler::run_schedule(&cfg).await?;
        }
        Commands::Retrieve {
            query,
            budget,
            json,
        } => {
            retrieve::run_retrieve(&cfg, &query, budget, json).await?;
        }
        Commands::List {
            source_type,
            prefix,
        } => {
            get::run_list(&cfg, source_type, prefix).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Load { dir } => {
            manual::run_load(&cfg, &dir).await?;
        }
        Commands::Compact { retention_days } => {
            stats::run_compact(&cfg, retention_days).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
