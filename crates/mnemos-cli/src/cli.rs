//! Clap CLI definitions for mnemos.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  mnemos recall \"what did we plant last spring\"
  mnemos recall \"the argument\" --affect '{\"FEAR\": 0.6}' --max-results 3
  mnemos recall roses --fts-only
  mnemos index build --kind auto --days 180
  mnemos index backfill --limit 500
  mnemos cache stats
  mnemos cache cleanup --days 90

Logs go to stderr; set RUST_LOG=info for more detail.";

/// mnemos: tiered hybrid memory recall.
#[derive(Parser)]
#[command(
    name = "mnemos",
    version,
    about = "Tiered hybrid memory recall for conversational agents",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file (default: ~/.mnemos/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recall memories relevant to a query; prints JSON to stdout.
    Recall {
        /// Query text.
        query: String,
        /// Current emotional state as a JSON object of dimension → value.
        #[arg(long)]
        affect: Option<String>,
        /// Keyword search only; never call the embedding provider.
        #[arg(long)]
        fts_only: bool,
        /// Maximum number of memories to return.
        #[arg(long)]
        max_results: Option<usize>,
        /// Overall deadline in milliseconds.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Vector index management [*].
    #[command(subcommand)]
    Index(IndexCommands),
    /// Embedding cache management [*].
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
pub enum IndexCommands {
    /// Build the vector index from stored embeddings and persist it.
    Build {
        /// auto, exact or approximate.
        #[arg(long, default_value = "auto")]
        kind: String,
        /// Include embeddings from the last N days.
        #[arg(long, default_value = "180")]
        days: u32,
    },
    /// Show index statistics.
    Stats,
    /// Embed stored memories that have no embedding yet and index them.
    Backfill {
        /// Maximum number of memories to embed.
        #[arg(long, default_value = "1000")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show embedding cache statistics.
    Stats,
    /// Remove disk cache entries not used in N days.
    Cleanup {
        #[arg(long, default_value = "90")]
        days: u32,
    },
    /// Pre-compute embeddings for common queries.
    Warm {
        /// Queries to embed.
        queries: Vec<String>,
        /// Read additional queries from a file, one per line.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}
