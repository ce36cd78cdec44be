//! Command-line interface for the mnemos recall engine.
//!
//! Every command boots an in-process kernel, runs once and exits. JSON goes
//! to stdout, logs and diagnostics to stderr.

mod cli;
mod cmd;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Recall {
            query,
            affect,
            fts_only,
            max_results,
            deadline_ms,
        } => cmd::recall::cmd_recall(
            cli.config,
            cmd::recall::RecallArgs {
                query,
                affect,
                fts_only,
                max_results,
                deadline_ms,
            },
        ),
        Commands::Index(sub) => match sub {
            IndexCommands::Build { kind, days } => {
                cmd::index::cmd_index_build(cli.config, &kind, days)
            }
            IndexCommands::Stats => cmd::index::cmd_index_stats(cli.config),
            IndexCommands::Backfill { limit } => cmd::index::cmd_index_backfill(cli.config, limit),
        },
        Commands::Cache(sub) => match sub {
            CacheCommands::Stats => cmd::cache::cmd_cache_stats(cli.config),
            CacheCommands::Cleanup { days } => cmd::cache::cmd_cache_cleanup(cli.config, days),
            CacheCommands::Warm { queries, file } => {
                cmd::cache::cmd_cache_warm(cli.config, queries, file)
            }
        },
    }
}
