//! LeafSync CLI
//!
//! Command-line tools for LeafSync data directories.
//!
//! # Commands
//!
//! - `inspect` - Summarize collections, pending changes and sync cursors
//! - `dump-records` - Print the records of one collection
//! - `purge-tombstones` - Remove acknowledged tombstones past retention

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LeafSync command-line tools.
#[derive(Parser)]
#[command(name = "leafsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize collections, pending changes and sync cursors
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the records of one collection
    DumpRecords {
        /// Collection to dump
        #[arg(short, long)]
        collection: String,

        /// Include tombstones
        #[arg(short, long)]
        tombstones: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove acknowledged tombstones older than the retention
    PurgeTombstones {
        /// Collection to purge
        #[arg(short, long)]
        collection: String,

        /// Keep tombstones younger than this many seconds
        #[arg(short, long, default_value = "2592000")]
        retention_secs: u64,

        /// Dry run - show what would be removed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Data directory required for inspect")?;
            runtime.block_on(commands::inspect::run(&path, &format))?;
        }
        Commands::DumpRecords {
            collection,
            tombstones,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for dump-records")?;
            runtime.block_on(commands::dump_records::run(
                &path,
                &collection,
                tombstones,
                &format,
            ))?;
        }
        Commands::PurgeTombstones {
            collection,
            retention_secs,
            dry_run,
        } => {
            let path = cli
                .path
                .ok_or("Data directory required for purge-tombstones")?;
            runtime.block_on(commands::purge_tombstones::run(
                &path,
                &collection,
                retention_secs,
                dry_run,
            ))?;
        }
        Commands::Version => {
            println!("LeafSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("LeafSync Core v{}", leafsync_core::VERSION);
        }
    }

    Ok(())
}
