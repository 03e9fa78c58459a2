use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "projsync")]
#[command(about = "Back up a live project tree and keep it searchable", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one backup pass of the configured source into the destination
    Backup,
    /// Show what the next backup pass would do, without doing it
    Plan {
        /// Also list skipped files
        #[arg(long)]
        all: bool,
    },
    /// Run backups periodically until Enter is pressed
    Schedule,
    /// Bring the content index up to date for a directory
    Index {
        /// Directory to index (defaults to the configured source root)
        root: Option<PathBuf>,
    },
    /// Full-text search over the index
    Search {
        query: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Only search entries under this directory
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// List groups of indexed files with identical content
    Duplicates {
        /// Only consider entries under this directory
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Remove one path from the index
    Remove { path: PathBuf },
    /// Show recent backup runs
    History,
    /// Show index statistics
    Stats {
        /// Only count entries under this directory
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Copy a backup tree back into a target directory
    Restore {
        backup_root: PathBuf,
        target_root: PathBuf,
        /// Replace target files even when they are newer than the backup
        #[arg(long)]
        overwrite: bool,
    },
    /// Print configuration values
    PrintConfig,
    /// Delete every index entry
    ClearIndex,
}
