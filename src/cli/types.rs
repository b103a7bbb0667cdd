//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::models::{ExecutionStage, ExecutorStrategy};

#[derive(Parser, Debug)]
#[command(name = "cascade")]
#[command(about = "Cascade - dependency-ordered execution of agent work items", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Project directory holding `.cascade/`
    #[arg(short = 'C', long, global = true, value_name = "DIR", default_value = ".")]
    pub project_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute the pending plan batch by batch
    Run {
        /// Batch executor strategy (concurrent, polling)
        #[arg(short, long)]
        strategy: Option<ExecutorStrategy>,

        /// Maximum items running at once
        #[arg(short = 'c', long)]
        max_concurrency: Option<usize>,

        /// Stop after the first batch with a failed item
        #[arg(long)]
        stop_on_first_failure: bool,
    },

    /// Show where the last run stopped and how to resume
    Status,

    /// Show the dependency batches of the current plan
    Batches {
        /// Emit a Mermaid graph instead of the text rendering
        #[arg(long)]
        mermaid: bool,
    },

    /// Stage lifecycle commands
    #[command(subcommand)]
    Stage(StageCommands),

    /// Retry bookkeeping commands
    #[command(subcommand)]
    Retry(RetryCommands),

    /// Lock file maintenance
    #[command(subcommand)]
    Locks(LockCommands),
}

#[derive(Subcommand, Debug)]
pub enum StageCommands {
    /// Show every stage with its status
    Show,

    /// Reset a stage and everything after it to pending
    ResumeFrom {
        /// Stage name, e.g. `execute` or `ready-check`
        stage: ExecutionStage,
    },
}

#[derive(Subcommand, Debug)]
pub enum RetryCommands {
    /// Show retry attempts per item
    Show,

    /// Forget recorded failures
    Reset {
        /// Item to reset
        #[arg(required_unless_present = "all")]
        item_id: Option<String>,

        /// Reset every item
        #[arg(long, conflicts_with = "item_id")]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Remove orphaned lock files
    Cleanup {
        /// Age in seconds after which an unheld lock file is removed
        /// (defaults to `locking.stale_after_secs`)
        #[arg(long)]
        older_than: Option<u64>,
    },
}
