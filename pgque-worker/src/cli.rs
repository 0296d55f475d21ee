use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

/// Operate a pgque job table: run lockers, enqueue jobs, inspect and migrate.
#[derive(Debug, Parser)]
#[command(name = "pgque", version, about)]
pub struct Cli {
    /// Path to configuration file (TOML, YAML or JSON).
    #[arg(short = 'c', long, global = true, env = "PGQUE_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a locker and its worker pool until interrupted.
    Work(WorkArgs),
    /// Insert a job.
    Enqueue(EnqueueArgs),
    /// Apply pending migrations.
    Migrate,
    /// Print per-class counts for jobs that are not finished or expired.
    Stats,
    /// Delete every job row.
    Clear {
        /// Required; guards against accidental wipes.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Args)]
pub struct WorkArgs {
    /// Override `locker.worker_count`.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Only claim from this queue (repeatable). Overrides `locker.queues`.
    #[arg(short = 'q', long = "queue")]
    pub queues: Vec<String>,

    /// Job classes to delete on sight (repeatable).
    #[arg(long = "retire")]
    pub retire: Vec<String>,

    /// Apply migrations before starting.
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    pub job_class: String,

    /// Positional arguments as a JSON array.
    #[arg(long, default_value = "[]")]
    pub args: String,

    /// Keyword arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    pub kwargs: String,

    #[arg(short = 'q', long)]
    pub queue: Option<String>,

    #[arg(short = 'p', long)]
    pub priority: Option<i16>,

    /// RFC 3339 timestamp; defaults to now.
    #[arg(long)]
    pub run_at: Option<DateTime<Utc>>,

    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,
}
