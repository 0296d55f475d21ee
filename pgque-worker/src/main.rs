//! pgque operator binary
//!
//! Loads configuration, then runs one subcommand against the job table.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pgque_job_queue::{EnqueueResult, JobQueueClient, JobStore, Locker, MemoryStore, PgJobStore};

use pgque_worker::cli::{Cli, Command, EnqueueArgs, WorkArgs};
use pgque_worker::config_helpers::{
    builtin_registry, database_config_from_config, job_request_from_args,
    locker_config_from_config,
};
use pgque_worker::tracing_setup::install_tracing_from_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config_path.as_deref())?;
    install_tracing_from_config(&config.logging);
    tracing::debug!(config_path = ?cli.config_path, "configuration loaded");

    match cli.command {
        Command::Work(args) => work(&config, &args).await,
        Command::Enqueue(args) => enqueue(&config, &args).await,
        Command::Migrate => {
            let pool = connect(&config).await?;
            run_migrations(&pool).await
        }
        Command::Stats => stats(&config).await,
        Command::Clear { yes } => clear(&config, yes).await,
    }
}

/// Load configuration from file (if any) plus `PGQUE_*` overrides, then validate.
fn load_config(path: Option<&Path>) -> anyhow::Result<pgque_config::Config> {
    let config = pgque_config::load_config(path)
        .with_context(|| format!("failed to load configuration from {path:?}"))?;
    pgque_config::validate_config(&config).context("invalid configuration")?;
    Ok(config)
}

async fn connect(config: &pgque_config::Config) -> anyhow::Result<pgque_db_connection::DbPool> {
    let db_cfg = database_config_from_config(config)?;
    let pool = pgque_db_connection::create_pool(&db_cfg).await?;
    Ok(pool)
}

async fn run_migrations(pool: &pgque_db_connection::DbPool) -> anyhow::Result<()> {
    tracing::info!("applying Postgres migrations");
    match pgque_migrations::postgres_migrator().run(pool).await {
        Ok(()) => {
            tracing::info!("database migrations applied successfully");
            Ok(())
        }
        Err(e) => {
            tracing::error!(%e, "failed to apply database migrations");
            Err(anyhow::anyhow!("failed to apply database migrations: {e}"))
        }
    }
}

/// Run a locker until ctrl-c, then drain it.
async fn work(config: &pgque_config::Config, args: &WorkArgs) -> anyhow::Result<()> {
    let pool = connect(config).await?;
    if args.migrate {
        run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let registry = builtin_registry(&args.retire);
    let locker_config = locker_config_from_config(&config.locker, args);
    let locker = Locker::start(store, registry, locker_config)?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining locker");

    let result = locker.stop().await;
    let snapshot = locker.snapshot();
    tracing::info!(
        claimed = snapshot.counters.claimed,
        finished = snapshot.counters.finished,
        retried = snapshot.counters.retried,
        expired = snapshot.counters.expired,
        destroyed = snapshot.counters.destroyed,
        released = snapshot.counters.released,
        "locker totals"
    );
    result.map_err(Into::into)
}

async fn enqueue(config: &pgque_config::Config, args: &EnqueueArgs) -> anyhow::Result<()> {
    let request = job_request_from_args(args)?;
    let registry = builtin_registry(&[]);

    // Synchronous mode never touches the job table.
    let store: Arc<dyn JobStore> = if config.locker.run_synchronously {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgJobStore::new(connect(config).await?))
    };
    let client = JobQueueClient::new(store, registry)
        .with_run_synchronously(config.locker.run_synchronously);

    match client.enqueue(request).await? {
        EnqueueResult::Enqueued(job) => {
            tracing::info!(job_id = job.id, job_class = %job.job_class, queue = %job.queue, "job enqueued");
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        EnqueueResult::Ran { job, outcome } => {
            tracing::info!(job_class = %job.job_class, outcome = outcome.as_str(), "job ran inline");
        }
    }
    Ok(())
}

async fn stats(config: &pgque_config::Config) -> anyhow::Result<()> {
    let store = PgJobStore::new(connect(config).await?);
    let stats = store.job_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn clear(config: &pgque_config::Config, confirmed: bool) -> anyhow::Result<()> {
    if !confirmed {
        anyhow::bail!("refusing to delete every job without --yes");
    }
    let store = PgJobStore::new(connect(config).await?);
    let deleted = store.clear().await?;
    tracing::warn!(deleted, "job table cleared");
    Ok(())
}
