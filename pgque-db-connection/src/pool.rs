use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::config::DbConnectionConfig;
use crate::error::DbConnectionError;
use crate::utils::sanitize_database_url;

pub type DbPool = PgPool;

/// Validate `config` and open a PostgreSQL pool.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    config.validate()?;
    let database = sanitize_database_url(config.url.trim());
    tracing::debug!(
        %database,
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "connecting to database"
    );

    match connect(config).await {
        Ok(pool) => {
            tracing::info!(%database, "database pool ready");
            Ok(pool)
        }
        Err(err) => {
            tracing::error!(%database, error = %err, "database connection failed");
            Err(err)
        }
    }
}

async fn connect(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    let options = connect_options(config)?;

    let mut pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .test_before_acquire(config.test_before_acquire);
    if let Some(idle) = config.idle_timeout() {
        pool = pool.idle_timeout(idle);
    }

    pool.connect_with(options).await.map_err(Into::into)
}

fn connect_options(config: &DbConnectionConfig) -> Result<PgConnectOptions, DbConnectionError> {
    let options = PgConnectOptions::from_str(config.url.trim())?;
    Ok(if config.application_name.is_empty() {
        options
    } else {
        options.application_name(&config.application_name)
    })
}
