use std::num::ParseIntError;

use thiserror::Error;

/// Errors that can occur while configuring or creating the database pool.
#[derive(Debug, Error)]
pub enum DbConnectionError {
    #[error("environment variable {0} is missing")]
    MissingEnvVar(String),
    #[error("database url cannot be empty")]
    EmptyDatabaseUrl,
    #[error("database url must use the postgres:// or postgresql:// scheme")]
    UnsupportedScheme,
    #[error("environment variable {0} contains invalid unicode")]
    InvalidUnicode(String),
    #[error("failed to parse numeric environment variable {var}: {source}")]
    InvalidNumber {
        var: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid boolean value '{value}' for {var}")]
    InvalidBoolean { var: String, value: String },
    #[error("invalid pool settings: {0}")]
    InvalidPoolSettings(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DbConnectionError {
    /// Whether retrying the connection later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_))
        )
    }
}
