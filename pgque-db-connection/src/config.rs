use std::env::{self, VarError};
use std::time::Duration;

use serde::Deserialize;

use crate::error::DbConnectionError;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_APPLICATION_NAME: &str = "pgque";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_TEST_BEFORE_ACQUIRE: bool = true;

/// Settings for the PostgreSQL pool shared by producers, workers and the
/// locker's claim session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConnectionConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub test_before_acquire: bool,
    /// Reported in `pg_stat_activity`, which makes lockers easy to spot next
    /// to the advisory locks they hold.
    pub application_name: String,
}

impl Default for DbConnectionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            test_before_acquire: DEFAULT_TEST_BEFORE_ACQUIRE,
            application_name: DEFAULT_APPLICATION_NAME.to_owned(),
        }
    }
}

impl DbConnectionConfig {
    /// Creates a new configuration with the provided URL and sane defaults.
    #[inline]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from environment variables using the supplied prefix.
    ///
    /// Expected variables:
    /// - `{PREFIX}_DATABASE_URL` (required)
    /// - `{PREFIX}_DB_MAX_CONNECTIONS` (optional)
    /// - `{PREFIX}_DB_MIN_CONNECTIONS` (optional)
    /// - `{PREFIX}_DB_CONNECT_TIMEOUT_SECS` (optional)
    /// - `{PREFIX}_DB_IDLE_TIMEOUT_SECS` (optional)
    /// - `{PREFIX}_DB_TEST_BEFORE_ACQUIRE` (optional, bool)
    /// - `{PREFIX}_DB_APPLICATION_NAME` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, DbConnectionError> {
        let url_var = format!("{prefix}_DATABASE_URL");
        let url = read_var(&url_var)?.ok_or(DbConnectionError::MissingEnvVar(url_var))?;
        let mut config = Self::new(url);
        config.apply_env(prefix)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the optional `{PREFIX}_DB_*` variables onto this configuration.
    pub fn apply_env(&mut self, prefix: &str) -> Result<(), DbConnectionError> {
        if let Some(max) = parse_number(prefix, "DB_MAX_CONNECTIONS")? {
            self.max_connections = max;
        }
        if let Some(min) = parse_number(prefix, "DB_MIN_CONNECTIONS")? {
            self.min_connections = min;
        }
        if let Some(connect_timeout) = parse_number(prefix, "DB_CONNECT_TIMEOUT_SECS")? {
            self.connect_timeout_secs = connect_timeout;
        }
        if let Some(idle_timeout) = parse_number(prefix, "DB_IDLE_TIMEOUT_SECS")? {
            self.idle_timeout_secs = Some(idle_timeout);
        }
        if let Some(value) = parse_bool(prefix, "DB_TEST_BEFORE_ACQUIRE")? {
            self.test_before_acquire = value;
        }
        if let Some(name) = read_var(&format!("{prefix}_DB_APPLICATION_NAME"))? {
            self.application_name = name;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DbConnectionError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(DbConnectionError::EmptyDatabaseUrl);
        }
        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
            return Err(DbConnectionError::UnsupportedScheme);
        }
        if self.max_connections == 0 {
            return Err(DbConnectionError::InvalidPoolSettings(
                "max_connections must be greater than 0".to_owned(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DbConnectionError::InvalidPoolSettings(
                "min_connections must not exceed max_connections".to_owned(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Trimmed value of `name`, treating blank as unset.
fn read_var(name: &str) -> Result<Option<String>, DbConnectionError> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(DbConnectionError::InvalidUnicode(name.to_owned())),
    }
}

fn parse_number<T>(prefix: &str, suffix: &str) -> Result<Option<T>, DbConnectionError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    let var = format!("{prefix}_{suffix}");
    let Some(value) = read_var(&var)? else {
        return Ok(None);
    };
    value
        .parse()
        .map(Some)
        .map_err(|source| DbConnectionError::InvalidNumber { var, source })
}

fn parse_bool(prefix: &str, suffix: &str) -> Result<Option<bool>, DbConnectionError> {
    let var = format!("{prefix}_{suffix}");
    let Some(value) = read_var(&var)? else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(DbConnectionError::InvalidBoolean { var, value }),
    }
}
