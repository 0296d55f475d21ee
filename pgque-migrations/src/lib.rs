//! Embedded PostgreSQL migrations for the job table.

use sqlx::migrate::Migrator;

pub static POSTGRES_MIGRATOR: Migrator = sqlx_macros::migrate!("src/migrations_postgres");

pub fn postgres_migrator() -> &'static Migrator {
    &POSTGRES_MIGRATOR
}
