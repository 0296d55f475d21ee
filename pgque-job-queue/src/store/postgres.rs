//! PostgreSQL job store: advisory locks plus LISTEN/NOTIFY.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgListener, PgPool};
use sqlx::types::Json;
use sqlx::{Connection, PgConnection};
use tracing::instrument;

use super::{ClaimFilter, ClaimSession, JobNotifications, JobStore};
use crate::error::JobQueueError;
use crate::notification::{JobNotification, NOTIFICATION_CHANNEL};
use crate::types::{JobClassStats, JobRecord, Metajob, NewJob, SCHEMA_VERSION};

/// Table holding job rows.
pub const JOBS_TABLE: &str = "pgque_jobs";

const JOB_COLUMNS: &str = "id, queue, priority, run_at, first_run_at, job_class, args, kwargs, \
     data, error_count, last_error, expired_at, finished_at, schema_version";

const INSERT_JOB: &str = r#"
INSERT INTO pgque_jobs (queue, priority, run_at, first_run_at, job_class, args, kwargs, data, schema_version)
VALUES ($1, $2, coalesce($3::timestamptz, now()), coalesce($3::timestamptz, now()), $4, $5, $6, $7, $8)
RETURNING id, queue, priority, run_at, first_run_at, job_class, args, kwargs,
          data, error_count, last_error, expired_at, finished_at, schema_version
"#;

const LOAD_JOB: &str = r#"
SELECT id, queue, priority, run_at, first_run_at, job_class, args, kwargs,
       data, error_count, last_error, expired_at, finished_at, schema_version
FROM pgque_jobs
WHERE id = $1
  AND finished_at IS NULL
  AND expired_at IS NULL
  AND run_at <= now()
"#;

const FINISH_JOB: &str = "UPDATE pgque_jobs SET finished_at = now() WHERE id = $1";

const RETRY_JOB: &str = r#"
UPDATE pgque_jobs
SET error_count = error_count + 1,
    run_at = now() + make_interval(secs => $2::double precision),
    last_error = coalesce($3::text, last_error)
WHERE id = $1
"#;

const EXPIRE_JOB: &str = r#"
UPDATE pgque_jobs
SET expired_at = now(),
    error_count = error_count + CASE WHEN $2::text IS NULL THEN 0 ELSE 1 END,
    last_error = coalesce($2::text, last_error)
WHERE id = $1
"#;

const DESTROY_JOB: &str = "DELETE FROM pgque_jobs WHERE id = $1";

/// Walks the (priority, run_at, id) index one row at a time, trying the
/// advisory lock on each candidate and stopping once `$4` locks are held.
/// The lock call sits outside each `LIMIT 1` subquery so the planner cannot
/// lock rows it never returns. Rows in `$2` are already held by this session
/// and are skipped since advisory locks are re-entrant.
const CLAIM_JOBS: &str = r#"
WITH RECURSIVE jobs AS (
  SELECT (j).*, pg_try_advisory_lock((j).id) AS locked, $4::integer AS remaining
  FROM (
    SELECT j
    FROM pgque_jobs AS j
    WHERE (cardinality($1::text[]) = 0 OR j.queue = ANY($1::text[]))
      AND NOT j.id = ANY($2::bigint[])
      AND ($3::smallint IS NULL OR j.priority <= $3::smallint)
      AND j.run_at <= now()
      AND j.finished_at IS NULL
      AND j.expired_at IS NULL
    ORDER BY j.priority, j.run_at, j.id
    LIMIT 1
  ) AS t1
  UNION ALL (
    SELECT (j).*, pg_try_advisory_lock((j).id) AS locked, remaining
    FROM (
      SELECT
        (
          SELECT j
          FROM pgque_jobs AS j
          WHERE (cardinality($1::text[]) = 0 OR j.queue = ANY($1::text[]))
            AND NOT j.id = ANY($2::bigint[])
            AND ($3::smallint IS NULL OR j.priority <= $3::smallint)
            AND j.run_at <= now()
            AND j.finished_at IS NULL
            AND j.expired_at IS NULL
            AND (j.priority, j.run_at, j.id) > (jobs.priority, jobs.run_at, jobs.id)
          ORDER BY j.priority, j.run_at, j.id
          LIMIT 1
        ) AS j,
        jobs.remaining - CASE WHEN jobs.locked THEN 1 ELSE 0 END AS remaining
      FROM jobs
      WHERE jobs.id IS NOT NULL
        AND jobs.remaining - CASE WHEN jobs.locked THEN 1 ELSE 0 END > 0
      LIMIT 1
    ) AS t1
  )
)
SELECT id, queue, priority, run_at
FROM jobs
WHERE locked
"#;

/// Que-style stats: a row counts as working while some session holds its
/// advisory lock.
const JOB_STATS: &str = r#"
SELECT job_class,
       count(*)::bigint AS count,
       count(locks.id)::bigint AS count_working,
       count(*) FILTER (WHERE error_count > 0)::bigint AS count_errored,
       coalesce(max(error_count), 0)::integer AS highest_error_count,
       min(run_at) AS oldest_run_at
FROM pgque_jobs
LEFT JOIN (
  SELECT (classid::bigint << 32) + objid::bigint AS id
  FROM pg_locks
  WHERE locktype = 'advisory'
) locks ON pgque_jobs.id = locks.id
WHERE finished_at IS NULL
  AND expired_at IS NULL
GROUP BY job_class
ORDER BY count(*) DESC, job_class
"#;

/// Job store on a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    channel: String,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            channel: NOTIFICATION_CHANNEL.to_owned(),
        }
    }

    /// Publish and listen on `channel` instead of the default.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    #[inline]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[inline]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn update_one(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, PgArguments>,
        id: i64,
    ) -> Result<(), JobQueueError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn now(&self) -> Result<DateTime<Utc>, JobQueueError> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    #[instrument(skip(self, job), fields(job_class = %job.job_class, queue = %job.queue, priority = job.priority))]
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobQueueError> {
        let mut tx = self.pool.begin().await?;
        let record: JobRecord = sqlx::query_as(INSERT_JOB)
            .bind(&job.queue)
            .bind(job.priority)
            .bind(job.run_at)
            .bind(&job.job_class)
            .bind(Json(&job.args))
            .bind(Json(&job.kwargs))
            .bind(Json(&job.data))
            .bind(SCHEMA_VERSION)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(JobNotification::from(&record).encode())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(job_id = record.id, "enqueued job");
        Ok(record)
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM {JOBS_TABLE} WHERE id = $1");
        let job = sqlx::query_as::<_, JobRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn load_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        let job = sqlx::query_as::<_, JobRecord>(LOAD_JOB)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn finish_job(&self, id: i64) -> Result<(), JobQueueError> {
        self.update_one(sqlx::query(FINISH_JOB).bind(id), id).await
    }

    #[instrument(skip(self, error))]
    async fn retry_job(
        &self,
        id: i64,
        interval: Duration,
        error: Option<&str>,
    ) -> Result<(), JobQueueError> {
        self.update_one(
            sqlx::query(RETRY_JOB)
                .bind(id)
                .bind(interval.as_secs_f64())
                .bind(error),
            id,
        )
        .await
    }

    #[instrument(skip(self, error))]
    async fn expire_job(&self, id: i64, error: Option<&str>) -> Result<(), JobQueueError> {
        self.update_one(sqlx::query(EXPIRE_JOB).bind(id).bind(error), id).await
    }

    #[instrument(skip(self))]
    async fn destroy_job(&self, id: i64) -> Result<(), JobQueueError> {
        self.update_one(sqlx::query(DESTROY_JOB).bind(id), id).await
    }

    async fn claim_session(&self) -> Result<Box<dyn ClaimSession>, JobQueueError> {
        // Detached so the pool never hands this connection, and the locks it
        // holds, to anyone else.
        let conn = self.pool.acquire().await?.detach();
        Ok(Box::new(PgClaimSession { conn }))
    }

    async fn listen(&self) -> Result<Box<dyn JobNotifications>, JobQueueError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(Box::new(PgNotifications { listener }))
    }

    async fn job_stats(&self) -> Result<Vec<JobClassStats>, JobQueueError> {
        let stats = sqlx::query_as::<_, JobClassStats>(JOB_STATS)
            .fetch_all(&self.pool)
            .await?;
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<u64, JobQueueError> {
        let result = sqlx::query("DELETE FROM pgque_jobs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// A dedicated connection holding this locker's advisory locks.
struct PgClaimSession {
    conn: PgConnection,
}

#[async_trait]
impl ClaimSession for PgClaimSession {
    async fn claim(
        &mut self,
        filter: &ClaimFilter,
        held: &[i64],
        limit: usize,
    ) -> Result<Vec<Metajob>, JobQueueError> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let claimed = sqlx::query_as::<_, Metajob>(CLAIM_JOBS)
            .bind(&filter.queue_names)
            .bind(held)
            .bind(filter.max_priority)
            .bind(limit)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(claimed)
    }

    async fn unlock(&mut self, id: i64) -> Result<bool, JobQueueError> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(id)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(released)
    }

    async fn unlock_all(&mut self) -> Result<(), JobQueueError> {
        sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), JobQueueError> {
        let session = *self;
        session.conn.close().await?;
        Ok(())
    }
}

struct PgNotifications {
    listener: PgListener,
}

#[async_trait]
impl JobNotifications for PgNotifications {
    async fn recv(&mut self) -> Result<String, JobQueueError> {
        // `None` means the connection dropped; the caller re-subscribes.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(notification.payload().to_owned()),
            None => Err(JobQueueError::SessionClosed),
        }
    }
}
