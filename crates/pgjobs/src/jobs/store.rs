// crates/pgjobs/src/jobs/store.rs

use crate::error::JobsError;
use crate::jobs::model::{JobCounts, NewWorkerJob, WorkerJob};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};

/// Default staleness window after which a claimed-but-unfinished row is
/// offered to workers again.
pub const DEFAULT_STALE_CLAIM: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Durable CRUD over `worker_jobs`.
///
/// Methods ending in `_in` run on a caller-supplied connection so they can be
/// composed inside one transaction (see [`crate::tx::with_transaction`]).
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
    stale_ms: i64,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stale_ms: DEFAULT_STALE_CLAIM.as_millis() as i64,
        }
    }

    pub fn with_stale_after(mut self, stale_after: std::time::Duration) -> Self {
        self.stale_ms = stale_after.as_millis().min(i64::MAX as u128) as i64;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_ms)
    }

    // ----------------------------
    // Inserts
    // ----------------------------

    pub async fn insert(&self, job: &NewWorkerJob) -> Result<WorkerJob, JobsError> {
        let mut conn = self.pool.acquire().await?;
        self.insert_in(&mut conn, job).await
    }

    /// `rescheduled_from_job` is kept only while that row still exists.
    pub async fn insert_in(
        &self,
        conn: &mut PgConnection,
        job: &NewWorkerJob,
    ) -> Result<WorkerJob, JobsError> {
        let row = sqlx::query_as::<_, WorkerJob>(
            r#"
            INSERT INTO worker_jobs (
                tag, type, user_id, data, due, remove_at, cron_schedule,
                auto_reschedule_on_failure, auto_reschedule_on_failure_delay,
                remove_delay, rescheduled_from_job, persistent
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                (SELECT id FROM worker_jobs WHERE id = $11 FOR KEY SHARE),
                $12
            )
            RETURNING *
            "#,
        )
        .bind(&job.tag)
        .bind(&job.job_type)
        .bind(job.owner_id)
        .bind(&job.data)
        .bind(job.due)
        .bind(job.remove_at)
        .bind(&job.cron_schedule)
        .bind(job.auto_reschedule_on_failure)
        .bind(job.auto_reschedule_on_failure_delay)
        .bind(job.remove_delay)
        .bind(job.rescheduled_from_job)
        .bind(job.persistent)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_by_id(&self, id: i64) -> Result<Option<WorkerJob>, JobsError> {
        let job = sqlx::query_as::<_, WorkerJob>("SELECT * FROM worker_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn count_pending(&self) -> Result<i64, JobsError> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM worker_jobs
            WHERE finished IS NULL
              AND (started IS NULL OR started < now() - ($1::bigint * interval '1 millisecond'))
            "#,
        )
        .bind(self.stale_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// The pending row with the earliest `due`. A read, not a claim: the row
    /// may still be in the future.
    pub async fn get_next_pending(&self) -> Result<Option<WorkerJob>, JobsError> {
        let job = sqlx::query_as::<_, WorkerJob>(
            r#"
            SELECT *
            FROM worker_jobs
            WHERE finished IS NULL
              AND (started IS NULL OR started < now() - ($1::bigint * interval '1 millisecond'))
            ORDER BY due ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(self.stale_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Most recent rows first, for operators.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<WorkerJob>, JobsError> {
        let rows = sqlx::query_as::<_, WorkerJob>(
            r#"
            SELECT *
            FROM worker_jobs
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_for_owner(
        &self,
        job_type: Option<&str>,
        owner_id: i32,
        limit: i64,
    ) -> Result<Vec<WorkerJob>, JobsError> {
        let rows = sqlx::query_as::<_, WorkerJob>(
            r#"
            SELECT *
            FROM worker_jobs
            WHERE user_id = $1
              AND ($2::text IS NULL OR type = $2)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(owner_id)
        .bind(job_type)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn counts(&self) -> Result<JobCounts, JobsError> {
        let (pending, running, succeeded, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                r#"
                SELECT
                  COUNT(*) FILTER (
                    WHERE finished IS NULL
                      AND (started IS NULL OR started < now() - ($1::bigint * interval '1 millisecond'))
                  ),
                  COUNT(*) FILTER (
                    WHERE finished IS NULL
                      AND started >= now() - ($1::bigint * interval '1 millisecond')
                  ),
                  COUNT(*) FILTER (WHERE success = true),
                  COUNT(*) FILTER (WHERE success = false)
                FROM worker_jobs
                "#,
            )
            .bind(self.stale_ms)
            .fetch_one(&self.pool)
            .await?;

        Ok(JobCounts {
            pending,
            running,
            succeeded,
            failed,
        })
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    pub async fn mark_started(&self, id: i64) -> Result<WorkerJob, JobsError> {
        sqlx::query_as::<_, WorkerJob>(
            r#"
            UPDATE worker_jobs
            SET started = now(),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(JobsError::NotFound(id))
    }

    /// Claims the row only if it is still pending. `None` means another worker
    /// got there first (or the row is gone).
    pub async fn try_claim(&self, id: i64) -> Result<Option<WorkerJob>, JobsError> {
        let job = sqlx::query_as::<_, WorkerJob>(
            r#"
            UPDATE worker_jobs
            SET started = now(),
                updated_at = now()
            WHERE id = $1
              AND finished IS NULL
              AND (started IS NULL OR started < now() - ($2::bigint * interval '1 millisecond'))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(self.stale_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn mark_succeeded(
        &self,
        id: i64,
        result: Option<Value>,
    ) -> Result<WorkerJob, JobsError> {
        self.mark_finished(id, true, result).await
    }

    pub async fn mark_failed(&self, id: i64, result: Value) -> Result<WorkerJob, JobsError> {
        self.mark_finished(id, false, Some(result)).await
    }

    async fn mark_finished(
        &self,
        id: i64,
        success: bool,
        result: Option<Value>,
    ) -> Result<WorkerJob, JobsError> {
        sqlx::query_as::<_, WorkerJob>(
            r#"
            UPDATE worker_jobs
            SET finished = now(),
                success = $2,
                result = $3,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(success)
        .bind(result)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(JobsError::NotFound(id))
    }

    /// Marks every pending row of `(job_type, owner_id)` as finished and
    /// failed. Returns how many rows were cancelled.
    pub async fn cancel_pending_in(
        &self,
        conn: &mut PgConnection,
        job_type: &str,
        owner_id: i32,
    ) -> Result<u64, JobsError> {
        let res = sqlx::query(
            r#"
            UPDATE worker_jobs
            SET started = now(),
                finished = now(),
                success = false,
                result = $3,
                updated_at = now()
            WHERE type = $1
              AND user_id = $2
              AND finished IS NULL
              AND (started IS NULL OR started < now() - ($4::bigint * interval '1 millisecond'))
            "#,
        )
        .bind(job_type)
        .bind(owner_id)
        .bind(cancelled_result())
        .bind(self.stale_ms)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected())
    }

    /// Clears `cron_schedule` on unfinished rows of the pair, and on its
    /// newest row, so an occurrence that is running or has just finished does
    /// not spawn a successor.
    pub async fn end_cron_chain_in(
        &self,
        conn: &mut PgConnection,
        job_type: &str,
        owner_id: i32,
    ) -> Result<u64, JobsError> {
        let res = sqlx::query(
            r#"
            UPDATE worker_jobs
            SET cron_schedule = NULL,
                updated_at = now()
            WHERE type = $1
              AND user_id = $2
              AND cron_schedule IS NOT NULL
              AND (
                finished IS NULL
                OR id = (SELECT max(id) FROM worker_jobs WHERE type = $1 AND user_id = $2)
              )
            "#,
        )
        .bind(job_type)
        .bind(owner_id)
        .execute(&mut *conn)
        .await?;

        Ok(res.rows_affected())
    }

    /// Current `cron_schedule` of a row. `None` when the row is gone.
    pub async fn cron_schedule_in(
        &self,
        conn: &mut PgConnection,
        id: i64,
    ) -> Result<Option<Option<String>>, JobsError> {
        let schedule = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT cron_schedule
            FROM worker_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(schedule)
    }

    /// Whether a row for the pair was created after `id`.
    pub async fn has_newer_in(
        &self,
        conn: &mut PgConnection,
        job_type: &str,
        owner_id: i32,
        id: i64,
    ) -> Result<bool, JobsError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM worker_jobs
                WHERE type = $1
                  AND user_id = $2
                  AND id > $3
            )
            "#,
        )
        .bind(job_type)
        .bind(owner_id)
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    /// Deletes started, non-persistent rows whose `remove_at` has passed,
    /// skipping `exclude_ids`.
    pub async fn remove_expired(&self, exclude_ids: &[i64]) -> Result<u64, JobsError> {
        let res = sqlx::query(
            r#"
            DELETE FROM worker_jobs
            WHERE remove_at <= now()
              AND started IS NOT NULL
              AND persistent = false
              AND NOT (id = ANY($1))
            "#,
        )
        .bind(exclude_ids.to_vec())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

pub fn cancelled_result() -> Value {
    json!({
        "error": "cancelled due to new job",
        "cancelled": true,
    })
}
