use chrono::{Duration, Utc};

use crate::error::JobsError;
use crate::jobs::cron;
use crate::jobs::model::{JobConfig, NewWorkerJob, WorkerJob};
use crate::jobs::store::JobStore;
use crate::tx::{with_transaction, Db, TxRetryPolicy};

/// The only sanctioned way to create or cancel work.
///
/// Creating a job for `(type, owner_id)` cancels that pair's pending rows in
/// the same transaction, so at most one occurrence per pair is ever pending.
#[derive(Clone)]
pub struct Scheduler {
    store: JobStore,
    tx_policy: TxRetryPolicy,
}

impl Scheduler {
    pub fn new(store: JobStore, tx_policy: TxRetryPolicy) -> Self {
        Self { store, tx_policy }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn tx_policy(&self) -> &TxRetryPolicy {
        &self.tx_policy
    }

    /// One-shot job, due at `config.due` (default now).
    pub async fn schedule_job(&self, config: JobConfig) -> Result<WorkerJob, JobsError> {
        self.schedule_job_with(Db::Pool(self.store.pool()), config)
            .await
    }

    /// Same as [`Scheduler::schedule_job`] but on a caller-chosen handle, so
    /// scheduling can join a transaction the caller already holds.
    pub async fn schedule_job_with(
        &self,
        db: Db<'_>,
        config: JobConfig,
    ) -> Result<WorkerJob, JobsError> {
        config.validate()?;
        let due = config.due.unwrap_or_else(Utc::now);
        let job = config.into_new_job(due, None);
        self.replace_pending(db, job).await
    }

    /// Recurring job. The first `due` is the expression's next occurrence
    /// after now; `config.due` is ignored.
    pub async fn schedule_cron_job(
        &self,
        config: JobConfig,
        expression: &str,
    ) -> Result<WorkerJob, JobsError> {
        config.validate()?;
        let due = cron::next_after(expression, Utc::now())?;
        let job = config.into_new_job(due, Some(expression.trim().to_string()));
        self.replace_pending(Db::Pool(self.store.pool()), job)
            .await
    }

    /// Successor for a failed one-shot job with auto-reschedule enabled,
    /// due `auto_reschedule_on_failure_delay` ms from now.
    pub async fn reschedule_failed_job(&self, job: &WorkerJob) -> Result<WorkerJob, JobsError> {
        let delay = Duration::milliseconds(job.auto_reschedule_on_failure_delay.max(0) as i64);
        let next = job.successor(Utc::now() + delay);
        self.replace_pending(Db::Pool(self.store.pool()), next)
            .await
    }

    /// Next occurrence of a cron job, due at the expression's next tick after
    /// now. Returns `None` when the chain has ended: the stored row no longer
    /// carries a schedule, or a newer row for the pair already exists. A row
    /// that was garbage-collected while running still continues its chain.
    pub async fn reschedule_cron_job(
        &self,
        job: &WorkerJob,
    ) -> Result<Option<WorkerJob>, JobsError> {
        let Some(expression) = job.cron_schedule.as_deref() else {
            return Ok(None);
        };
        let next = job.successor(cron::next_after(expression, Utc::now())?);
        let previous_id = job.id;

        let store = self.store.clone();
        with_transaction(Db::Pool(self.store.pool()), &self.tx_policy, move |conn| {
            let store = store.clone();
            let next = next.clone();
            Box::pin(async move {
                if let Some(None) = store.cron_schedule_in(conn, previous_id).await? {
                    return Ok(None);
                }
                if store
                    .has_newer_in(conn, &next.job_type, next.owner_id, previous_id)
                    .await?
                {
                    return Ok(None);
                }
                store
                    .cancel_pending_in(conn, &next.job_type, next.owner_id)
                    .await?;
                let row = store.insert_in(conn, &next).await?;
                Ok(Some(row))
            })
        })
        .await
    }

    /// Cancels pending rows of the pair and ends any cron chain whose current
    /// occurrence is running. A running handler is not interrupted.
    pub async fn cancel_jobs(&self, job_type: &str, owner_id: i32) -> Result<u64, JobsError> {
        let store = self.store.clone();
        let owned_type = job_type.to_string();

        let cancelled = with_transaction(Db::Pool(self.store.pool()), &self.tx_policy, move |conn| {
            let store = store.clone();
            let job_type = owned_type.clone();
            Box::pin(async move {
                let cancelled = store.cancel_pending_in(conn, &job_type, owner_id).await?;
                store.end_cron_chain_in(conn, &job_type, owner_id).await?;
                Ok(cancelled)
            })
        })
        .await?;

        tracing::info!(job_type, owner_id, cancelled, "cancelled pending jobs");
        Ok(cancelled)
    }

    /// Garbage-collects expired rows, never touching `exclude_ids`.
    pub async fn remove_old_jobs(&self, exclude_ids: &[i64]) -> Result<u64, JobsError> {
        self.store.remove_expired(exclude_ids).await
    }

    async fn replace_pending(&self, db: Db<'_>, job: NewWorkerJob) -> Result<WorkerJob, JobsError> {
        let store = self.store.clone();

        let row = with_transaction(db, &self.tx_policy, move |conn| {
            let store = store.clone();
            let job = job.clone();
            Box::pin(async move {
                let cancelled = store
                    .cancel_pending_in(conn, &job.job_type, job.owner_id)
                    .await?;
                if cancelled > 0 {
                    tracing::debug!(
                        job_type = %job.job_type,
                        owner_id = job.owner_id,
                        cancelled,
                        "superseded pending jobs"
                    );
                }
                store.insert_in(conn, &job).await
            })
        })
        .await?;

        tracing::debug!(
            job_id = row.id,
            job_type = %row.job_type,
            owner_id = row.owner_id,
            due = %row.due,
            cron = row.cron_schedule.as_deref().unwrap_or("-"),
            "job scheduled"
        );
        Ok(row)
    }
}
