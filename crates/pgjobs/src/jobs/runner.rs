use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{sync::watch, time::Instant};

use crate::error::JobsError;
use crate::jobs::context::{HandlerError, JobContext};
use crate::jobs::model::WorkerJob;
use crate::jobs::registry::{JobKind, JobRegistry};
use crate::jobs::scheduler::Scheduler;
use crate::jobs::store::JobStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Rounds of `with_transaction` spent on a successor before giving up. The
/// completed row is never polled again, so a lost successor ends the chain.
const SUCCESSOR_ROUNDS: u32 = 5;

/// What one pass of the loop did.
#[derive(Debug)]
pub enum Tick {
    /// Nothing pending.
    Idle,
    /// The earliest pending row is not due yet.
    NotDue { id: i64, due: DateTime<Utc> },
    /// Another worker claimed the row between peek and claim.
    LostClaim { id: i64 },
    Ran(JobOutcome),
}

#[derive(Debug)]
pub struct JobOutcome {
    /// The row as written on completion, or as claimed if it was removed
    /// while running.
    pub job: WorkerJob,
    pub success: bool,
    /// Cron continuation or failure retry, if one was created.
    pub successor: Option<WorkerJob>,
}

/// Single-threaded polling engine: one job in flight at a time.
pub struct JobRunner<K: JobKind> {
    store: JobStore,
    scheduler: Scheduler,
    registry: Arc<JobRegistry<K>>,
    worker_id: String,
    poll_interval: Duration,
}

impl<K: JobKind> JobRunner<K> {
    pub fn new(scheduler: Scheduler, registry: Arc<JobRegistry<K>>, worker_id: impl Into<String>) -> Self {
        Self {
            store: scheduler.store().clone(),
            scheduler,
            registry,
            worker_id: worker_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs until `shutdown` flips to true (or its sender goes away). The
    /// job in flight always runs to completion first.
    ///
    /// Serialization failures skip to the next cycle; any other persistence
    /// error ends the loop and is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), JobsError> {
        tracing::info!(worker_id = %self.worker_id, "worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let tick = match self.run_once().await {
                Ok(tick) => tick,
                Err(err) if err.is_transient() => {
                    tracing::warn!(worker_id = %self.worker_id, error = %err, "cycle aborted, will retry");
                    Tick::Idle
                }
                Err(err) => {
                    tracing::error!(worker_id = %self.worker_id, error = %err, "worker loop failed");
                    return Err(err);
                }
            };

            // more work may be waiting right behind the job we just ran
            if matches!(tick, Tick::Ran(_)) {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "worker loop stopped");
        Ok(())
    }

    /// Idle -> peek -> claim -> execute, once.
    pub async fn run_once(&self) -> Result<Tick, JobsError> {
        if self.store.count_pending().await? == 0 {
            return Ok(Tick::Idle);
        }

        let Some(next) = self.store.get_next_pending().await? else {
            return Ok(Tick::Idle);
        };

        if next.due > Utc::now() {
            return Ok(Tick::NotDue {
                id: next.id,
                due: next.due,
            });
        }

        let Some(job) = self.store.try_claim(next.id).await? else {
            tracing::debug!(worker_id = %self.worker_id, job_id = next.id, "lost claim race");
            return Ok(Tick::LostClaim { id: next.id });
        };

        let outcome = self.execute(job).await?;
        Ok(Tick::Ran(outcome))
    }

    async fn execute(&self, job: WorkerJob) -> Result<JobOutcome, JobsError> {
        let start = Instant::now();
        tracing::info!(
            worker_id = %self.worker_id,
            job_id = job.id,
            job_type = %job.job_type,
            owner_id = job.owner_id,
            "running job"
        );

        let result = self.invoke(&job).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        let success = result.is_ok();
        let was_cron = job.is_cron();

        let written = match result {
            Ok(value) => {
                tracing::info!(worker_id = %self.worker_id, job_id = job.id, latency_ms, "job succeeded");
                self.store.mark_succeeded(job.id, Some(value)).await
            }
            Err(err) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    job_id = job.id,
                    latency_ms,
                    code = err.code,
                    error = %err.message,
                    "job failed"
                );
                self.store.mark_failed(job.id, err.to_result()).await
            }
        };

        let row = match written {
            Ok(row) => row,
            Err(JobsError::NotFound(id)) => {
                tracing::warn!(worker_id = %self.worker_id, job_id = id, "job row vanished before completion");
                job
            }
            Err(err) => return Err(err),
        };

        let successor = retry_transient(SUCCESSOR_ROUNDS, self.poll_interval, || {
            self.schedule_successor(&row, was_cron, success)
        })
        .await?;

        if let Some(next) = &successor {
            tracing::info!(
                worker_id = %self.worker_id,
                job_id = row.id,
                successor_id = next.id,
                due = %next.due,
                "successor scheduled"
            );
        }

        Ok(JobOutcome {
            job: row,
            success,
            successor,
        })
    }

    async fn schedule_successor(
        &self,
        row: &WorkerJob,
        was_cron: bool,
        success: bool,
    ) -> Result<Option<WorkerJob>, JobsError> {
        // a cancelled chain has its schedule cleared but is still not retried
        if was_cron {
            let next = self.scheduler.reschedule_cron_job(row).await?;
            if next.is_none() {
                tracing::info!(worker_id = %self.worker_id, job_id = row.id, "cron chain ended");
            }
            Ok(next)
        } else if !success && row.auto_reschedule_on_failure {
            Ok(Some(self.scheduler.reschedule_failed_job(row).await?))
        } else {
            Ok(None)
        }
    }

    /// Looks up and runs the handler on its own task so a panic becomes a
    /// recorded failure instead of taking the worker down.
    async fn invoke(&self, job: &WorkerJob) -> Result<Value, HandlerError> {
        let handler = self.registry.handler_for(&job.job_type)?;
        let ctx = JobContext::new(job.clone(), self.scheduler.clone(), &self.worker_id);

        match tokio::spawn(handler(ctx)).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(HandlerError::new("PANIC", message))
            }
            Err(join_err) => Err(HandlerError::new("CANCELLED", join_err.to_string())),
        }
    }
}

/// Repeats `op` while it fails with a transient error, up to `rounds` calls.
async fn retry_transient<T, F, Fut>(rounds: u32, pause: Duration, mut op: F) -> Result<T, JobsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobsError>>,
{
    let mut round = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && round < rounds => {
                tracing::warn!(round, error = %err, "successor write conflicted, retrying");
                tokio::time::sleep(pause).await;
                round += 1;
            }
            other => return other,
        }
    }
}
