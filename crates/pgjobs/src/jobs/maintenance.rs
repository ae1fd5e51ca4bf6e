use serde_json::json;

use crate::error::JobsError;
use crate::jobs::context::JobContext;
use crate::jobs::model::{JobConfig, WorkerJob, SYSTEM_OWNER};
use crate::jobs::registry::{boxed, HandlerFuture, JobKind};
use crate::jobs::scheduler::Scheduler;

/// Stored type name for the cleanup job.
pub const REMOVE_OLD_JOBS: &str = "remove-old-jobs";

pub const DEFAULT_CLEANUP_CRON: &str = "0 */1 * * * *";

/// Handler for the cleanup cron job. Its own row is excluded from deletion.
pub fn remove_old_jobs(ctx: JobContext) -> HandlerFuture {
    boxed(async move {
        let removed = ctx.scheduler.remove_old_jobs(&[ctx.job.id]).await?;
        if removed > 0 {
            ctx.log.info(&format!("removed {removed} expired jobs"));
        }
        Ok(json!({ "removed": removed }))
    })
}

/// Seeds the cleanup cron job for the system owner. Safe to call on every
/// boot: scheduling cancels the pair's pending row before inserting.
pub async fn seed_cleanup_job<K: JobKind>(
    scheduler: &Scheduler,
    kind: K,
    expression: &str,
) -> Result<WorkerJob, JobsError> {
    scheduler
        .schedule_cron_job(JobConfig::new(kind, SYSTEM_OWNER), expression)
        .await
}
