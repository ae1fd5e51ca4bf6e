use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::jobs::registry::JobKind;

/// Owner id used for infrastructure jobs.
pub const SYSTEM_OWNER: i32 = 0;

/// One row of `worker_jobs`: a single scheduled or completed occurrence.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkerJob {
    pub id: i64,
    pub tag: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    #[sqlx(rename = "user_id")]
    pub owner_id: i32,
    pub data: Value,

    pub due: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub remove_at: DateTime<Utc>,

    pub success: Option<bool>,
    pub result: Option<Value>,

    pub cron_schedule: Option<String>,
    pub auto_reschedule_on_failure: bool,
    /// Milliseconds.
    pub auto_reschedule_on_failure_delay: i32,
    /// Milliseconds.
    pub remove_delay: i32,
    pub rescheduled_from_job: Option<i64>,
    pub persistent: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerJob {
    pub fn is_cron(&self) -> bool {
        self.cron_schedule.is_some()
    }

    /// Pending means unfinished and either unclaimed or claimed longer ago
    /// than `stale_after`.
    pub fn is_pending_at(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.finished.is_some() {
            return false;
        }
        match self.started {
            None => true,
            Some(started) => started < now - stale_after,
        }
    }

    /// Copies data and policy fields into the next occurrence of this job.
    pub fn successor(&self, due: DateTime<Utc>) -> NewWorkerJob {
        NewWorkerJob {
            tag: self.tag.clone(),
            job_type: self.job_type.clone(),
            owner_id: self.owner_id,
            data: self.data.clone(),
            due,
            remove_at: due + Duration::milliseconds(self.remove_delay as i64),
            cron_schedule: self.cron_schedule.clone(),
            auto_reschedule_on_failure: self.auto_reschedule_on_failure,
            auto_reschedule_on_failure_delay: self.auto_reschedule_on_failure_delay,
            remove_delay: self.remove_delay,
            rescheduled_from_job: Some(self.id),
            persistent: self.persistent,
        }
    }
}

/// A row about to be inserted. Built by the scheduler, never by callers.
#[derive(Debug, Clone)]
pub struct NewWorkerJob {
    pub tag: String,
    pub job_type: String,
    pub owner_id: i32,
    pub data: Value,
    pub due: DateTime<Utc>,
    pub remove_at: DateTime<Utc>,
    pub cron_schedule: Option<String>,
    pub auto_reschedule_on_failure: bool,
    pub auto_reschedule_on_failure_delay: i32,
    pub remove_delay: i32,
    pub rescheduled_from_job: Option<i64>,
    pub persistent: bool,
}

/// Caller-facing scheduling request.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_type: String,
    pub owner_id: i32,
    /// Defaults to `"{type}-{owner_id}"`.
    pub tag: Option<String>,
    /// Defaults to now.
    pub due: Option<DateTime<Utc>>,
    pub data: Value,
    pub auto_reschedule_on_failure: bool,
    pub auto_reschedule_on_failure_delay_ms: i32,
    pub remove_delay_ms: i32,
    pub persistent: bool,
}

impl JobConfig {
    pub fn new<K: JobKind>(kind: K, owner_id: i32) -> Self {
        Self::for_type(kind.as_str(), owner_id)
    }

    /// Untyped constructor for operator tooling that only has a type name.
    pub fn for_type(job_type: impl Into<String>, owner_id: i32) -> Self {
        Self {
            job_type: job_type.into(),
            owner_id,
            tag: None,
            due: None,
            data: Value::Object(Default::default()),
            auto_reschedule_on_failure: false,
            auto_reschedule_on_failure_delay_ms: 0,
            remove_delay_ms: 0,
            persistent: false,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn due(mut self, due: DateTime<Utc>) -> Self {
        self.due = Some(due);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn retry_on_failure(mut self, delay_ms: i32) -> Self {
        self.auto_reschedule_on_failure = true;
        self.auto_reschedule_on_failure_delay_ms = delay_ms;
        self
    }

    pub fn remove_delay(mut self, delay_ms: i32) -> Self {
        self.remove_delay_ms = delay_ms;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::JobsError> {
        use crate::error::JobsError;

        if self.job_type.trim().is_empty() {
            return Err(JobsError::Validation("job type must not be empty".into()));
        }
        if self.auto_reschedule_on_failure_delay_ms < 0 {
            return Err(JobsError::Validation(
                "auto reschedule delay must not be negative".into(),
            ));
        }
        if self.remove_delay_ms < 0 {
            return Err(JobsError::Validation("remove delay must not be negative".into()));
        }
        if !self.data.is_object() {
            return Err(JobsError::Validation("job data must be a JSON object".into()));
        }
        Ok(())
    }

    pub(crate) fn into_new_job(
        self,
        due: DateTime<Utc>,
        cron_schedule: Option<String>,
    ) -> NewWorkerJob {
        let tag = self
            .tag
            .unwrap_or_else(|| format!("{}-{}", self.job_type, self.owner_id));
        NewWorkerJob {
            tag,
            job_type: self.job_type,
            owner_id: self.owner_id,
            data: self.data,
            due,
            remove_at: due + Duration::milliseconds(self.remove_delay_ms as i64),
            cron_schedule,
            auto_reschedule_on_failure: self.auto_reschedule_on_failure,
            auto_reschedule_on_failure_delay: self.auto_reschedule_on_failure_delay_ms,
            remove_delay: self.remove_delay_ms,
            rescheduled_from_job: None,
            persistent: self.persistent,
        }
    }
}

/// Row counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}
