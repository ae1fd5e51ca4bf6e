use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::Level;

use crate::error::JobsError;
use crate::jobs::model::WorkerJob;
use crate::jobs::scheduler::Scheduler;

/// Error returned by a job handler. Always recorded on the row as
/// `result.error`, never propagated out of the worker loop.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: &'static str,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("HANDLER_ERROR", message)
    }

    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self::new("BAD_PAYLOAD", message)
    }

    /// The JSON written to `worker_jobs.result` for a failed run.
    pub fn to_result(&self) -> Value {
        json!({
            "error": self.message,
            "code": self.code,
        })
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<JobsError> for HandlerError {
    fn from(err: JobsError) -> Self {
        let code = match &err {
            JobsError::UnknownJobType(_) => "UNKNOWN_JOB_TYPE",
            JobsError::Validation(_) => "VALIDATION",
            JobsError::NotFound(_) => "NOT_FOUND",
            JobsError::TransactionSerialization { .. } => "SERIALIZATION",
            _ => "PERSISTENCE",
        };
        Self::new(code, err.to_string())
    }
}

/// Structured logger handed to handlers: `{level, category, message, meta}`.
#[derive(Debug, Clone)]
pub struct JobLogger {
    category: String,
    job_id: i64,
    worker_id: String,
}

impl JobLogger {
    pub fn new(category: impl Into<String>, job_id: i64, worker_id: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            job_id,
            worker_id: worker_id.into(),
        }
    }

    pub fn log(&self, level: Level, message: &str, meta: &Value) {
        let category = self.category.as_str();
        let worker_id = self.worker_id.as_str();
        let job_id = self.job_id;

        match level {
            Level::ERROR => {
                tracing::error!(category, job_id, worker_id, meta = %meta, "{message}")
            }
            Level::WARN => {
                tracing::warn!(category, job_id, worker_id, meta = %meta, "{message}")
            }
            Level::INFO => {
                tracing::info!(category, job_id, worker_id, meta = %meta, "{message}")
            }
            Level::DEBUG => {
                tracing::debug!(category, job_id, worker_id, meta = %meta, "{message}")
            }
            _ => {
                tracing::trace!(category, job_id, worker_id, meta = %meta, "{message}")
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.log(Level::INFO, message, &Value::Null);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::WARN, message, &Value::Null);
    }

    pub fn error(&self, message: &str, meta: &Value) {
        self.log(Level::ERROR, message, meta);
    }
}

/// Everything a handler gets: its row, a logger and shared resources.
#[derive(Clone)]
pub struct JobContext {
    pub job: WorkerJob,
    pub log: JobLogger,
    pub scheduler: Scheduler,
    pub worker_id: String,
}

impl JobContext {
    pub fn new(job: WorkerJob, scheduler: Scheduler, worker_id: &str) -> Self {
        let log = JobLogger::new(job.job_type.clone(), job.id, worker_id);
        Self {
            job,
            log,
            scheduler,
            worker_id: worker_id.to_string(),
        }
    }

    pub fn db(&self) -> &PgPool {
        self.scheduler.store().pool()
    }

    /// Deserializes the row's `data` payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.job.data.clone())
            .map_err(|e| HandlerError::bad_payload(e.to_string()))
    }
}
