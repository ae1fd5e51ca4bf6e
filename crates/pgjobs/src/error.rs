use std::error::Error as StdError;

/// Errors surfaced by the job store, scheduler, worker loop and supervisor.
#[derive(Debug, thiserror::Error)]
pub enum JobsError {
    /// Malformed scheduling input. Raised before anything is written.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("worker job not found: id={0}")]
    NotFound(i64),

    /// A due row names a type this build has no handler for.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Serialization conflicts kept happening until the retry budget ran out.
    #[error("transaction serialization failed after {attempts} attempts: {source}")]
    TransactionSerialization {
        attempts: u32,
        #[source]
        source: Box<JobsError>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ipc error: {0}")]
    Ipc(String),
}

impl JobsError {
    /// True for errors that only mean "try the next cycle".
    pub fn is_transient(&self) -> bool {
        matches!(self, JobsError::TransactionSerialization { .. })
    }
}

/// SQLSTATE codes Postgres uses for serialization failures and deadlocks.
pub const CONFLICT_SQLSTATES: &[&str] = &["40001", "40P01"];

const CONFLICT_MESSAGES: &[&str] = &[
    "could not serialize access",
    "serialization failure",
    "deadlock detected",
];

/// Walks `err` and its `source()` chain looking for a serialization conflict
/// or deadlock, either by SQLSTATE or by the server's message text.
pub fn is_serialization_conflict(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    let mut depth = 0;

    while let Some(e) = current {
        if let Some(sqlx::Error::Database(db)) = e.downcast_ref::<sqlx::Error>() {
            if let Some(code) = db.code() {
                if CONFLICT_SQLSTATES.contains(&code.as_ref()) {
                    return true;
                }
            }
        }

        let text = e.to_string().to_lowercase();
        if CONFLICT_MESSAGES.iter().any(|m| text.contains(m)) {
            return true;
        }

        depth += 1;
        if depth > 8 {
            break;
        }
        current = e.source();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_conflict_by_message() {
        let err = JobsError::Persistence(sqlx::Error::Protocol(
            "could not serialize access due to read/write dependencies among transactions".into(),
        ));
        assert!(is_serialization_conflict(&err));
    }

    #[test]
    fn detects_conflict_in_wrapped_cause() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "deadlock detected");
        let err = JobsError::Persistence(sqlx::Error::Io(inner));
        assert!(is_serialization_conflict(&err));
    }

    #[test]
    fn ordinary_errors_are_not_conflicts() {
        let err = JobsError::Persistence(sqlx::Error::RowNotFound);
        assert!(!is_serialization_conflict(&err));
        assert!(!is_serialization_conflict(&JobsError::NotFound(7)));
        assert!(!is_serialization_conflict(&JobsError::Validation(
            "bad cron".into()
        )));
    }
}
