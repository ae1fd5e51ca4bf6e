use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::JobsError;

/// Parses a cron expression. Five-field expressions get a leading `0`
/// seconds field; six and seven field expressions are taken as written.
pub fn parse(expression: &str) -> Result<Schedule, JobsError> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();

    let normalized = match fields {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(JobsError::Validation(format!(
                "cron expression must have 5, 6 or 7 fields, got {n}: {expression:?}"
            )))
        }
    };

    Schedule::from_str(&normalized)
        .map_err(|e| JobsError::Validation(format!("invalid cron expression {expression:?}: {e}")))
}

/// First occurrence strictly after `after`.
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, JobsError> {
    let schedule = parse(expression)?;
    schedule.after(&after).next().ok_or_else(|| {
        JobsError::Validation(format!("cron expression {expression:?} has no upcoming occurrence"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn every_second_moves_to_the_next_second() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = next_after("*/1 * * * * *", at).unwrap();
        assert_eq!(next, at + chrono::Duration::seconds(1));
    }

    #[test]
    fn five_field_expressions_run_on_the_minute() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();
        let next = next_after("*/5 * * * *", at).unwrap();
        assert_eq!(next.minute(), 5);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn malformed_expressions_are_validation_errors() {
        assert!(matches!(parse("not a cron"), Err(JobsError::Validation(_))));
        assert!(matches!(
            parse("99 * * * * *"),
            Err(JobsError::Validation(_))
        ));
        assert!(matches!(parse(""), Err(JobsError::Validation(_))));
    }
}
