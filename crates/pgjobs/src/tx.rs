//! Serializable transactions with conflict retry.
//!
//! Every multi-statement write against `worker_jobs` goes through
//! [`with_transaction`]. Serialization failures and deadlocks are retried with
//! exponential backoff plus jitter; anything else propagates untouched.

use crate::config::Config;
use crate::error::{is_serialization_conflict, JobsError};
use rand::Rng;
use sqlx::{PgConnection, PgPool};
use std::{future::Future, pin::Pin, time::Duration};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct TxRetryPolicy {
    /// Total invocations of the body, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Jitter upper bound as a fraction of `base_delay`.
    pub jitter_pct: f64,
}

impl Default for TxRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_millis(20),
            jitter_pct: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    Exhausted,
    GiveUp,
}

impl TxRetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.tx_max_attempts.max(1),
            base_delay: cfg.tx_base_delay,
            ..Self::default()
        }
    }

    /// `base * 2^retry_no` plus up to `jitter_pct * base` of random jitter.
    /// `retry_no` is zero for the first retry.
    pub fn delay_for(&self, retry_no: u32, rng: &mut impl Rng) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let pow2 = 1_u64.checked_shl(retry_no).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(pow2);

        let jitter_cap = base_ms as f64 * self.jitter_pct.max(0.0);
        let jitter_ms = if jitter_cap > 0.0 {
            rng.gen_range(0.0..=jitter_cap)
        } else {
            0.0
        };

        Duration::from_millis(delay_ms) + Duration::from_secs_f64(jitter_ms / 1000.0)
    }

    /// What to do after the `attempt`-th invocation (1-based) failed with `err`.
    pub fn decide(&self, attempt: u32, err: &JobsError) -> RetryDecision {
        if !is_retryable(err) {
            return RetryDecision::GiveUp;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let mut rng = rand::thread_rng();
        RetryDecision::Retry(self.delay_for(attempt - 1, &mut rng))
    }
}

/// Conflicts are retryable; an already-exhausted inner retry is not.
pub fn is_retryable(err: &JobsError) -> bool {
    if matches!(err, JobsError::TransactionSerialization { .. }) {
        return false;
    }
    is_serialization_conflict(err)
}

/// Where a unit of work runs: a pool (open a fresh transaction) or a
/// connection that is already inside one.
pub enum Db<'c> {
    Pool(&'c PgPool),
    Tx(&'c mut PgConnection),
}

/// Runs `body` inside a SERIALIZABLE transaction, retrying on conflict.
///
/// Given a [`Db::Tx`] handle the body runs exactly once against the caller's
/// transaction; retrying there would re-run only part of the outer work.
pub async fn with_transaction<T, F>(
    db: Db<'_>,
    policy: &TxRetryPolicy,
    mut body: F,
) -> Result<T, JobsError>
where
    T: Send,
    F: for<'t> FnMut(&'t mut PgConnection) -> BoxFuture<'t, Result<T, JobsError>> + Send,
{
    let pool = match db {
        Db::Tx(conn) => return body(conn).await,
        Db::Pool(pool) => pool,
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let err = match run_serializable(pool, &mut body).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "transaction committed after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        match policy.decide(attempt, &err) {
            RetryDecision::Retry(delay) => {
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "serialization conflict, retrying transaction"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::Exhausted => {
                tracing::warn!(attempts = attempt, error = %err, "transaction retries exhausted");
                return Err(JobsError::TransactionSerialization {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            RetryDecision::GiveUp => return Err(err),
        }
    }
}

async fn run_serializable<T, F>(pool: &PgPool, body: &mut F) -> Result<T, JobsError>
where
    F: for<'t> FnMut(&'t mut PgConnection) -> BoxFuture<'t, Result<T, JobsError>>,
{
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;

    // dropping `tx` on the error path rolls it back
    let value = body(&mut *tx).await?;
    tx.commit().await?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn conflict() -> JobsError {
        JobsError::Persistence(sqlx::Error::Protocol(
            "could not serialize access due to concurrent update".into(),
        ))
    }

    #[test]
    fn delay_doubles_and_jitter_stays_under_half_base() {
        let policy = TxRetryPolicy {
            max_attempts: 7,
            base_delay: Duration::from_millis(100),
            jitter_pct: 0.5,
        };
        let mut rng = StdRng::seed_from_u64(7);

        for retry_no in 0..6 {
            let d = policy.delay_for(retry_no, &mut rng);
            let floor = Duration::from_millis(100 * (1 << retry_no));
            assert!(d >= floor, "retry {retry_no}: {d:?} < {floor:?}");
            assert!(d <= floor + Duration::from_millis(50), "retry {retry_no}: {d:?}");
        }
    }

    #[test]
    fn no_jitter_is_deterministic() {
        let policy = TxRetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            jitter_pct: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay_for(2, &mut rng), Duration::from_millis(40));
    }

    #[test]
    fn conflicts_retry_until_the_seventh_attempt() {
        let policy = TxRetryPolicy::default();
        for attempt in 1..7 {
            assert!(matches!(
                policy.decide(attempt, &conflict()),
                RetryDecision::Retry(_)
            ));
        }
        assert_eq!(policy.decide(7, &conflict()), RetryDecision::Exhausted);
    }

    #[test]
    fn other_errors_give_up_immediately() {
        let policy = TxRetryPolicy::default();
        assert_eq!(
            policy.decide(1, &JobsError::NotFound(1)),
            RetryDecision::GiveUp
        );
        let exhausted = JobsError::TransactionSerialization {
            attempts: 7,
            source: Box::new(conflict()),
        };
        assert_eq!(policy.decide(1, &exhausted), RetryDecision::GiveUp);
    }
}
