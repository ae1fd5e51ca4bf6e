mod common;

use common::{count_rows, scheduler, setup_db, TestJob};
use pgjobs::jobs::JobConfig;
use pgjobs::tx::{with_transaction, Db, TxRetryPolicy};
use pgjobs::JobsError;
use serial_test::serial;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_policy() -> TxRetryPolicy {
    TxRetryPolicy {
        base_delay: Duration::from_millis(1),
        ..TxRetryPolicy::default()
    }
}

fn conflict() -> JobsError {
    JobsError::Persistence(sqlx::Error::Protocol(
        "could not serialize access due to concurrent update".into(),
    ))
}

/// Runs a body that conflicts on every call before `succeed_on`.
async fn run_conflicting(
    db: Db<'_>,
    succeed_on: u32,
) -> (Result<i32, JobsError>, u32) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = with_transaction(db, &fast_policy(), move |conn| {
        let counter = counter.clone();
        Box::pin(async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < succeed_on {
                return Err(conflict());
            }
            let v: i32 = sqlx::query_scalar("SELECT 7").fetch_one(&mut *conn).await?;
            Ok(v)
        })
    })
    .await;

    (result, calls.load(Ordering::SeqCst))
}

#[tokio::test]
#[serial]
async fn conflicts_are_retried_until_success() {
    let pool = setup_db().await;

    for n in [1, 2, 7] {
        let (result, calls) = run_conflicting(Db::Pool(&pool), n).await;
        assert_eq!(result.unwrap(), 7, "succeed_on={n}");
        assert_eq!(calls, n);
    }
}

#[tokio::test]
#[serial]
async fn retries_stop_after_seven_attempts() {
    let pool = setup_db().await;

    let (result, calls) = run_conflicting(Db::Pool(&pool), 8).await;
    assert_eq!(calls, 7);
    match result {
        Err(JobsError::TransactionSerialization { attempts, .. }) => assert_eq!(attempts, 7),
        other => panic!("expected TransactionSerialization, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn nested_handle_runs_the_body_once() {
    let pool = setup_db().await;
    let mut tx = pool.begin().await.unwrap();

    let (result, calls) = run_conflicting(Db::Tx(&mut *tx), 2).await;
    assert_eq!(calls, 1);
    assert!(matches!(result, Err(JobsError::Persistence(_))));
}

#[tokio::test]
#[serial]
async fn non_conflict_errors_are_not_retried() {
    let pool = setup_db().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<(), JobsError> = with_transaction(Db::Pool(&pool), &fast_policy(), move |_conn| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(JobsError::NotFound(1))
        })
    })
    .await;

    assert!(matches!(result, Err(JobsError::NotFound(1))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn scheduling_joins_the_callers_transaction() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);

    let mut tx = pool.begin().await.unwrap();
    let job = scheduler
        .schedule_job_with(Db::Tx(&mut *tx), JobConfig::new(TestJob::Heartbeat, 21))
        .await
        .unwrap();
    assert!(job.id > 0);
    tx.rollback().await.unwrap();

    assert_eq!(count_rows(&pool, "heartbeat", 21).await, 0);
}

async fn read_then_insert(pool: PgPool, owner_id: i32) -> Result<i64, JobsError> {
    with_transaction(Db::Pool(&pool), &fast_policy(), move |conn| {
        Box::pin(async move {
            let seen: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM worker_jobs WHERE type = 'counter'")
                .fetch_one(&mut *conn)
                .await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            sqlx::query(
                r#"
                INSERT INTO worker_jobs (tag, type, user_id, due, remove_at)
                VALUES ('counter', 'counter', $1, now(), now())
                "#,
            )
            .bind(owner_id)
            .execute(&mut *conn)
            .await?;
            Ok(seen)
        })
    })
    .await
}

#[tokio::test]
#[serial]
async fn real_serialization_failures_are_retried() {
    let pool = setup_db().await;

    let a = tokio::spawn(read_then_insert(pool.clone(), 1));
    let b = tokio::spawn(read_then_insert(pool.clone(), 2));
    let mut seen = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    seen.sort();

    // serial order: one transaction saw the other's row
    assert_eq!(seen, vec![0, 1]);
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM worker_jobs WHERE type = 'counter'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total, 2);
}
