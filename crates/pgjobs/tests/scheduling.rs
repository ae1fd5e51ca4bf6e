mod common;

use chrono::{Duration, Utc};
use common::{count_rows, scheduler, setup_db, TestJob};
use pgjobs::jobs::store::cancelled_result;
use pgjobs::jobs::JobConfig;
use pgjobs::JobsError;
use serde_json::json;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn rescheduling_a_pair_cancels_the_previous_pending_job() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);
    let store = scheduler.store();

    let mut ids = Vec::new();
    for n in 0..3 {
        let job = scheduler
            .schedule_job(JobConfig::new(TestJob::SendWelcomeEmail, 42).data(json!({ "n": n })))
            .await
            .unwrap();
        ids.push(job.id);
    }
    // a different owner is untouched
    let other = scheduler
        .schedule_job(JobConfig::new(TestJob::SendWelcomeEmail, 7))
        .await
        .unwrap();

    for id in &ids[..2] {
        let row = store.get_by_id(*id).await.unwrap().unwrap();
        assert!(row.finished.is_some());
        assert_eq!(row.success, Some(false));
        assert_eq!(row.result, Some(cancelled_result()));
    }

    let latest = store.get_by_id(ids[2]).await.unwrap().unwrap();
    assert!(latest.finished.is_none());
    assert_eq!(latest.tag, "sendWelcomeEmail-42");
    assert_eq!(latest.data, json!({ "n": 2 }));

    assert!(store.get_by_id(other.id).await.unwrap().unwrap().finished.is_none());
    assert_eq!(store.count_pending().await.unwrap(), 2);
}

#[tokio::test]
#[serial]
async fn schedule_job_respects_due_and_remove_delay() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);

    let due = Utc::now() + Duration::minutes(5);
    let job = scheduler
        .schedule_job(
            JobConfig::new(TestJob::Heartbeat, 1)
                .due(due)
                .remove_delay(60_000)
                .tag("custom")
                .persistent(),
        )
        .await
        .unwrap();

    assert_eq!(job.tag, "custom");
    assert!(job.persistent);
    assert!((job.due - due).num_milliseconds().abs() < 5);
    assert_eq!((job.remove_at - job.due).num_milliseconds(), 60_000);
    assert!(job.cron_schedule.is_none());
}

#[tokio::test]
#[serial]
async fn cron_job_first_due_is_the_next_occurrence() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);

    let before = Utc::now();
    let job = scheduler
        .schedule_cron_job(JobConfig::new(TestJob::Heartbeat, 0), "0 0 * * *")
        .await
        .unwrap();

    assert_eq!(job.cron_schedule.as_deref(), Some("0 0 * * *"));
    assert!(job.due > before);
    assert!(job.due <= before + Duration::days(1));
    assert_eq!(job.due.format("%H:%M:%S").to_string(), "00:00:00");
}

#[tokio::test]
#[serial]
async fn invalid_input_is_rejected_before_any_write() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);

    // an existing pending row must survive the failed call
    scheduler
        .schedule_job(JobConfig::new(TestJob::Heartbeat, 3))
        .await
        .unwrap();

    let err = scheduler
        .schedule_cron_job(JobConfig::new(TestJob::Heartbeat, 3), "not a cron")
        .await
        .unwrap_err();
    assert!(matches!(err, JobsError::Validation(_)));

    let err = scheduler
        .schedule_job(JobConfig::new(TestJob::Heartbeat, 3).data(json!("scalar")))
        .await
        .unwrap_err();
    assert!(matches!(err, JobsError::Validation(_)));

    assert_eq!(count_rows(&pool, "heartbeat", 3).await, 1);
    assert_eq!(scheduler.store().count_pending().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn cancel_jobs_cancels_pending_and_ends_running_cron_chain() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);
    let store = scheduler.store();

    let pending = scheduler
        .schedule_job(JobConfig::new(TestJob::SendWelcomeEmail, 9))
        .await
        .unwrap();
    let cron = scheduler
        .schedule_cron_job(JobConfig::new(TestJob::Heartbeat, 9), "*/1 * * * * *")
        .await
        .unwrap();
    // the cron occurrence is in flight
    store.mark_started(cron.id).await.unwrap();

    assert_eq!(scheduler.cancel_jobs("sendWelcomeEmail", 9).await.unwrap(), 1);
    assert_eq!(scheduler.cancel_jobs("heartbeat", 9).await.unwrap(), 0);

    let pending = store.get_by_id(pending.id).await.unwrap().unwrap();
    assert_eq!(pending.success, Some(false));

    let running = store.get_by_id(cron.id).await.unwrap().unwrap();
    assert!(running.finished.is_none(), "running job is not interrupted");
    assert!(running.cron_schedule.is_none(), "chain is cut");

    let done = store.mark_succeeded(running.id, None).await.unwrap();
    assert!(scheduler.reschedule_cron_job(&done).await.unwrap().is_none());
    assert_eq!(count_rows(&pool, "heartbeat", 9).await, 1);
}

#[tokio::test]
#[serial]
async fn cancel_between_completion_and_reschedule_ends_the_chain() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);
    let store = scheduler.store();

    let cron = scheduler
        .schedule_cron_job(JobConfig::new(TestJob::Heartbeat, 11), "*/1 * * * * *")
        .await
        .unwrap();
    store.mark_started(cron.id).await.unwrap();
    let done = store.mark_succeeded(cron.id, None).await.unwrap();
    assert!(done.cron_schedule.is_some());

    assert_eq!(scheduler.cancel_jobs("heartbeat", 11).await.unwrap(), 0);
    let row = store.get_by_id(cron.id).await.unwrap().unwrap();
    assert!(row.cron_schedule.is_none());

    // the in-memory copy still carries the schedule
    assert!(scheduler.reschedule_cron_job(&done).await.unwrap().is_none());
    assert_eq!(count_rows(&pool, "heartbeat", 11).await, 1);
    assert_eq!(store.count_pending().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn cron_reschedule_yields_to_a_newer_schedule() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);
    let store = scheduler.store();

    let first = scheduler
        .schedule_cron_job(JobConfig::new(TestJob::Heartbeat, 5), "*/1 * * * * *")
        .await
        .unwrap();
    store.mark_started(first.id).await.unwrap();

    let replacement = scheduler
        .schedule_cron_job(JobConfig::new(TestJob::Heartbeat, 5), "0 0 * * *")
        .await
        .unwrap();

    let done = store.mark_succeeded(first.id, None).await.unwrap();
    assert!(scheduler.reschedule_cron_job(&done).await.unwrap().is_none());

    let pending = store.get_next_pending().await.unwrap().unwrap();
    assert_eq!(pending.id, replacement.id);
    assert_eq!(count_rows(&pool, "heartbeat", 5).await, 2);
}

#[tokio::test]
#[serial]
async fn owner_listing_filters_by_type() {
    let pool = setup_db().await;
    let scheduler = scheduler(&pool);

    scheduler.schedule_job(JobConfig::new(TestJob::Heartbeat, 11)).await.unwrap();
    scheduler.schedule_job(JobConfig::new(TestJob::Flaky, 11)).await.unwrap();
    scheduler.schedule_job(JobConfig::new(TestJob::Flaky, 12)).await.unwrap();

    let store = scheduler.store();
    assert_eq!(store.list_for_owner(None, 11, 10).await.unwrap().len(), 2);
    let flaky = store.list_for_owner(Some("flaky"), 11, 10).await.unwrap();
    assert_eq!(flaky.len(), 1);
    assert_eq!(flaky[0].owner_id, 11);
    assert_eq!(store.list_recent(10).await.unwrap().len(), 3);
}
