use pgjobs::config::Config;
use pgjobs::db;
use pgjobs::ipc::{self, IpcSender};
use pgjobs::jobs::maintenance::seed_cleanup_job;
use pgjobs::jobs::{JobRunner, JobStore, Scheduler};
use pgjobs::logging;
use pgjobs::supervisor::{CurrentExeSpawner, SupervisorConfig, WorkerPool};
use pgjobs::tx::TxRetryPolicy;

use std::sync::Arc;
use tokio::sync::watch;

mod handlers;
use handlers::{build_registry, AppJob};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "supervise".to_string());
    match mode.as_str() {
        "supervise" => supervise().await,
        "run" => run_worker().await,
        other => anyhow::bail!("unknown mode: {other} (expected `supervise` or `run`)"),
    }
}

fn scheduler_for(cfg: &Config, pool: sqlx::PgPool) -> Scheduler {
    let store = JobStore::new(pool).with_stale_after(cfg.stale_claim_after);
    Scheduler::new(store, TxRetryPolicy::from_config(cfg))
}

/// Parent process: owns migrations and the cleanup job, then keeps
/// `worker_count` children alive until SIGTERM / Ctrl+C.
async fn supervise() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        workers = cfg.worker_count,
        poll_interval_ms = cfg.poll_interval.as_millis() as u64,
        startup_timeout_s = cfg.startup_timeout.as_secs(),
        shutdown_grace_s = cfg.shutdown_grace.as_secs(),
        migrate_on_startup = cfg.migrate_on_startup,
        "pgjobs supervisor starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let scheduler = scheduler_for(&cfg, pool.clone());
    let cleanup = seed_cleanup_job(&scheduler, AppJob::RemoveOldJobs, &cfg.cleanup_cron).await?;
    tracing::info!(job_id = cleanup.id, due = %cleanup.due, "cleanup job scheduled");
    pool.close().await;

    let spawner = CurrentExeSpawner::new(["run"])?;
    let workers = WorkerPool::start(SupervisorConfig::from_config(&cfg), Arc::new(spawner));

    shutdown_signal().await;
    workers.shutdown().await;

    Ok(())
}

/// Child process: runs the worker loop and reports liveness on stdout.
async fn run_worker() -> anyhow::Result<()> {
    let (ipc, writer) = ipc::stdout_channel();

    let result = run_loop(&ipc).await;
    match &result {
        Ok(()) => {
            ipc.shutdown();
        }
        Err(err) => {
            tracing::error!(error = %err, "worker exiting with error");
            ipc.error(format!("{err:#}"));
        }
    }

    drop(ipc);
    if let Err(err) = writer.await? {
        tracing::warn!(error = %err, "ipc writer failed");
    }
    result
}

async fn run_loop(ipc: &IpcSender) -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url).await?;
    let scheduler = scheduler_for(&cfg, pool);

    let runner = JobRunner::new(scheduler, build_registry(), cfg.worker_id.clone())
        .poll_interval(cfg.poll_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let heartbeat = {
        let ipc = ipc.clone();
        let every = cfg.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !ipc.heartbeat() {
                    break;
                }
            }
        })
    };

    ipc.started();
    tracing::info!(worker_id = %cfg.worker_id, pid = std::process::id(), "worker ready");

    let result = runner.run(shutdown_rx).await;
    heartbeat.abort();
    result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
