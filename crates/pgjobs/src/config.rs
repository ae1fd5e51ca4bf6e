use std::time::Duration;

use crate::jobs::maintenance::DEFAULT_CLEANUP_CRON;

/// Runtime configuration, loaded once from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub stale_claim_after: Duration,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub heartbeat_interval: Duration,
    /// `None` disables heartbeat-based liveness kills.
    pub heartbeat_timeout: Option<Duration>,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    pub tx_max_attempts: u32,
    pub tx_base_delay: Duration,
    pub migrate_on_startup: bool,
    pub cleanup_cron: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("PGJOBS_WORKER_ID", "WORKER_ID")
            .unwrap_or_else(|| "worker-1".to_string());

        let worker_count = match env_or_fallback("PGJOBS_WORKER_COUNT", "WORKER_COUNT") {
            Some(v) => parse_worker_count(&v)?,
            None => 1,
        };

        let heartbeat_timeout_secs = env_u64("PGJOBS_HEARTBEAT_TIMEOUT_SECS").unwrap_or(30);

        let tx_max_attempts = env_u64("PGJOBS_TX_MAX_ATTEMPTS")
            .map(|n| n.clamp(1, 50) as u32)
            .unwrap_or(7);

        Ok(Self {
            database_url,
            worker_id,
            worker_count,
            poll_interval: Duration::from_millis(env_u64("PGJOBS_POLL_INTERVAL_MS").unwrap_or(1000)),
            stale_claim_after: Duration::from_secs(env_u64("PGJOBS_STALE_CLAIM_SECS").unwrap_or(3600)),
            startup_timeout: Duration::from_secs(env_u64("PGJOBS_STARTUP_TIMEOUT_SECS").unwrap_or(10)),
            shutdown_grace: Duration::from_secs(env_u64("PGJOBS_SHUTDOWN_GRACE_SECS").unwrap_or(30)),
            heartbeat_interval: Duration::from_secs(
                env_u64("PGJOBS_HEARTBEAT_INTERVAL_SECS").unwrap_or(5).max(1),
            ),
            heartbeat_timeout: (heartbeat_timeout_secs > 0)
                .then(|| Duration::from_secs(heartbeat_timeout_secs)),
            restart_backoff_base: Duration::from_millis(
                env_u64("PGJOBS_RESTART_BACKOFF_BASE_MS").unwrap_or(250),
            ),
            restart_backoff_max: Duration::from_millis(
                env_u64("PGJOBS_RESTART_BACKOFF_MAX_MS").unwrap_or(5000),
            ),
            tx_max_attempts,
            tx_base_delay: Duration::from_millis(env_u64("PGJOBS_TX_BASE_DELAY_MS").unwrap_or(20)),
            migrate_on_startup: env_bool("PGJOBS_MIGRATE_ON_STARTUP").unwrap_or(false),
            cleanup_cron: std::env::var("PGJOBS_CLEANUP_CRON")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CLEANUP_CRON.to_string()),
        })
    }
}

/// `"auto"` / `"cpus"` means one worker per available core.
pub fn parse_worker_count(value: &str) -> anyhow::Result<usize> {
    let v = value.trim().to_lowercase();
    if matches!(v.as_str(), "auto" | "cpus") {
        return Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1));
    }

    let n: usize = v
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid worker count: {value}"))?;
    if n == 0 {
        anyhow::bail!("worker count must be at least 1");
    }
    Ok(n)
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
