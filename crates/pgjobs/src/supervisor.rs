//! Process manager for worker children.
//!
//! Each slot runs one child at a time and restarts it when it exits, fails to
//! report `worker-started` in time, or goes quiet past the heartbeat timeout.
//! Children report over stdout using [`crate::ipc::WorkerMessage`] lines.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::Config;
use crate::error::JobsError;
use crate::ipc::WorkerMessage;

/// Builds the command for one worker child.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn command(&self, worker_id: &str) -> Command;
}

/// Re-executes the running binary with fixed arguments.
pub struct CurrentExeSpawner {
    exe: PathBuf,
    args: Vec<OsString>,
}

impl CurrentExeSpawner {
    pub fn new<I, S>(args: I) -> Result<Self, JobsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self {
            exe: std::env::current_exe()?,
            args: args.into_iter().map(Into::into).collect(),
        })
    }
}

impl WorkerSpawner for CurrentExeSpawner {
    fn command(&self, worker_id: &str) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(&self.args).env("PGJOBS_WORKER_ID", worker_id);
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    /// Children get `{worker_id_prefix}-{slot}`.
    pub worker_id_prefix: String,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    /// A child that lived this long resets its slot's backoff.
    pub stable_after: Duration,
}

impl SupervisorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_count: cfg.worker_count.max(1),
            worker_id_prefix: cfg.worker_id.clone(),
            startup_timeout: cfg.startup_timeout,
            shutdown_grace: cfg.shutdown_grace,
            heartbeat_timeout: cfg.heartbeat_timeout,
            restart_backoff_base: cfg.restart_backoff_base,
            restart_backoff_max: cfg.restart_backoff_max,
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Counters shared by every slot.
#[derive(Debug, Default)]
pub struct PoolStats {
    spawned: AtomicU64,
    started: AtomicU64,
    restarts: AtomicU64,
    errors: AtomicU64,
}

impl PoolStats {
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// `worker-started` messages received.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// `worker-error` messages received plus failed spawns.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Delay before the `failures`-th consecutive restart of a slot.
pub fn restart_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    base.saturating_mul(1 << exp).min(max)
}

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawns `worker_count` supervised children. Must be called inside a
    /// tokio runtime.
    pub fn start(cfg: SupervisorConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(PoolStats::default());
        let cfg = Arc::new(cfg);

        tracing::info!(workers = cfg.worker_count, "starting worker pool");

        let slots = (1..=cfg.worker_count)
            .map(|slot| {
                let slot = Slot {
                    worker_id: format!("{}-{}", cfg.worker_id_prefix, slot),
                    cfg: cfg.clone(),
                    spawner: spawner.clone(),
                    stats: stats.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(slot.supervise())
            })
            .collect();

        Self {
            shutdown_tx,
            slots,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    /// Asks every child to stop, waits up to the grace period per child, then
    /// kills whatever is left.
    pub async fn shutdown(self) {
        tracing::info!("stopping worker pool");
        let _ = self.shutdown_tx.send(true);

        for handle in self.slots {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker slot task failed");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

enum ChildEnd {
    Exited(ExitStatus),
    Terminated(&'static str),
    Shutdown,
}

struct Slot {
    worker_id: String,
    cfg: Arc<SupervisorConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    stats: Arc<PoolStats>,
    shutdown: watch::Receiver<bool>,
}

impl Slot {
    async fn supervise(mut self) {
        let mut failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let mut cmd = self.spawner.command(&self.worker_id);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);

            let spawned_at = Instant::now();
            let end = match cmd.spawn() {
                Ok(child) => {
                    self.stats.spawned.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(worker_id = %self.worker_id, pid = child.id(), "worker spawned");
                    self.watch_child(child).await
                }
                Err(err) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(worker_id = %self.worker_id, error = %err, "failed to spawn worker");
                    ChildEnd::Terminated("spawn failed")
                }
            };

            match end {
                ChildEnd::Shutdown => break,
                ChildEnd::Exited(status) => {
                    tracing::warn!(worker_id = %self.worker_id, %status, "worker exited");
                }
                ChildEnd::Terminated(reason) => {
                    tracing::warn!(worker_id = %self.worker_id, reason, "worker terminated");
                }
            }

            if spawned_at.elapsed() >= self.cfg.stable_after {
                failures = 0;
            }
            failures = failures.saturating_add(1);

            let delay = restart_delay(
                self.cfg.restart_backoff_base,
                self.cfg.restart_backoff_max,
                failures,
            );
            tracing::info!(
                worker_id = %self.worker_id,
                failures,
                delay_ms = delay.as_millis() as u64,
                "restarting worker"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn watch_child(&mut self, mut child: Child) -> ChildEnd {
        let Some(stdout) = child.stdout.take() else {
            terminate(&mut child, None, self.cfg.shutdown_grace).await;
            return ChildEnd::Terminated("no stdout pipe");
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;

        let startup_deadline = Instant::now() + self.cfg.startup_timeout;
        let mut started = false;
        let mut last_seen = Instant::now();

        loop {
            let deadline = if !started {
                Some(startup_deadline)
            } else {
                self.cfg.heartbeat_timeout.map(|t| last_seen + t)
            };

            tokio::select! {
                status = child.wait() => {
                    if stdout_open {
                        self.drain(&mut lines).await;
                    }
                    return match status {
                        Ok(status) => ChildEnd::Exited(status),
                        Err(err) => {
                            tracing::error!(worker_id = %self.worker_id, error = %err, "wait on worker failed");
                            ChildEnd::Terminated("wait failed")
                        }
                    };
                }
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        last_seen = Instant::now();
                        if let Some(msg) = self.on_line(&line) {
                            if matches!(msg, WorkerMessage::WorkerStarted { .. }) {
                                started = true;
                            }
                        }
                    }
                    Ok(None) | Err(_) => stdout_open = false,
                },
                _ = wait_until(deadline) => {
                    let reason = if started { "heartbeat timeout" } else { "startup timeout" };
                    tracing::warn!(worker_id = %self.worker_id, reason, "worker unresponsive");
                    terminate(&mut child, stdout_open.then_some(&mut lines), self.cfg.shutdown_grace).await;
                    return ChildEnd::Terminated(reason);
                }
                _ = self.shutdown.changed() => {
                    terminate(&mut child, stdout_open.then_some(&mut lines), self.cfg.shutdown_grace).await;
                    return ChildEnd::Shutdown;
                }
            }
        }
    }

    /// Reads what an exited child left in the pipe, typically its final
    /// `worker-error`.
    async fn drain(&self, lines: &mut Lines<BufReader<ChildStdout>>) {
        let drained = tokio::time::timeout(Duration::from_millis(500), async {
            while let Ok(Some(line)) = lines.next_line().await {
                self.on_line(&line);
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!(worker_id = %self.worker_id, "stdout still open after exit");
        }
    }

    fn on_line(&self, line: &str) -> Option<WorkerMessage> {
        let msg = match WorkerMessage::decode(line) {
            Ok(msg) => msg,
            Err(_) => {
                tracing::debug!(worker_id = %self.worker_id, line, "ignoring non-protocol output");
                return None;
            }
        };

        match &msg {
            WorkerMessage::WorkerStarted { pid } => {
                self.stats.started.fetch_add(1, Ordering::Relaxed);
                tracing::info!(worker_id = %self.worker_id, pid, "worker started");
            }
            WorkerMessage::WorkerShutdown { pid } => {
                tracing::info!(worker_id = %self.worker_id, pid, "worker shut down");
            }
            WorkerMessage::WorkerError { pid, error } => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker_id = %self.worker_id, pid, error = %error, "worker reported error");
            }
            WorkerMessage::Heartbeat { pid } => {
                tracing::trace!(worker_id = %self.worker_id, pid, "heartbeat");
            }
        }
        Some(msg)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM, then SIGKILL once `grace` runs out. Output still arriving on
/// `lines` is logged while waiting.
async fn terminate(
    child: &mut Child,
    mut lines: Option<&mut Lines<BufReader<ChildStdout>>>,
    grace: Duration,
) {
    send_term(child);

    let deadline = Instant::now() + grace;
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::debug!(%status, "worker stopped"),
                    Err(err) => tracing::warn!(error = %err, "wait on worker failed"),
                }
                return;
            }
            line = next_line(&mut lines) => match line {
                Some(line) => match WorkerMessage::decode(&line) {
                    Ok(WorkerMessage::WorkerShutdown { pid }) => tracing::info!(pid, "worker shut down"),
                    Ok(WorkerMessage::WorkerError { pid, error }) => {
                        tracing::error!(pid, error = %error, "worker reported error")
                    }
                    _ => {}
                },
                None => lines = None,
            },
            _ = sleep_until(deadline) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "grace period expired, killing worker");
                if let Err(err) = child.kill().await {
                    tracing::error!(error = %err, "failed to kill worker");
                }
                return;
            }
        }
    }
}

async fn next_line(lines: &mut Option<&mut Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn send_term(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) {
    let _ = child.start_kill();
}
