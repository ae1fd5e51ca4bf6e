//! Supervisory messages between the process manager and its workers.
//!
//! Workers write one JSON object per line to stdout. Only liveness and error
//! signals travel here; job state lives in the database.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::JobsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    WorkerStarted { pid: u32 },
    WorkerShutdown { pid: u32 },
    WorkerError { pid: u32, error: String },
    Heartbeat { pid: u32 },
}

impl WorkerMessage {
    pub fn pid(&self) -> u32 {
        match self {
            WorkerMessage::WorkerStarted { pid }
            | WorkerMessage::WorkerShutdown { pid }
            | WorkerMessage::WorkerError { pid, .. }
            | WorkerMessage::Heartbeat { pid } => *pid,
        }
    }

    pub fn encode(&self) -> Result<String, JobsError> {
        serde_json::to_string(self).map_err(|e| JobsError::Ipc(e.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, JobsError> {
        serde_json::from_str(line.trim()).map_err(|e| JobsError::Ipc(e.to_string()))
    }
}

/// Cloneable handle for sending messages to the parent from any task.
#[derive(Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    pid: u32,
}

impl IpcSender {
    /// False once the writer has stopped.
    pub fn send(&self, msg: WorkerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn started(&self) -> bool {
        self.send(WorkerMessage::WorkerStarted { pid: self.pid })
    }

    pub fn heartbeat(&self) -> bool {
        self.send(WorkerMessage::Heartbeat { pid: self.pid })
    }

    pub fn shutdown(&self) -> bool {
        self.send(WorkerMessage::WorkerShutdown { pid: self.pid })
    }

    pub fn error(&self, error: impl ToString) -> bool {
        self.send(WorkerMessage::WorkerError {
            pid: self.pid,
            error: error.to_string(),
        })
    }
}

/// Spawns the single task that owns `writer`. It finishes after every
/// sender is dropped and the queue is drained.
pub fn spawn_writer<W>(writer: W, pid: u32) -> (IpcSender, JoinHandle<Result<(), JobsError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(msg) = rx.recv().await {
            let mut line = msg.encode()?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    });

    (IpcSender { tx, pid }, handle)
}

/// Channel to the parent over this process's stdout.
pub fn stdout_channel() -> (IpcSender, JoinHandle<Result<(), JobsError>>) {
    spawn_writer(tokio::io::stdout(), std::process::id())
}
