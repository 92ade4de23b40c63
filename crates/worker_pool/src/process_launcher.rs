//! Out-of-process workers.
//!
//! The script reference is run as a child process. Envelopes travel as one
//! JSON object per line: controller to worker on stdin, worker to controller
//! on stdout. Stderr is inherited.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::PoolError;
use crate::launcher::{WorkerChannel, WorkerLauncher};
use crate::protocol::Envelope;

#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments passed to every spawned worker process.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&self, script_url: &str) -> Result<WorkerChannel, PoolError> {
        let mut child = Command::new(script_url)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PoolError::LaunchFailure(format!("{}: {}", script_url, err)))?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PoolError::LaunchFailure(format!(
                "{}: stdio not captured",
                script_url
            )));
        };
        let pid = child.id().unwrap_or_default();

        let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<Envelope>();
        let (to_controller_tx, to_controller_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            while let Some(envelope) = to_worker_rx.recv().await {
                let mut line = match envelope.to_json_line() {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!("Worker process {}: unserializable message: {}", pid, err);
                        continue;
                    }
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match Envelope::from_json_line(&line) {
                        Ok(envelope) => {
                            if to_controller_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!("Worker process {}: malformed message: {}", pid, err);
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!("Worker process {}: read failed: {}", pid, err);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            tokio::select! {
                _ = kill_rx => {
                    if let Err(err) = child.kill().await {
                        tracing::debug!("Worker process {}: kill failed: {}", pid, err);
                    }
                }
                status = child.wait() => {
                    tracing::debug!("Worker process {} exited: {:?}", pid, status);
                }
            }
        });

        Ok(WorkerChannel::new(to_worker_tx, to_controller_rx, move || {
            let _ = kill_tx.send(());
        }))
    }
}
