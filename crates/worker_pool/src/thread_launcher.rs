//! In-process workers.
//!
//! Each worker runs a registered script on a dedicated OS thread with its own
//! current-thread Tokio runtime, so worker code may be `!Send`. The only link
//! to the controller is the pair of channels inside [`WorkerScope`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use futures_util::future::LocalBoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::PoolError;
use crate::launcher::{WorkerChannel, WorkerLauncher};
use crate::protocol::{Envelope, Transferables, WorkerMessage};

type WorkerScript = Arc<dyn Fn(WorkerScope) -> LocalBoxFuture<'static, ()> + Send + Sync>;

/// Launcher resolving script references against registered entry points.
#[derive(Clone, Default)]
pub struct ThreadLauncher {
    scripts: HashMap<String, WorkerScript>,
    spawned: Arc<AtomicUsize>,
}

impl ThreadLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` as the worker program for `script_url`.
    pub fn with_script<F, Fut>(mut self, script_url: impl Into<String>, entry: F) -> Self
    where
        F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let script: WorkerScript =
            Arc::new(move |scope: WorkerScope| -> LocalBoxFuture<'static, ()> {
                Box::pin(entry(scope))
            });
        self.scripts.insert(script_url.into(), script);
        self
    }

    /// Number of worker threads started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn spawn(&self, script_url: &str) -> Result<WorkerChannel, PoolError> {
        let script = self
            .scripts
            .get(script_url)
            .cloned()
            .ok_or_else(|| PoolError::LaunchFailure(format!("unknown worker script {}", script_url)))?;

        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        let (to_controller_tx, to_controller_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = watch::channel(false);
        let worker_id = self.spawned.fetch_add(1, Ordering::Relaxed);

        let scope = WorkerScope {
            outgoing: to_controller_tx,
            incoming: to_worker_rx,
            terminated: terminate_rx,
        };

        thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!("Worker {} failed to create runtime: {}", worker_id, err);
                        return;
                    }
                };
                tracing::debug!("Worker {} started", worker_id);
                rt.block_on(script(scope));
                tracing::debug!("Worker {} shutting down", worker_id);
            })
            .map_err(|err| PoolError::LaunchFailure(err.to_string()))?;

        Ok(WorkerChannel::new(to_worker_tx, to_controller_rx, move || {
            let _ = terminate_tx.send(true);
        }))
    }
}

/// Worker-side end of the message channel.
pub struct WorkerScope {
    outgoing: mpsc::UnboundedSender<Envelope>,
    incoming: mpsc::UnboundedReceiver<Envelope>,
    terminated: watch::Receiver<bool>,
}

impl WorkerScope {
    /// Next message from the controller; `None` once terminated.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.is_terminated() {
            return None;
        }
        tokio::select! {
            envelope = self.incoming.recv() => envelope,
            _ = self.terminated.wait_for(|terminated| *terminated) => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    pub fn post(&self, message: WorkerMessage) -> bool {
        self.post_with_transfer(message, Vec::new())
    }

    pub fn post_with_transfer(&self, message: WorkerMessage, transfer: Transferables) -> bool {
        self.outgoing
            .send(Envelope::with_transfer(message, transfer))
            .is_ok()
    }

    /// Announce that `service` is ready on this worker.
    pub fn initialized(&self, service: impl Into<String>) -> bool {
        self.post(WorkerMessage::Initialized {
            service: service.into(),
        })
    }

    /// Forward a log line to the controller.
    pub fn log(&self, level: u8, message: impl Into<Value>) -> bool {
        self.post(WorkerMessage::Log {
            level,
            message: vec![message.into()],
        })
    }
}
