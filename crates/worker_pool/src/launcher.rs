use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::PoolError;
use crate::protocol::Envelope;

type Terminate = Box<dyn FnOnce() + Send>;

/// Creates isolated execution contexts from a script reference.
///
/// `spawn` must return without waiting for the worker to come up; liveness is
/// awaited by [`launch_worker`] under the configured timeout. A synchronous
/// failure to create the context is reported as [`PoolError::LaunchFailure`].
pub trait WorkerLauncher: Send + Sync + 'static {
    fn spawn(&self, script_url: &str) -> Result<WorkerChannel, PoolError>;
}

/// Controller side of a freshly spawned worker.
pub struct WorkerChannel {
    outgoing: mpsc::UnboundedSender<Envelope>,
    incoming: mpsc::UnboundedReceiver<Envelope>,
    terminate: Terminate,
}

impl WorkerChannel {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Envelope>,
        incoming: mpsc::UnboundedReceiver<Envelope>,
        terminate: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            terminate: Box::new(terminate),
        }
    }
}

/// A worker that delivered its liveness message in time.
pub(crate) struct LaunchedWorker {
    pub outgoing: mpsc::UnboundedSender<Envelope>,
    pub incoming: mpsc::UnboundedReceiver<Envelope>,
    pub terminate: Terminate,
    /// The liveness message itself, still to be routed like any other.
    pub first: Envelope,
}

/// Spawn one worker and wait up to `timeout` for its first message.
pub(crate) async fn launch_worker(
    launcher: &dyn WorkerLauncher,
    script_url: &str,
    timeout: Duration,
) -> Result<LaunchedWorker, PoolError> {
    let WorkerChannel {
        outgoing,
        mut incoming,
        terminate,
    } = launcher.spawn(script_url)?;

    match tokio::time::timeout(timeout, incoming.recv()).await {
        Ok(Some(first)) => Ok(LaunchedWorker {
            outgoing,
            incoming,
            terminate,
            first,
        }),
        Ok(None) => {
            terminate();
            Err(PoolError::LaunchFailure(format!(
                "{} exited before sending its first message",
                script_url
            )))
        }
        Err(_) => {
            terminate();
            Err(PoolError::InitializationTimeout(timeout))
        }
    }
}

// ========== Worker Handle ==========

/// Controller-owned handle to one live worker.
pub(crate) struct WorkerHandle {
    index: usize,
    outgoing: mpsc::UnboundedSender<Envelope>,
    terminate: Option<Terminate>,
    alive: bool,
}

impl WorkerHandle {
    pub fn new(
        index: usize,
        outgoing: mpsc::UnboundedSender<Envelope>,
        terminate: Terminate,
    ) -> Self {
        Self {
            index,
            outgoing,
            terminate: Some(terminate),
            alive: true,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Returns false when the worker can no longer receive messages.
    pub fn post(&self, envelope: Envelope) -> bool {
        if !self.alive {
            return false;
        }
        self.outgoing.send(envelope).is_ok()
    }

    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    pub fn terminate(&mut self) {
        self.alive = false;
        if let Some(terminate) = self.terminate.take() {
            tracing::debug!("Terminating worker {}", self.index);
            terminate();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}
