//! Concurrent worker set.
//!
//! A fixed pool of isolated workers serving RPC-style requests. Requests go to
//! the most recently idle worker (LIFO, so rarely used workers stay cold and
//! can be reclaimed); when every worker is busy they wait in a priority queue
//! that is drained whenever a worker answers.
//!
//! Architecture:
//! - `ConcurrentWorkerSet` is a cloneable handle that sends commands
//! - one coordinator task owns every table and is the only mutator
//! - each worker's messages are pumped into the coordinator's event channel
//! - continuations are oneshot senders resolved exactly once by the coordinator

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::try_join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::WorkerSetOptions;
use crate::error::PoolError;
use crate::launcher::{LaunchedWorker, WorkerHandle, WorkerLauncher, launch_worker};
use crate::pending::{PendingRequests, Reply, ReplySender};
use crate::protocol::{Envelope, Transferables, WorkerMessage, emit_worker_log};
use crate::queue::{QueuedRequest, RequestQueue};
use crate::ready::{ReadySignals, ReadyWaiter};
use crate::token::RequestToken;

// ========== Events ==========

/// Unidirectional message a worker sent for a service.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker: usize,
    pub service: String,
    pub payload: Value,
    pub transfer: Transferables,
}

/// Callback receiving the events of one service.
///
/// Runs on the coordinator task; it must not block.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: WorkerEvent);
}

impl<F> EventListener for F
where
    F: Fn(WorkerEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: WorkerEvent) {
        self(event)
    }
}

// ========== Public Handle ==========

/// Handle to a pool of workers. Clones share the same pool; the pool is
/// destroyed once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ConcurrentWorkerSet {
    commands: mpsc::UnboundedSender<Command>,
    worker_count: Arc<AtomicUsize>,
}

impl ConcurrentWorkerSet {
    /// Create the set and start its workers.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(options: WorkerSetOptions, launcher: impl WorkerLauncher) -> Self {
        let set = Self::new_stopped(options, launcher);
        let (reply, _) = oneshot::channel();
        let _ = set.commands.send(Command::Start {
            options: None,
            reply,
        });
        set
    }

    /// Create the set without starting it; call [`ConcurrentWorkerSet::start`]
    /// or [`ConcurrentWorkerSet::add_reference`] to launch workers.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new_stopped(options: WorkerSetOptions, launcher: impl WorkerLauncher) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker_count = Arc::new(AtomicUsize::new(options.resolved_worker_count()));

        let coordinator = Coordinator::new(
            options,
            Arc::new(launcher),
            events_tx,
            Arc::clone(&worker_count),
        );
        tokio::spawn(coordinator.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            worker_count,
        }
    }

    /// Configured pool size.
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Relaxed)
    }

    /// Launch the workers. `options` replaces the stored options when given.
    pub async fn start(&self, options: Option<WorkerSetOptions>) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { options, reply })?;
        rx.await.map_err(|_| PoolError::Destroyed)?
    }

    /// Wait until every worker is up and has announced `service`.
    pub async fn connect(&self, service: impl Into<String>) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            service: service.into(),
            reply,
        })?;
        rx.await.map_err(|_| PoolError::Destroyed)?
    }

    /// Send a request to one worker and wait for its response.
    ///
    /// The request is queued when no worker is idle. `token` can abort it
    /// while queued and sets its queue priority.
    pub async fn invoke_request(
        &self,
        service: impl Into<String>,
        request: Value,
        transfer: Transferables,
        token: Option<RequestToken>,
    ) -> Result<Reply, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Invoke {
            service: service.into(),
            request,
            transfer,
            token,
            reply,
        })?;
        rx.await.map_err(|_| PoolError::Destroyed)?
    }

    /// Send the request to every worker, bypassing the queue. Replies are in
    /// worker order.
    pub async fn broadcast_request(
        &self,
        service: impl Into<String>,
        request: Value,
        transfer: Transferables,
    ) -> Result<Vec<Reply>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BroadcastRequest {
            service: service.into(),
            request,
            transfer,
            reply,
        })?;
        let receivers = rx.await.map_err(|_| PoolError::Destroyed)??;
        try_join_all(
            receivers
                .into_iter()
                .map(|rx| async move { rx.await.unwrap_or(Err(PoolError::Destroyed)) }),
        )
        .await
    }

    /// Post a one-way message to every worker.
    pub async fn broadcast_message(
        &self,
        message: WorkerMessage,
        transfer: Transferables,
    ) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BroadcastMessage {
            message,
            transfer,
            reply,
        })?;
        rx.await.map_err(|_| PoolError::Destroyed)?
    }

    /// Register the single event listener of `service`, replacing any previous one.
    pub fn add_event_listener(&self, service: impl Into<String>, listener: impl EventListener) {
        let _ = self.commands.send(Command::AddEventListener {
            service: service.into(),
            listener: Arc::new(listener),
        });
    }

    pub fn remove_event_listener(&self, service: impl Into<String>) {
        let _ = self.commands.send(Command::RemoveEventListener {
            service: service.into(),
        });
    }

    /// Take shared ownership; restarts a stopped set on the first reference.
    pub fn add_reference(&self) {
        let _ = self.commands.send(Command::AddReference);
    }

    /// Release shared ownership; the last release stops the set gracefully.
    pub fn remove_reference(&self) {
        let _ = self.commands.send(Command::RemoveReference);
    }

    /// Refuse new work, wait for pending requests, then terminate the workers.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).is_ok() {
            // A closed channel means the coordinator is gone and so are the workers.
            let _ = rx.await;
        }
    }

    /// Tear down immediately: pending requests fail with
    /// [`PoolError::Destroyed`], queued ones are dropped, workers are terminated.
    /// Resolves once the coordinator has done so; in-flight work is not awaited.
    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Destroy { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Forget the readiness state of `service` once it is gone from the workers.
    pub fn release_service(&self, service: impl Into<String>) {
        let _ = self.commands.send(Command::ReleaseService {
            service: service.into(),
        });
    }

    fn send(&self, command: Command) -> Result<(), PoolError> {
        self.commands
            .send(command)
            .map_err(|_| PoolError::Destroyed)
    }
}

// ========== Coordinator ==========

enum Command {
    Start {
        options: Option<WorkerSetOptions>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Connect {
        service: String,
        reply: ReadyWaiter,
    },
    Invoke {
        service: String,
        request: Value,
        transfer: Transferables,
        token: Option<RequestToken>,
        reply: ReplySender,
    },
    BroadcastRequest {
        service: String,
        request: Value,
        transfer: Transferables,
        reply: oneshot::Sender<Result<Vec<oneshot::Receiver<Result<Reply, PoolError>>>, PoolError>>,
    },
    BroadcastMessage {
        message: WorkerMessage,
        transfer: Transferables,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    AddEventListener {
        service: String,
        listener: Arc<dyn EventListener>,
    },
    RemoveEventListener {
        service: String,
    },
    AddReference,
    RemoveReference,
    Stop {
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    ReleaseService {
        service: String,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Start { .. } => "Start",
            Command::Connect { .. } => "Connect",
            Command::Invoke { .. } => "Invoke",
            Command::BroadcastRequest { .. } => "BroadcastRequest",
            Command::BroadcastMessage { .. } => "BroadcastMessage",
            Command::AddEventListener { .. } => "AddEventListener",
            Command::RemoveEventListener { .. } => "RemoveEventListener",
            Command::AddReference => "AddReference",
            Command::RemoveReference => "RemoveReference",
            Command::Stop { .. } => "Stop",
            Command::Destroy { .. } => "Destroy",
            Command::ReleaseService { .. } => "ReleaseService",
        };
        f.write_str(name)
    }
}

/// Worker activity, tagged with the generation (start cycle) it belongs to.
enum Event {
    Launched {
        generation: u64,
        result: Result<LaunchedWorker, PoolError>,
    },
    Message {
        generation: u64,
        worker: usize,
        envelope: Envelope,
    },
    Closed {
        generation: u64,
        worker: usize,
    },
}

struct Coordinator {
    options: WorkerSetOptions,
    launcher: Arc<dyn WorkerLauncher>,
    events_tx: mpsc::UnboundedSender<Event>,
    worker_count: Arc<AtomicUsize>,
    stopped: bool,
    /// Stop requested, waiting for pending requests to settle.
    stopping: bool,
    stop_waiters: Vec<oneshot::Sender<()>>,
    generation: u64,
    expected_workers: usize,
    /// Workers of this generation that exited or stopped accepting messages.
    retired_workers: usize,
    launch_error: Option<PoolError>,
    workers: Vec<WorkerHandle>,
    /// Indices into `workers`; the last pushed is dispatched first.
    idle: Vec<usize>,
    pending: PendingRequests,
    ready: ReadySignals,
    queue: RequestQueue,
    listeners: HashMap<String, Arc<dyn EventListener>>,
    reference_count: usize,
    next_message_id: u64,
}

impl Coordinator {
    fn new(
        options: WorkerSetOptions,
        launcher: Arc<dyn WorkerLauncher>,
        events_tx: mpsc::UnboundedSender<Event>,
        worker_count: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            options,
            launcher,
            events_tx,
            worker_count,
            stopped: true,
            stopping: false,
            stop_waiters: Vec::new(),
            generation: 0,
            expected_workers: 0,
            retired_workers: 0,
            launch_error: None,
            workers: Vec::new(),
            idle: Vec::new(),
            pending: PendingRequests::default(),
            ready: ReadySignals::default(),
            queue: RequestQueue::default(),
            listeners: HashMap::new(),
            reference_count: 0,
            next_message_id: 0,
        }
    }

    /// Main loop - the only place dispatcher state is touched
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle dropped
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            if self.stopping && self.pending.is_empty() {
                self.finish_stop();
            }
        }

        self.destroy();
        tracing::debug!("Worker set coordinator exited");
    }

    fn handle_command(&mut self, command: Command) {
        tracing::trace!("Worker set command: {:?}", command);
        match command {
            Command::Start { options, reply } => {
                let _ = reply.send(self.start(options));
            }
            Command::Connect { service, reply } => self.connect(service, reply),
            Command::Invoke {
                service,
                request,
                transfer,
                token,
                reply,
            } => self.invoke_request(service, request, transfer, token, reply),
            Command::BroadcastRequest {
                service,
                request,
                transfer,
                reply,
            } => {
                let _ = reply.send(self.broadcast_request(service, request, transfer));
            }
            Command::BroadcastMessage {
                message,
                transfer,
                reply,
            } => {
                let _ = reply.send(self.broadcast_message(message, transfer));
            }
            Command::AddEventListener { service, listener } => {
                self.listeners.insert(service, listener);
            }
            Command::RemoveEventListener { service } => {
                self.listeners.remove(&service);
            }
            Command::AddReference => {
                self.reference_count += 1;
                if self.reference_count == 1 && self.stopped {
                    if let Err(err) = self.start(None) {
                        tracing::warn!("Failed to restart worker set: {}", err);
                    }
                }
            }
            Command::RemoveReference => {
                if self.reference_count == 0 {
                    tracing::warn!("remove_reference called without a matching add_reference");
                    return;
                }
                self.reference_count -= 1;
                if self.reference_count == 0 {
                    self.stop(None);
                }
            }
            Command::Stop { reply } => self.stop(Some(reply)),
            Command::Destroy { reply } => {
                self.destroy();
                let _ = reply.send(());
            }
            Command::ReleaseService { service } => {
                if self.ready.remove(&service, &PoolError::Destroyed) {
                    tracing::debug!(
                        "Released service {}, {} services tracked",
                        service,
                        self.ready.len()
                    );
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Launched { generation, result } => self.on_launched(generation, result),
            Event::Message {
                generation,
                worker,
                envelope,
            } => {
                if generation != self.generation {
                    tracing::trace!("Dropping message from retired worker {}", worker);
                    return;
                }
                self.on_worker_message(worker, envelope);
            }
            Event::Closed { generation, worker } => {
                if generation == self.generation {
                    self.on_worker_closed(worker);
                }
            }
        }
    }

    // ----- lifecycle -----

    fn start(&mut self, options: Option<WorkerSetOptions>) -> Result<(), PoolError> {
        if !self.stopped {
            return Err(PoolError::AlreadyStarted);
        }
        if self.stopping {
            // Restarted before the previous stop drained; settle it now.
            let abandoned = self.pending.reject_all(PoolError::NotStarted);
            tracing::warn!(
                "Worker set restarted while stopping, {} pending requests rejected",
                abandoned
            );
            self.finish_stop();
        }
        if let Some(options) = options {
            self.options = options;
        }

        let count = self.options.resolved_worker_count();
        let timeout = self.options.connection_timeout();
        self.generation += 1;
        self.stopped = false;
        self.expected_workers = count;
        self.retired_workers = 0;
        self.launch_error = None;
        self.worker_count.store(count, Ordering::Relaxed);

        tracing::info!(
            "Starting worker set: {} workers from {}, connection timeout {:?}",
            count,
            self.options.script_url,
            timeout
        );

        for _ in 0..count {
            let launcher = Arc::clone(&self.launcher);
            let script_url = self.options.script_url.clone();
            let events = self.events_tx.clone();
            let generation = self.generation;
            tokio::spawn(async move {
                let result = launch_worker(launcher.as_ref(), &script_url, timeout).await;
                let _ = events.send(Event::Launched { generation, result });
            });
        }
        Ok(())
    }

    fn on_launched(&mut self, generation: u64, result: Result<LaunchedWorker, PoolError>) {
        if generation != self.generation || self.stopped {
            if let Ok(launched) = result {
                tracing::debug!("Terminating worker launched after stop");
                (launched.terminate)();
            }
            return;
        }

        match result {
            Ok(launched) => {
                let LaunchedWorker {
                    outgoing,
                    incoming,
                    terminate,
                    first,
                } = launched;
                let index = self.workers.len();
                self.workers.push(WorkerHandle::new(index, outgoing, terminate));
                self.idle.push(index);
                pump_worker(self.events_tx.clone(), generation, index, first, incoming);
                tracing::debug!("Worker {} connected", index);
                if self.workers.len() == self.expected_workers {
                    tracing::info!("Worker set ready: {} workers", self.workers.len());
                }
                self.check_worker_request_queue();
            }
            Err(err) => {
                tracing::error!("Worker launch failed: {}", err);
                self.ready.fail_waiters(&err);
                if self.launch_error.is_none() {
                    self.launch_error = Some(err);
                }
            }
        }
    }

    fn stop(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.stopped = true;
        self.stopping = true;
        if let Some(reply) = reply {
            self.stop_waiters.push(reply);
        }

        // Queued requests can no longer be dispatched.
        while let Some(entry) = self.queue.pop() {
            self.pending
                .resolve(entry.message_id, Err(PoolError::NotStarted));
        }

        tracing::info!(
            "Stopping worker set, waiting for {} pending requests",
            self.pending.len()
        );
    }

    fn finish_stop(&mut self) {
        self.stopping = false;
        self.terminate_workers();
        self.ready.clear(&PoolError::NotStarted);
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!("Worker set stopped");
    }

    fn destroy(&mut self) {
        self.stopped = true;
        self.stopping = false;
        let rejected = self.pending.reject_all(PoolError::Destroyed);
        let dropped = self.queue.clear();
        self.terminate_workers();
        self.ready.clear(&PoolError::Destroyed);
        self.listeners.clear();
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!(
            "Worker set destroyed: {} pending requests rejected, {} queued dropped",
            rejected,
            dropped
        );
    }

    fn terminate_workers(&mut self) {
        for worker in &mut self.workers {
            worker.terminate();
        }
        self.workers.clear();
        self.idle.clear();
        // Late launches and messages of these workers are now stale.
        self.generation += 1;
    }

    // ----- requests -----

    fn connect(&mut self, service: String, reply: ReadyWaiter) {
        if self.stopped {
            let _ = reply.send(Err(PoolError::NotStarted));
            return;
        }
        if let Some(err) = &self.launch_error {
            let _ = reply.send(Err(err.clone()));
            return;
        }
        if self.expected_workers > 0 && self.ready_target() == 0 {
            let _ = reply.send(Err(PoolError::NoWorkers));
            return;
        }
        self.ready.wait(&service, self.ready_target(), reply);
    }

    /// Announcements a service needs: one per worker that has not retired.
    fn ready_target(&self) -> usize {
        self.expected_workers.saturating_sub(self.retired_workers)
    }

    fn next_message_id(&mut self) -> u64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    fn invoke_request(
        &mut self,
        service: String,
        request: Value,
        transfer: Transferables,
        token: Option<RequestToken>,
        reply: ReplySender,
    ) {
        if self.stopped {
            let _ = reply.send(Err(PoolError::NotStarted));
            return;
        }
        let message_id = self.next_message_id();
        self.pending.insert(message_id, reply);
        let message = WorkerMessage::Request {
            service,
            message_id,
            request,
        };
        if let Err(err) = self.post_request_message(message_id, message, transfer, token) {
            self.pending.resolve(message_id, Err(err));
        }
    }

    /// Dispatch to an idle worker, or queue when none is idle.
    fn post_request_message(
        &mut self,
        message_id: u64,
        message: WorkerMessage,
        transfer: Transferables,
        token: Option<RequestToken>,
    ) -> Result<(), PoolError> {
        if self.stopped {
            return Err(PoolError::NotStarted);
        }
        if !self.workers.iter().any(WorkerHandle::is_alive) {
            return Err(PoolError::NoWorkers);
        }
        if token.as_ref().is_some_and(RequestToken::is_aborted) {
            self.pending.resolve(message_id, Err(PoolError::Aborted));
            return Ok(());
        }

        if let Some(index) = self.pop_idle_worker() {
            self.pending.assign(message_id, index, true);
            if !self.workers[index].post(Envelope::with_transfer(message, transfer)) {
                // Fails this request along with the rest of the worker's work.
                self.retire_worker(index);
            }
            return Ok(());
        }

        let token = token.unwrap_or_default();
        // Zero doubles as "unset": later requests get lower priorities, which
        // keeps default-priority entries in submission order.
        if token.priority() == 0 {
            token.set_priority(-(message_id as i64));
        }
        self.queue.push(QueuedRequest {
            message_id,
            message,
            transfer,
            token,
        });
        tracing::trace!("Request {} queued, {} waiting", message_id, self.queue.len());
        Ok(())
    }

    fn pop_idle_worker(&mut self) -> Option<usize> {
        while let Some(index) = self.idle.pop() {
            if self.workers.get(index).is_some_and(WorkerHandle::is_alive) {
                return Some(index);
            }
        }
        None
    }

    fn check_worker_request_queue(&mut self) {
        if self.queue.is_empty() || self.idle.is_empty() {
            return;
        }
        self.queue.prioritize();
        while !self.idle.is_empty() {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            if let Err(err) = self.post_request_message(
                entry.message_id,
                entry.message,
                entry.transfer,
                Some(entry.token),
            ) {
                self.pending.resolve(entry.message_id, Err(err));
            }
        }
    }

    fn broadcast_request(
        &mut self,
        service: String,
        request: Value,
        transfer: Transferables,
    ) -> Result<Vec<oneshot::Receiver<Result<Reply, PoolError>>>, PoolError> {
        if self.stopped {
            return Err(PoolError::NotStarted);
        }
        let live: Vec<usize> = (0..self.workers.len())
            .filter(|&index| self.workers[index].is_alive())
            .collect();
        if live.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        let mut receivers = Vec::with_capacity(live.len());
        for index in live {
            let message_id = self.next_message_id();
            let (reply, rx) = oneshot::channel();
            self.pending.insert(message_id, reply);
            self.pending.assign(message_id, index, false);
            let message = WorkerMessage::Request {
                service: service.clone(),
                message_id,
                request: request.clone(),
            };
            receivers.push(rx);
            if !self.workers[index].post(Envelope::with_transfer(message, transfer.clone())) {
                self.retire_worker(index);
            }
        }
        Ok(receivers)
    }

    fn broadcast_message(
        &mut self,
        message: WorkerMessage,
        transfer: Transferables,
    ) -> Result<(), PoolError> {
        if self.stopped {
            return Err(PoolError::NotStarted);
        }
        let mut unreachable = Vec::new();
        for worker in self.workers.iter().filter(|worker| worker.is_alive()) {
            if !worker.post(Envelope::with_transfer(message.clone(), transfer.clone())) {
                unreachable.push(worker.index());
            }
        }
        for index in unreachable {
            self.retire_worker(index);
        }
        Ok(())
    }

    // ----- worker messages -----

    fn on_worker_message(&mut self, worker: usize, envelope: Envelope) {
        let Envelope { message, transfer } = envelope;
        match message {
            WorkerMessage::Response {
                message_id,
                response,
                error_message,
                error_stack,
                ..
            } => {
                let result = match error_message {
                    Some(message) => Err(PoolError::Remote {
                        message,
                        stack: error_stack,
                    }),
                    None => Ok(Reply {
                        value: response.unwrap_or(Value::Null),
                        transfer,
                    }),
                };
                self.on_response(worker, message_id, result);
            }
            WorkerMessage::Initialized { service } => {
                if !self.workers.get(worker).is_some_and(WorkerHandle::is_alive) {
                    tracing::debug!("Ignoring {} announced by retired worker {}", service, worker);
                    return;
                }
                if self.ready.signal(&service, worker, self.ready_target()) {
                    tracing::debug!("Service {} initialized on every worker", service);
                }
            }
            WorkerMessage::Log { level, message } => emit_worker_log(worker, level, &message),
            WorkerMessage::Request {
                service,
                message_id,
                ..
            } => {
                tracing::warn!(
                    "Worker {} sent request {} for {}; workers cannot issue requests",
                    worker,
                    message_id,
                    service
                );
            }
            WorkerMessage::Event { service, payload } => match self.listeners.get(&service) {
                Some(listener) => listener.on_event(WorkerEvent {
                    worker,
                    service,
                    payload,
                    transfer,
                }),
                None => tracing::debug!("No event listener for service {}", service),
            },
        }
    }

    fn on_response(&mut self, worker: usize, message_id: u64, result: Result<Reply, PoolError>) {
        if worker >= self.workers.len() {
            tracing::error!("Response {} from invalid worker id {}", message_id, worker);
            return;
        }
        let Some(pending) = self.pending.take(message_id) else {
            tracing::error!("Response for unknown message id {}", message_id);
            return;
        };

        if pending.occupies_worker() {
            let owner = pending.worker().unwrap_or(worker);
            if owner != worker {
                tracing::warn!(
                    "Response {} came from worker {} but was posted to {}",
                    message_id,
                    worker,
                    owner
                );
            }
            self.release_worker(owner);
            self.check_worker_request_queue();
        }

        pending.resolve(result);
    }

    fn release_worker(&mut self, index: usize) {
        let alive = self.workers.get(index).is_some_and(WorkerHandle::is_alive);
        if alive && !self.idle.contains(&index) {
            self.idle.push(index);
        }
    }

    fn on_worker_closed(&mut self, worker: usize) {
        self.retire_worker(worker);
    }

    /// Take a worker out of service: fail everything posted to it, drop it
    /// from the idle stack and readiness barriers, and flush the queue once
    /// no worker is left. Runs at most once per worker.
    fn retire_worker(&mut self, worker: usize) {
        let Some(handle) = self.workers.get_mut(worker) else {
            return;
        };
        if !handle.is_alive() {
            return;
        }
        handle.mark_dead();
        self.retired_workers += 1;
        self.idle.retain(|&index| index != worker);

        let lost = self.pending.take_for_worker(worker);
        tracing::warn!("Worker {} retired, {} requests in flight", worker, lost.len());
        for pending in lost {
            pending.resolve(Err(PoolError::WorkerExited(worker)));
        }
        self.ready.forget_worker(worker);
        self.ready.fail_waiters(&PoolError::WorkerExited(worker));

        if !self.workers.iter().any(WorkerHandle::is_alive) {
            while let Some(entry) = self.queue.pop() {
                self.pending
                    .resolve(entry.message_id, Err(PoolError::NoWorkers));
            }
        }
    }
}

/// Forward everything a worker sends to the coordinator, then report closure.
fn pump_worker(
    events: mpsc::UnboundedSender<Event>,
    generation: u64,
    worker: usize,
    first: Envelope,
    mut incoming: mpsc::UnboundedReceiver<Envelope>,
) {
    tokio::spawn(async move {
        let mut next = Some(first);
        while let Some(envelope) = next {
            let event = Event::Message {
                generation,
                worker,
                envelope,
            };
            if events.send(event).is_err() {
                return;
            }
            next = incoming.recv().await;
        }
        let _ = events.send(Event::Closed { generation, worker });
    });
}
