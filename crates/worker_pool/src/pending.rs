use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::protocol::Transferables;

/// Response payload of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub value: Value,
    pub transfer: Transferables,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, PoolError>>;

/// Continuation of one in-flight request.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    reply: ReplySender,
    /// Worker the request was posted to, once it left the queue.
    worker: Option<usize>,
    /// Whether the worker was taken from the idle stack for this request and
    /// must be returned there when the response arrives.
    occupies_worker: bool,
}

impl PendingRequest {
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    pub fn occupies_worker(&self) -> bool {
        self.occupies_worker
    }

    pub fn resolve(self, result: Result<Reply, PoolError>) {
        // The requester may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

/// Message id → continuation awaiting a `Response`.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    requests: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub fn insert(&mut self, message_id: u64, reply: ReplySender) {
        self.requests.insert(
            message_id,
            PendingRequest {
                reply,
                worker: None,
                occupies_worker: false,
            },
        );
    }

    pub fn assign(&mut self, message_id: u64, worker: usize, occupies_worker: bool) {
        if let Some(pending) = self.requests.get_mut(&message_id) {
            pending.worker = Some(worker);
            pending.occupies_worker = occupies_worker;
        }
    }

    pub fn take(&mut self, message_id: u64) -> Option<PendingRequest> {
        self.requests.remove(&message_id)
    }

    pub fn resolve(&mut self, message_id: u64, result: Result<Reply, PoolError>) {
        if let Some(pending) = self.requests.remove(&message_id) {
            pending.resolve(result);
        }
    }

    /// Remove every request currently posted to `worker`.
    pub fn take_for_worker(&mut self, worker: usize) -> Vec<PendingRequest> {
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, pending)| pending.worker == Some(worker))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    pub fn reject_all(&mut self, error: PoolError) -> usize {
        let count = self.requests.len();
        for (_, pending) in self.requests.drain() {
            pending.resolve(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
