use crate::protocol::{Transferables, WorkerMessage};
use crate::token::RequestToken;

/// A request that found no idle worker at dispatch time.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub message_id: u64,
    pub message: WorkerMessage,
    pub transfer: Transferables,
    pub token: RequestToken,
}

/// Backlog of requests waiting for an idle worker.
///
/// Priorities are read from the tokens when the queue is drained, not when
/// entries are pushed, so a requester may re-prioritise while waiting.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    entries: Vec<QueuedRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, request: QueuedRequest) {
        self.entries.push(request);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Order entries so that [`RequestQueue::pop`] yields the highest priority
    /// first and, among equal priorities, the earliest enqueued.
    pub fn prioritize(&mut self) {
        self.entries.sort_by(|a, b| {
            a.token
                .priority()
                .cmp(&b.token.priority())
                .then(b.message_id.cmp(&a.message_id))
        });
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.entries.pop()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued(message_id: u64, priority: i64) -> QueuedRequest {
        QueuedRequest {
            message_id,
            message: WorkerMessage::Request {
                service: "svc".to_string(),
                message_id,
                request: json!(null),
            },
            transfer: Vec::new(),
            token: RequestToken::with_priority(priority),
        }
    }

    fn drain_order(queue: &mut RequestQueue) -> Vec<u64> {
        queue.prioritize();
        std::iter::from_fn(|| queue.pop().map(|entry| entry.message_id)).collect()
    }

    #[test]
    fn default_priorities_drain_oldest_first() {
        let mut queue = RequestQueue::default();
        for id in 1..=4 {
            queue.push(queued(id, -(id as i64)));
        }
        assert_eq!(drain_order(&mut queue), vec![1, 2, 3, 4]);
    }

    #[test]
    fn explicit_priority_jumps_ahead_of_defaults() {
        let mut queue = RequestQueue::default();
        queue.push(queued(1, -1));
        queue.push(queued(2, -2));
        queue.push(queued(3, 10));
        queue.push(queued(4, -1000));
        assert_eq!(drain_order(&mut queue), vec![3, 1, 2, 4]);
    }

    #[test]
    fn equal_priorities_break_ties_fifo() {
        let mut queue = RequestQueue::default();
        queue.push(queued(5, 3));
        queue.push(queued(6, 3));
        queue.push(queued(7, 3));
        assert_eq!(drain_order(&mut queue), vec![5, 6, 7]);
    }

    #[test]
    fn priority_is_read_at_drain_time() {
        let mut queue = RequestQueue::default();
        let late = queued(2, -2);
        let token = late.token.clone();
        queue.push(queued(1, -1));
        queue.push(late);
        token.set_priority(50);
        assert_eq!(drain_order(&mut queue), vec![2, 1]);
    }
}
