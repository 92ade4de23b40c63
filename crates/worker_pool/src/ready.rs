use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::error::PoolError;

pub(crate) type ReadyWaiter = oneshot::Sender<Result<(), PoolError>>;

/// Per-service barrier satisfied once every live worker announced the service.
#[derive(Debug, Default)]
struct ReadySignal {
    /// Workers that announced the service.
    announced: HashSet<usize>,
    waiters: Vec<ReadyWaiter>,
}

#[derive(Debug, Default)]
pub(crate) struct ReadySignals {
    signals: HashMap<String, ReadySignal>,
}

impl ReadySignals {
    pub fn wait(&mut self, service: &str, expected: usize, waiter: ReadyWaiter) {
        let signal = self.signals.entry(service.to_string()).or_default();
        if signal.announced.len() >= expected {
            let _ = waiter.send(Ok(()));
        } else {
            signal.waiters.push(waiter);
        }
    }

    /// Record `worker`'s initialization of `service`. Returns true once the
    /// barrier is satisfied.
    pub fn signal(&mut self, service: &str, worker: usize, expected: usize) -> bool {
        let signal = self.signals.entry(service.to_string()).or_default();
        signal.announced.insert(worker);
        if signal.announced.len() < expected {
            return false;
        }
        for waiter in signal.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    /// Drop `worker` from every barrier it counted towards.
    pub fn forget_worker(&mut self, worker: usize) {
        for signal in self.signals.values_mut() {
            signal.announced.remove(&worker);
        }
    }

    /// Reject every waiter while keeping the announcements.
    pub fn fail_waiters(&mut self, error: &PoolError) {
        for signal in self.signals.values_mut() {
            for waiter in signal.waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Discard the barrier of one service. Returns false when none existed.
    pub fn remove(&mut self, service: &str, error: &PoolError) -> bool {
        let Some(signal) = self.signals.remove(service) else {
            return false;
        };
        for waiter in signal.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        true
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn clear(&mut self, error: &PoolError) {
        self.fail_waiters(error);
        self.signals.clear();
    }
}
