use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pool size used when the platform gives no concurrency hint.
pub const DEFAULT_WORKER_COUNT: usize = 2;
/// Upper bound for the pool size derived from the concurrency hint.
pub const MAX_DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;

/// Configuration for a [`crate::ConcurrentWorkerSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSetOptions {
    /// Identifies the worker program, resolved by the launcher.
    pub script_url: String,
    /// Number of workers (default: cpus - 1, clamped to 1..=4)
    #[serde(default)]
    pub worker_count: Option<usize>,
    /// Time a worker gets to send its first message (default: 10s)
    #[serde(default, rename = "workerConnectionTimeout")]
    pub worker_connection_timeout_ms: Option<u64>,
}

impl WorkerSetOptions {
    pub fn new(script_url: impl Into<String>) -> Self {
        Self {
            script_url: script_url.into(),
            worker_count: None,
            worker_connection_timeout_ms: None,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = Some(worker_count);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.worker_connection_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Create options from environment variables
    ///
    /// Environment variables:
    /// - WORKER_COUNT: Number of workers (default: derived from cpu count)
    /// - WORKER_CONNECTION_TIMEOUT_MS: Launch timeout in ms (default: 10000)
    pub fn from_env(script_url: impl Into<String>) -> Self {
        Self {
            script_url: script_url.into(),
            worker_count: env_value("WORKER_COUNT"),
            worker_connection_timeout_ms: env_value("WORKER_CONNECTION_TIMEOUT_MS"),
        }
    }

    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(default_worker_count)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(
            self.worker_connection_timeout_ms
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
        )
    }
}

fn env_value<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    parse_env_value(name, &raw)
}

fn parse_env_value<T>(name: &str, raw: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, err);
            None
        }
    }
}

/// One core is left for the controller.
pub fn default_worker_count() -> usize {
    match num_cpus::get() {
        0 => DEFAULT_WORKER_COUNT,
        cpus => (cpus - 1).clamp(1, MAX_DEFAULT_WORKER_COUNT),
    }
}
