pub mod config;
pub mod error;
pub mod launcher;
mod pending;
pub mod process_launcher;
pub mod protocol;
mod queue;
mod ready;
pub mod thread_launcher;
pub mod token;
pub mod worker_set;

pub use config::*;
pub use error::PoolError;
pub use launcher::{WorkerChannel, WorkerLauncher};
pub use pending::Reply;
pub use process_launcher::ProcessLauncher;
pub use protocol::{Envelope, Transferables, WorkerMessage};
pub use thread_launcher::{ThreadLauncher, WorkerScope};
pub use token::RequestToken;
pub use worker_set::*;
