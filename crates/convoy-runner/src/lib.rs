//! # convoy-runner
//!
//! The supervising half of the Convoy agent: the acquisition loop that
//! claims one job at a time, and the executor that runs a claimed job's
//! bootstrap script as a supervised child process.
//!
//! Within one job, concurrency is coordinated by message passing: the
//! child's output stream (pty-backed or pipe-backed), the cancellation
//! watcher and the grace-period timer all communicate over channels, never
//! through shared mutable buffers.

mod env;
mod executor;
mod poller;
mod stream;

pub use env::build_environment;
pub use executor::JobExecutor;
pub use poller::{transition, JobPoller, PollerAction, PollerEvent, PollerState};
pub use stream::{OutputChunk, StreamSource};
