//! # convoy-core
//!
//! Core types for the Convoy build agent.
//!
//! Everything the other crates share lives here:
//! - The resolved, immutable [`AgentConfig`] that is threaded into every
//!   component by value (never read from ambient global state)
//! - The unified [`AgentError`] taxonomy that drives retry and exit-code
//!   decisions at the edges
//! - The data model: jobs, agent identity, artifact records, search queries

mod config;
mod error;
mod types;

pub use config::{AgentConfig, BucketConfig, DEFAULT_ENDPOINT};
pub use error::{AgentError, Result};
pub use types::*;
