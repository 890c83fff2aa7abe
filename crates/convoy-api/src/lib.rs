//! # convoy-api
//!
//! The coordination-service HTTP layer of the Convoy agent.
//!
//! One [`ApiClient`] wraps every outbound call with bearer auth, a fixed
//! per-attempt timeout and bounded exponential backoff with jitter, so the
//! components above it (registrar, poller, artifact transfer, metadata)
//! share uniform failure semantics: transient errors are retried, auth
//! errors are fatal, undecodable responses are protocol errors.

mod client;
mod metadata;
mod registrar;
pub mod wire;

pub use client::{ApiClient, RetryPolicy};
pub use metadata::MetadataStore;
pub use registrar::register;
