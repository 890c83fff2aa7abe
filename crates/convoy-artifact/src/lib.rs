//! # convoy-artifact
//!
//! Artifact exchange for the Convoy agent: glob-scoped upload, scoped
//! search against the build's remote artifact namespace, verified download,
//! and single-match checksum lookup.
//!
//! Resolution policy (deliberately asymmetric):
//! - `download` favors availability: a query matching several job instances
//!   returns the union of their artifacts
//! - `shasum` favors correctness: the same query is an ambiguity error,
//!   because one checksum cannot represent several files

mod bucket;
mod checksum;
mod index;
mod transfer;

pub use bucket::{BucketClient, BucketDestination};
pub use checksum::{sha1_bytes, sha1_file};
pub use index::{ArtifactIndex, ResolveMode};
pub use transfer::{download, shasum, upload, UploadScope};
