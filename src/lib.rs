//! Response cache and anti-dogpile coordination core for a reverse proxy
//! fronting a columnar analytic database.
//!
//! Maps a query fingerprint to a previously computed response (on disk or
//! in a shared key/value store), coordinates concurrent identical
//! requests so only one upstream execution happens at a time, and streams
//! large bodies into and out of the cache without buffering them whole.

pub mod backend;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod metadata;
pub mod registry;
pub mod scratch;

pub use cache::{Artifact, ArtifactBody, BodyStream, Cache, CacheStats};
pub use coordinator::{AsyncCache, CoordinatorConfig, GraceTime};
pub use error::{CacheError, Result};
pub use fingerprint::{fingerprint, Fingerprint, InputHashes, ShapingParams};
pub use metadata::ContentMetadata;
pub use registry::{TransactionRegistry, TransactionStatus};
