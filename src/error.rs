//! The error taxonomy shared by every component in this crate.

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced across the cache, registry, and coordinator APIs.
///
/// The variant set mirrors the taxonomy in the interface contract exactly:
/// callers are expected to match on these five kinds and nothing else leaks
/// out of the public API.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The looked-up key has no artifact, or it is past its grace window.
    #[error("missing")]
    Missing,

    /// A length-prefixed metadata frame could not be decoded.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// A stored payload was shorter than advertised, or its frame decoded
    /// but the body behind it did not match.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// A bounded operation exceeded its per-call deadline.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// A filesystem or network error from the underlying backend.
    #[error("underlying io error: {0}")]
    UnderlyingIo(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::UnderlyingIo(e.to_string())
    }
}

impl From<Arc<std::io::Error>> for CacheError {
    fn from(e: Arc<std::io::Error>) -> Self {
        CacheError::UnderlyingIo(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        // The caller supplies the duration via `CacheError::Timeout` directly
        // wherever it has one in scope; this conversion covers the `?`-propagation
        // sites that only have a bare `Elapsed` to work with.
        CacheError::Timeout(std::time::Duration::default())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
