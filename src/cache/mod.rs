//! The `Cache` capability set shared by the filesystem (C4) and shared
//! key/value (C5) cache variants.

pub mod fs;
pub mod shared;

use crate::error::CacheError;
use crate::metadata::ContentMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

/// A streamed body returned from [`Cache::get`]: either the whole payload
/// held in memory, or an open file positioned at the start of the body.
pub enum ArtifactBody {
    Memory(std::io::Cursor<Bytes>),
    File(File),
}

impl AsyncRead for ArtifactBody {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ArtifactBody::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            ArtifactBody::File(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

/// A body to be handed to [`Cache::put`]. Boxed and type-erased so `Cache`
/// stays object-safe — callers may stream from a network response, a
/// scratch file, or an in-memory buffer interchangeably.
pub type BodyStream = Pin<Box<dyn AsyncRead + Send>>;

pub fn body_stream_from_bytes(bytes: Bytes) -> BodyStream {
    Box::pin(std::io::Cursor::new(bytes))
}

/// The logical tuple returned by a cache hit.
pub struct Artifact {
    pub metadata: ContentMetadata,
    pub body: ArtifactBody,
    pub modified: SystemTime,
    /// Remaining time-to-live. `Duration::ZERO` during grace serving once
    /// the nominal expiry has already passed.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size_bytes: u64,
    pub items: u64,
}

/// The capability set both cache backends satisfy, chosen at construction
/// time from a config tag (`file_system` | `redis`) rather than through a
/// process-wide singleton.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Artifact, CacheError>;
    async fn put(&self, key: &str, body: BodyStream, meta: ContentMetadata) -> Result<Duration, CacheError>;
    async fn stats(&self) -> CacheStats;
    fn name(&self) -> &'static str;
    async fn close(&self);
}
