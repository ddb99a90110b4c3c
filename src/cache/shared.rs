//! C5 — a remote key→bytes store with server-managed TTL, fronting the
//! shared key/value backend described in `crate::backend`.

use crate::backend::SharedStore;
use crate::cache::{Artifact, ArtifactBody, BodyStream, Cache, CacheStats};
use crate::error::CacheError;
use crate::scratch::ScratchSink;
use bytes::{Buf, Bytes, BytesMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use tracing::warn;

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_TIMEOUT: Duration = Duration::from_millis(500);
const APPEND_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// A value is small enough, relative to remaining server TTL, that a
/// downstream read comfortably outlasts the shared store's own entry
/// disappearing mid-stream — below this ratio the retrieved bytes are
/// spilled to a scratch file instead of streamed straight from memory.
const SPILL_TTL_RATIO_SECS_PER_MIB: f64 = 0.25;

pub struct SharedCache {
    store: Arc<dyn SharedStore>,
    scratch_dir: PathBuf,
    expire: Duration,
}

impl SharedCache {
    pub fn new(store: Arc<dyn SharedStore>, scratch_dir: impl Into<PathBuf>, expire: Duration) -> Self {
        Self {
            store,
            scratch_dir: scratch_dir.into(),
            expire,
        }
    }
}

/// Encodes `{length-prefixed type, length-prefixed encoding, u64be length, body}`
/// into a single buffer for the metadata-only `SET`.
fn encode_prefix(content_type: &str, content_encoding: &str, length: i64) -> Bytes {
    let mut buf = BytesMut::new();
    for field in [content_type.as_bytes(), content_encoding.as_bytes()] {
        buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
        buf.extend_from_slice(field);
    }
    buf.extend_from_slice(&(length as u64).to_be_bytes());
    buf.freeze()
}

struct DecodedPrefix {
    content_type: String,
    content_encoding: String,
    length: i64,
    prefix_len: usize,
}

fn decode_prefix(mut buf: &[u8]) -> Result<DecodedPrefix, CacheError> {
    let start_len = buf.len();
    let mut read_field = |buf: &mut &[u8]| -> Result<String, CacheError> {
        if buf.len() < 4 {
            return Err(CacheError::CorruptPayload("truncated length prefix".into()));
        }
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        buf.advance(4);
        if buf.len() < len {
            return Err(CacheError::CorruptPayload("payload shorter than advertised length".into()));
        }
        let value = String::from_utf8(buf[..len].to_vec())
            .map_err(|e| CacheError::CorruptPayload(e.to_string()))?;
        buf.advance(len);
        Ok(value)
    };

    let content_type = read_field(&mut buf)?;
    let content_encoding = read_field(&mut buf)?;
    if buf.len() < 8 {
        return Err(CacheError::CorruptPayload("truncated u64 length field".into()));
    }
    let length = u64::from_be_bytes(buf[..8].try_into().unwrap()) as i64;
    buf.advance(8);

    Ok(DecodedPrefix {
        content_type,
        content_encoding,
        length,
        prefix_len: start_len - buf.len(),
    })
}

#[async_trait::async_trait]
impl Cache for SharedCache {
    async fn get(&self, key: &str) -> Result<Artifact, CacheError> {
        let value = tokio::time::timeout(READ_TIMEOUT, self.store.get(key.as_bytes()))
            .await
            .map_err(|_| CacheError::Timeout(READ_TIMEOUT))??
            .ok_or(CacheError::Missing)?;

        let prefix = decode_prefix(&value)?;
        let body_bytes = value.slice(prefix.prefix_len..);

        if prefix.length > 0 && body_bytes.len() as i64 != prefix.length {
            return Err(CacheError::CorruptPayload(format!(
                "advertised length {} but received {} bytes",
                prefix.length,
                body_bytes.len()
            )));
        }

        let ttl = tokio::time::timeout(STATS_TIMEOUT, self.store.ttl(key.as_bytes()))
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten()
            .unwrap_or(self.expire);

        let meta = crate::metadata::ContentMetadata::new(
            prefix.content_type,
            prefix.content_encoding,
            prefix.length,
        );

        let download_secs = body_bytes.len() as f64 / (1024.0 * 1024.0) * SPILL_TTL_RATIO_SECS_PER_MIB;
        if ttl.as_secs_f64() < download_secs {
            let body = self.spill_to_scratch(&body_bytes).await?;
            return Ok(Artifact {
                metadata: meta,
                body,
                modified: SystemTime::now(),
                ttl,
            });
        }

        Ok(Artifact {
            metadata: meta,
            body: ArtifactBody::Memory(std::io::Cursor::new(body_bytes)),
            modified: SystemTime::now(),
            ttl,
        })
    }

    async fn put(&self, key: &str, mut body: BodyStream, meta: crate::metadata::ContentMetadata) -> Result<Duration, CacheError> {
        let prefix = encode_prefix(&meta.content_type, &meta.content_encoding, meta.length);

        tokio::time::timeout(WRITE_TIMEOUT, self.store.set(key.as_bytes(), prefix, Some(self.expire)))
            .await
            .map_err(|_| CacheError::Timeout(WRITE_TIMEOUT))??;

        let mut chunk = vec![0u8; APPEND_CHUNK_SIZE];
        loop {
            let n = body.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            let bytes = Bytes::copy_from_slice(&chunk[..n]);
            tokio::time::timeout(WRITE_TIMEOUT, self.store.append(key.as_bytes(), bytes))
                .await
                .map_err(|_| CacheError::Timeout(WRITE_TIMEOUT))??;
        }

        Ok(self.expire)
    }

    async fn stats(&self) -> CacheStats {
        let items = tokio::time::timeout(STATS_TIMEOUT, self.store.dbsize())
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_else(|| {
                warn!("dbsize call to shared store failed or timed out");
                0
            });
        let size_bytes = tokio::time::timeout(STATS_TIMEOUT, self.store.info_memory())
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_else(|| {
                warn!("info memory call to shared store failed or timed out");
                0
            });
        CacheStats { size_bytes, items }
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn close(&self) {}
}

impl SharedCache {
    /// Spools `body` to a uniquely named scratch file and unlinks the name
    /// immediately: the open file descriptor keeps the data readable until
    /// the returned handle is dropped, which is the "unlink on stream
    /// close" contract without needing an explicit close callback.
    async fn spill_to_scratch(&self, body: &Bytes) -> Result<ArtifactBody, CacheError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let path = self.scratch_dir.join(format!("spill-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, body).await?;
        tokio::io::AsyncSeekExt::seek(&mut file, std::io::SeekFrom::Start(0)).await?;
        let _ = tokio::fs::remove_file(&path).await;
        Ok(ArtifactBody::File(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeSharedStore;
    use crate::cache::body_stream_from_bytes;
    use crate::metadata::ContentMetadata;

    fn cache(store: Arc<dyn SharedStore>, dir: &std::path::Path) -> SharedCache {
        SharedCache::new(store, dir.to_path_buf(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SharedStore> = Arc::new(FakeSharedStore::new());
        let cache = cache(store, dir.path());

        let meta = ContentMetadata::new("application/json", "identity", 5);
        cache
            .put("key-a", body_stream_from_bytes(Bytes::from_static(b"hello")), meta.clone())
            .await
            .unwrap();

        let mut artifact = cache.get("key-a").await.unwrap();
        assert_eq!(artifact.metadata.content_type, meta.content_type);
        let mut out = Vec::new();
        match &mut artifact.body {
            ArtifactBody::Memory(c) => {
                tokio::io::AsyncReadExt::read_to_end(c, &mut out).await.unwrap();
            }
            ArtifactBody::File(f) => {
                f.read_to_end(&mut out).await.unwrap();
            }
        }
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn missing_key_surfaces_missing_error() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SharedStore> = Arc::new(FakeSharedStore::new());
        let cache = cache(store, dir.path());
        assert!(matches!(cache.get("absent").await.unwrap_err(), CacheError::Missing));
    }

    #[test]
    fn decode_prefix_rejects_truncated_frame() {
        let err = decode_prefix(&[0, 0]).unwrap_err();
        assert!(matches!(err, CacheError::CorruptPayload(_)));
    }

    #[test]
    fn encode_then_decode_prefix_round_trips() {
        let encoded = encode_prefix("text/html", "gzip", 42);
        let decoded = decode_prefix(&encoded).unwrap();
        assert_eq!(decoded.content_type, "text/html");
        assert_eq!(decoded.content_encoding, "gzip");
        assert_eq!(decoded.length, 42);
    }
}
