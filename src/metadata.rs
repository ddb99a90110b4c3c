//! C2 — length-prefixed framing of `{type, encoding, length}`.

use crate::error::CacheError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// HTTP-level metadata stored alongside a cached body.
///
/// `length` is authoritative on write. On read it may come back as `0`
/// if the stored length prefix was corrupt, in which case the caller is
/// expected to recompute it from the actual stream length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentMetadata {
    pub content_type: String,
    pub content_encoding: String,
    pub length: i64,
}

impl ContentMetadata {
    pub fn new(content_type: impl Into<String>, content_encoding: impl Into<String>, length: i64) -> Self {
        Self {
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            length,
        }
    }
}

/// Writes a single length-prefixed header: a 4-byte big-endian length
/// followed by the UTF-8 bytes of `value`.
pub async fn write_header<W: AsyncWrite + Unpin>(stream: &mut W, value: &str) -> Result<(), CacheError> {
    let bytes = value.as_bytes();
    let len = u32::try_from(bytes.len())
        .map_err(|_| CacheError::CorruptFrame("header value exceeds u32 length".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

/// Reads back a single length-prefixed header written by [`write_header`].
///
/// Fails with [`CacheError::CorruptFrame`] if the stream ends before the
/// length prefix is complete, or before `length` bytes of payload arrive.
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String, CacheError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| CacheError::CorruptFrame("truncated length prefix".into()))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|_| CacheError::CorruptFrame("payload shorter than advertised length".into()))?;

    String::from_utf8(payload).map_err(|e| CacheError::CorruptFrame(e.to_string()))
}

/// Writes the full three-header metadata frame: `type`, `encoding`, then
/// `length` encoded as a decimal ASCII string.
pub async fn write_metadata<W: AsyncWrite + Unpin>(
    stream: &mut W,
    meta: &ContentMetadata,
) -> Result<(), CacheError> {
    write_header(stream, &meta.content_type).await?;
    write_header(stream, &meta.content_encoding).await?;
    write_header(stream, &meta.length.to_string()).await?;
    Ok(())
}

/// Reads back a metadata frame written by [`write_metadata`].
///
/// A corrupt (non-numeric) length field is tolerated: it is treated as
/// `0` so the caller can recompute it from the remainder of the stream,
/// matching the filesystem cache's stated corruption policy.
pub async fn read_metadata<R: AsyncRead + Unpin>(stream: &mut R) -> Result<ContentMetadata, CacheError> {
    let content_type = read_header(stream).await?;
    let content_encoding = read_header(stream).await?;
    let length_str = read_header(stream).await?;
    let length = length_str.parse::<i64>().unwrap_or(0);
    Ok(ContentMetadata::new(content_type, content_encoding, length))
}
