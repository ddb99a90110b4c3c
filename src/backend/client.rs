//! An async client for the shared key/value store that backs C5 and the
//! shared transaction registry (C6.2).

use crate::backend::protocol::{ReplyCodec, Reply, Request, RequestCodec};
use crate::error::CacheError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// The primitive operations C5 (shared cache) and C6.2 (shared registry)
/// need from "a shared in-memory key/value store". Abstracted as a trait
/// so tests can swap in an in-process fake instead of a real connection.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, CacheError>;
    async fn set(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn append(&self, key: &[u8], chunk: Bytes) -> Result<(), CacheError>;
    async fn del(&self, key: &[u8]) -> Result<bool, CacheError>;
    async fn ttl(&self, key: &[u8]) -> Result<Option<Duration>, CacheError>;
    async fn dbsize(&self) -> Result<u64, CacheError>;
    /// Remaining resident memory reported by the backend, in bytes.
    async fn info_memory(&self) -> Result<u64, CacheError>;
}

/// A multiplexing client over a single TCP connection to the shared
/// store, matching this codebase's existing "connect with timeout, write
/// with timeout, read in a loop until a full frame decodes" client shape.
pub struct BackendClient {
    stream: Mutex<TcpStream>,
}

impl BackendClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, CacheError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CacheError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| CacheError::UnderlyingIo(e.to_string()))?;
        Ok(Self { stream: Mutex::new(stream) })
    }

    async fn send_and_receive(&self, req: Request, read_timeout: Duration) -> Result<Reply, CacheError> {
        let mut write_buf = BytesMut::new();
        RequestCodec
            .encode(req, &mut write_buf)
            .map_err(|e| CacheError::UnderlyingIo(e.to_string()))?;

        let mut stream = self.stream.lock().await;

        tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&write_buf))
            .await
            .map_err(|_| CacheError::Timeout(WRITE_TIMEOUT))?
            .map_err(|e| CacheError::UnderlyingIo(e.to_string()))?;

        let mut read_buf = BytesMut::with_capacity(4096);
        let mut codec = ReplyCodec;
        loop {
            let read_fut = stream.read_buf(&mut read_buf);
            match tokio::time::timeout(read_timeout, read_fut).await {
                Ok(Ok(0)) => return Err(CacheError::UnderlyingIo("connection closed by peer".into())),
                Ok(Ok(_)) => {
                    if let Some(reply) = codec
                        .decode(&mut read_buf)
                        .map_err(|e| CacheError::UnderlyingIo(e.to_string()))?
                    {
                        return Ok(reply);
                    }
                }
                Ok(Err(e)) => return Err(CacheError::UnderlyingIo(e.to_string())),
                Err(_) => return Err(CacheError::Timeout(read_timeout)),
            }
        }
    }
}

#[async_trait]
impl SharedStore for BackendClient {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, CacheError> {
        match self
            .send_and_receive(Request::Get { key: Bytes::copy_from_slice(key) }, Duration::from_secs(1))
            .await?
        {
            Reply::Value(v) => Ok(Some(v)),
            Reply::NotFound => Ok(None),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to GET".into())),
        }
    }

    async fn set(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        let req = Request::Set {
            key: Bytes::copy_from_slice(key),
            value,
            ttl_secs: ttl.map(|d| d.as_secs()),
        };
        match self.send_and_receive(req, Duration::from_secs(5)).await? {
            Reply::Ok => Ok(()),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to SET".into())),
        }
    }

    async fn append(&self, key: &[u8], chunk: Bytes) -> Result<(), CacheError> {
        let req = Request::Append { key: Bytes::copy_from_slice(key), chunk };
        match self.send_and_receive(req, Duration::from_secs(5)).await? {
            Reply::Ok => Ok(()),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to APPEND".into())),
        }
    }

    async fn del(&self, key: &[u8]) -> Result<bool, CacheError> {
        let req = Request::Del { key: Bytes::copy_from_slice(key) };
        match self.send_and_receive(req, Duration::from_secs(1)).await? {
            Reply::Bool(b) => Ok(b),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to DEL".into())),
        }
    }

    async fn ttl(&self, key: &[u8]) -> Result<Option<Duration>, CacheError> {
        let req = Request::Ttl { key: Bytes::copy_from_slice(key) };
        match self.send_and_receive(req, Duration::from_secs(1)).await? {
            Reply::Int(secs) if secs < 0 => Ok(None),
            Reply::Int(secs) => Ok(Some(Duration::from_secs(secs as u64))),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to TTL".into())),
        }
    }

    async fn dbsize(&self) -> Result<u64, CacheError> {
        match self
            .send_and_receive(Request::DbSize, Duration::from_millis(500))
            .await?
        {
            Reply::Int(n) => Ok(n.max(0) as u64),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to DBSIZE".into())),
        }
    }

    async fn info_memory(&self) -> Result<u64, CacheError> {
        match self
            .send_and_receive(Request::InfoMemory, Duration::from_millis(500))
            .await?
        {
            Reply::Blob(blob) => Ok(parse_used_memory(&String::from_utf8_lossy(&blob))),
            Reply::Err(msg) => Err(CacheError::UnderlyingIo(msg)),
            _ => Err(CacheError::UnderlyingIo("unexpected reply to INFO memory".into())),
        }
    }
}

/// Scrapes `used_memory:<N>` out of an `INFO memory` blob with a fixed
/// pattern rather than a general parser, since the field position within
/// the blob is not guaranteed.
fn parse_used_memory(info: &str) -> u64 {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"used_memory:(\d+)").unwrap());
    PATTERN
        .captures(info)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_memory_is_scraped_from_info_blob() {
        let blob = "# Memory\r\nused_memory:10485760\r\nused_memory_human:10.00M\r\n";
        assert_eq!(parse_used_memory(blob), 10_485_760);
    }

    #[test]
    fn used_memory_defaults_to_zero_on_missing_field() {
        assert_eq!(parse_used_memory("# Memory\r\nno_such_field:1\r\n"), 0);
    }
}
