//! C3 — a write-through sink that captures headers and spools body bytes
//! to a temporary file, exposed later as a seekable reader.

use crate::error::CacheError;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// What a scratch sink observes about the client connection it is
/// capturing a response for, and the headers that connection carries.
///
/// `Content-Length` is deliberately not part of this trait: the upstream
/// database this proxy fronts does not emit it, so trusting it here would
/// just reintroduce the bug this sink exists to avoid.
pub trait ParentSink {
    /// Whether the client that triggered this response is still connected.
    fn is_connected(&self) -> bool;
    fn content_type(&self) -> Option<String>;
    fn content_encoding(&self) -> Option<String>;
}

/// A write-through, single-writer, single-reader capture of a response
/// body to a temporary file.
///
/// Not safe for concurrent writes; callers must serialize their own
/// `write` calls.
pub struct ScratchSink {
    file: File,
    path: PathBuf,
    content_type: Option<String>,
    content_encoding: Option<String>,
    status_code: u16,
    header_captured: bool,
}

impl ScratchSink {
    /// Creates a unique temporary file under `dir`.
    ///
    /// Fails if `parent` reports the client as already disconnected: there
    /// is no point spooling a body nobody will read.
    pub async fn new(parent: &dyn ParentSink, dir: &Path) -> Result<Self, CacheError> {
        if !parent.is_connected() {
            return Err(CacheError::UnderlyingIo(
                "client disconnected before scratch sink could be created".into(),
            ));
        }

        tokio::fs::create_dir_all(dir).await?;
        let filename = format!("scratch-{}", uuid::Uuid::new_v4());
        let path = dir.join(filename);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        Ok(Self {
            file,
            path,
            content_type: None,
            content_encoding: None,
            status_code: 200,
            header_captured: false,
        })
    }

    /// Appends `bytes` to the spool file. On the first call, captures
    /// `Content-Type` / `Content-Encoding` from the parent sink.
    pub async fn write(&mut self, parent: &dyn ParentSink, bytes: &[u8]) -> Result<usize, CacheError> {
        if !self.header_captured {
            self.content_type = parent.content_type();
            self.content_encoding = parent.content_encoding();
            self.header_captured = true;
        }
        self.file.write_all(bytes).await?;
        Ok(bytes.len())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn set_status_code(&mut self, code: u16) {
        self.status_code = code;
    }

    /// Flushes pending writes and returns the underlying file handle,
    /// positioned at its current offset, for reading.
    pub async fn reader(&mut self) -> Result<&mut File, CacheError> {
        self.file.flush().await?;
        Ok(&mut self.file)
    }

    /// Seeks the spool file back to byte 0, ahead of streaming the
    /// captured body out to a client.
    pub async fn reset_offset(&mut self) -> Result<(), CacheError> {
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok(())
    }

    /// Returns the number of bytes captured so far, restoring the file's
    /// read/write position afterward.
    pub async fn captured_length(&mut self) -> Result<i64, CacheError> {
        let current = self.file.stream_position().await?;
        let end = self.file.seek(std::io::SeekFrom::End(0)).await?;
        self.file.seek(std::io::SeekFrom::Start(current)).await?;
        Ok(end as i64)
    }

    /// Closes and unlinks the temporary file.
    pub async fn close(self) -> Result<(), CacheError> {
        drop(self.file);
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}
