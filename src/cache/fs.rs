//! C4 — a persistent key→file store with background size/age eviction.

use crate::cache::{Artifact, ArtifactBody, BodyStream, Cache, CacheStats};
use crate::error::CacheError;
use crate::fingerprint::is_valid_fingerprint_str;
use crate::metadata::{read_metadata, write_metadata, ContentMetadata};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_CLEANER_INTERVAL: Duration = Duration::from_secs(3600);
const MIN_CLEANER_INTERVAL: Duration = Duration::from_secs(60);
const SIZE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DIR_BATCH_SIZE: usize = 1024;
const EVICTION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct FsCacheConfig {
    pub expire: Duration,
    pub grace: Duration,
    pub max_size: u64,
}

/// A directory of fingerprint-named files, each holding a metadata frame
/// (§4.2) followed by the raw body, with a background cleaner enforcing
/// age and size limits.
pub struct FsCache {
    dir: PathBuf,
    config: FsCacheConfig,
    size_bytes: Arc<AtomicU64>,
    items: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    cleaner: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FsCache {
    pub async fn new(dir: impl Into<PathBuf>, config: FsCacheConfig) -> Result<Arc<Self>, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let (size_bytes, items) = scan_totals(&dir).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let cache = Arc::new(Self {
            dir,
            config,
            size_bytes: Arc::new(AtomicU64::new(size_bytes)),
            items: Arc::new(AtomicU64::new(items)),
            shutdown_tx,
            cleaner: std::sync::Mutex::new(None),
        });

        let cleaner_handle = tokio::spawn(run_cleaner(
            cache.dir.clone(),
            cache.config,
            cache.size_bytes.clone(),
            cache.items.clone(),
            cache.shutdown_tx.subscribe(),
        ));
        *cache.cleaner.lock().unwrap() = Some(cleaner_handle);

        Ok(cache)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

#[async_trait::async_trait]
impl Cache for FsCache {
    async fn get(&self, key: &str) -> Result<Artifact, CacheError> {
        let path = self.path_for(key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::Missing),
            Err(e) => return Err(e.into()),
        };

        let file_meta = file.metadata().await?;
        let modified = file_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);

        if age > self.config.expire + self.config.grace {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CacheError::Missing);
        }

        let ttl = self.config.expire.saturating_sub(age);

        let metadata = read_metadata(&mut file).await?;

        Ok(Artifact {
            metadata,
            body: ArtifactBody::File(file),
            modified,
            ttl,
        })
    }

    async fn put(&self, key: &str, mut body: BodyStream, meta: ContentMetadata) -> Result<Duration, CacheError> {
        if !is_valid_fingerprint_str(key) {
            return Err(CacheError::UnderlyingIo(format!("invalid cache key {key}")));
        }

        // Writer-wins races on `put` are permitted by design; this crate
        // closes the crash/truncate gap by writing under a unique temp
        // name in the same directory and renaming over the target, so a
        // reader never observes a partial artifact.
        let tmp_path = self.dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        let target_path = self.path_for(key);

        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;

        write_metadata(&mut tmp_file, &meta).await?;

        tokio::io::copy(&mut body, &mut tmp_file).await?;
        tmp_file.flush().await?;
        let file_size = tmp_file.metadata().await?.len();
        drop(tmp_file);

        tokio::fs::rename(&tmp_path, &target_path).await?;

        self.size_bytes.fetch_add(file_size, Ordering::Relaxed);
        self.items.fetch_add(1, Ordering::Relaxed);

        Ok(self.config.expire)
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
        }
    }

    fn name(&self) -> &'static str {
        "file_system"
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.cleaner.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn scan_totals(dir: &Path) -> Result<(u64, u64), CacheError> {
    let mut size = 0u64;
    let mut items = 0u64;
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_valid_fingerprint_str(name) {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            size += meta.len();
            items += 1;
        }
    }
    Ok((size, items))
}

fn cleaner_interval(expire: Duration) -> Duration {
    (expire / 2).clamp(MIN_CLEANER_INTERVAL, MAX_CLEANER_INTERVAL)
}

async fn run_cleaner(
    dir: PathBuf,
    config: FsCacheConfig,
    size_bytes: Arc<AtomicU64>,
    items: Arc<AtomicU64>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let interval_dur = cleaner_interval(config.expire);
    info!(?interval_dur, "filesystem cache cleaner started");
    let mut age_interval = tokio::time::interval(interval_dur);
    let mut size_poll = tokio::time::interval(SIZE_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = age_interval.tick() => {
                if let Err(e) = sweep_expired(&dir, config, &size_bytes, &items).await {
                    warn!(error = %e, "filesystem cache age sweep failed");
                }
            }
            _ = size_poll.tick() => {
                if size_bytes.load(Ordering::Relaxed) > config.max_size {
                    if let Err(e) = sweep_size_pressure(&dir, config, &size_bytes, &items).await {
                        warn!(error = %e, "filesystem cache size sweep failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("filesystem cache cleaner shutting down");
                return;
            }
        }
    }
}

async fn list_batches(dir: &Path) -> Result<Vec<Vec<PathBuf>>, CacheError> {
    let mut batches = vec![Vec::with_capacity(DIR_BATCH_SIZE)];
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_valid_fingerprint_str(name) {
            continue;
        }
        let batch = batches.last_mut().unwrap();
        batch.push(entry.path());
        if batch.len() >= DIR_BATCH_SIZE {
            batches.push(Vec::with_capacity(DIR_BATCH_SIZE));
        }
    }
    Ok(batches)
}

async fn sweep_expired(
    dir: &Path,
    config: FsCacheConfig,
    size_bytes: &AtomicU64,
    items: &AtomicU64,
) -> Result<(), CacheError> {
    let max_age = config.expire + config.grace;
    let mut removed_bytes = 0u64;
    let mut removed_items = 0u64;

    for batch in list_batches(dir).await? {
        for path in batch {
            let Ok(meta) = tokio::fs::metadata(&path).await else { continue };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                let len = meta.len();
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed_bytes += len;
                    removed_items += 1;
                } else {
                    warn!(path = %path.display(), "failed to unlink expired cache file");
                }
            }
        }
    }

    size_bytes.fetch_sub(removed_bytes.min(size_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
    items.fetch_sub(removed_items.min(items.load(Ordering::Relaxed)), Ordering::Relaxed);
    if removed_items > 0 {
        debug!(removed_items, removed_bytes, "evicted expired cache entries");
    }
    Ok(())
}

async fn sweep_size_pressure(
    dir: &Path,
    config: FsCacheConfig,
    size_bytes: &AtomicU64,
    items: &AtomicU64,
) -> Result<(), CacheError> {
    let mut rng = SmallRng::from_entropy();

    for _ in 0..EVICTION_ATTEMPTS {
        let total = size_bytes.load(Ordering::Relaxed);
        if total <= config.max_size {
            return Ok(());
        }
        let excess = total - config.max_size;
        // `p` is a percentage in [10, 110); expressed as a probability
        // below by dividing by 100.
        let p = (excess as f64 / total as f64) * 100.0 + 10.0;

        let mut removed_bytes = 0u64;
        let mut removed_items = 0u64;

        for batch in list_batches(dir).await? {
            for path in batch {
                if rng.gen::<f64>() * 100.0 >= p {
                    continue;
                }
                let Ok(meta) = tokio::fs::metadata(&path).await else { continue };
                let len = meta.len();
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed_bytes += len;
                    removed_items += 1;
                }
            }
        }

        size_bytes.fetch_sub(removed_bytes.min(size_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
        items.fetch_sub(removed_items.min(items.load(Ordering::Relaxed)), Ordering::Relaxed);
        debug!(removed_items, removed_bytes, p, "stochastic size eviction pass");
    }
    Ok(())
}

#[cfg(test)]
async fn read_body_to_end(body: &mut ArtifactBody) -> Result<Vec<u8>, CacheError> {
    let mut buf = Vec::new();
    match body {
        ArtifactBody::Memory(cursor) => {
            cursor.read_to_end(&mut buf).await?;
        }
        ArtifactBody::File(file) => {
            file.read_to_end(&mut buf).await?;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::body_stream_from_bytes;
    use bytes::Bytes;

    fn cfg(expire: Duration, grace: Duration, max_size: u64) -> FsCacheConfig {
        FsCacheConfig { expire, grace, max_size }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path(), cfg(Duration::from_secs(60), Duration::from_secs(1), 1 << 20))
            .await
            .unwrap();

        let key = "a".repeat(32);
        assert!(matches!(cache.get(&key).await.unwrap_err(), CacheError::Missing));

        let meta = ContentMetadata::new("text/html; 0", "gzip; 0", 7);
        cache
            .put(&key, body_stream_from_bytes(Bytes::from_static(b"value 0")), meta.clone())
            .await
            .unwrap();

        let mut artifact = cache.get(&key).await.unwrap();
        assert_eq!(artifact.metadata, meta);
        let body = read_body_to_end(&mut artifact.body).await.unwrap();
        assert_eq!(body, b"value 0");

        cache.close().await;
    }

    #[tokio::test]
    async fn expiry_returns_missing_after_expire_plus_grace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path(), cfg(Duration::from_millis(100), Duration::from_millis(50), 1 << 20))
            .await
            .unwrap();
        let key = "b".repeat(32);
        cache
            .put(&key, body_stream_from_bytes(Bytes::from_static(b"x")), ContentMetadata::new("t", "e", 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(cache.get(&key).await.unwrap_err(), CacheError::Missing));
        cache.close().await;
    }

    #[tokio::test]
    async fn grace_serving_returns_stale_artifact_with_small_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path(), cfg(Duration::from_millis(50), Duration::from_millis(200), 1 << 20))
            .await
            .unwrap();
        let key = "c".repeat(32);
        cache
            .put(&key, body_stream_from_bytes(Bytes::from_static(b"stale")), ContentMetadata::new("t", "e", 5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let artifact = cache.get(&key).await.unwrap();
        assert_eq!(artifact.ttl, Duration::ZERO);
        cache.close().await;
    }

    #[tokio::test]
    async fn size_bound_after_manual_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let max_size = 8192u64;
        let cache = FsCache::new(dir.path(), cfg(Duration::from_secs(60), Duration::from_secs(1), max_size))
            .await
            .unwrap();

        for i in 0..1000 {
            let key = format!("{:032x}", i);
            cache
                .put(&key, body_stream_from_bytes(Bytes::from_static(b"0123456789012345")), ContentMetadata::new("t", "e", 17))
                .await
                .unwrap();
        }

        sweep_size_pressure(dir.path(), cache.config, &cache.size_bytes, &cache.items)
            .await
            .unwrap();

        assert!(cache.size_bytes.load(Ordering::Relaxed) <= max_size);
        assert!(cache.items.load(Ordering::Relaxed) <= 1000);
        cache.close().await;
    }

    #[tokio::test]
    async fn rejects_keys_that_are_not_valid_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path(), cfg(Duration::from_secs(60), Duration::from_secs(1), 1 << 20))
            .await
            .unwrap();
        let result = cache
            .put("not-a-fingerprint", body_stream_from_bytes(Bytes::from_static(b"x")), ContentMetadata::new("t", "e", 1))
            .await;
        assert!(result.is_err());
        cache.close().await;
    }
}
