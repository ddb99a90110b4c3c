//! C7 — binds one [`Cache`] and one [`TransactionRegistry`] into a single
//! facade implementing the await-or-create anti-dogpile protocol.

use crate::backend::{BackendClient, SharedStore};
use crate::cache::fs::{FsCache, FsCacheConfig};
use crate::cache::shared::SharedCache;
use crate::cache::{Artifact, BodyStream, Cache};
use crate::config::{CacheConfig, CoordinatorSettings, RegistryConfig};
use crate::error::CacheError;
use crate::metadata::ContentMetadata;
use crate::registry::local::{LocalRegistry, LocalRegistryConfig};
use crate::registry::shared::{SharedRegistry, SharedRegistryConfig};
use crate::registry::{TransactionRegistry, TransactionStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_QUANTUM: Duration = Duration::from_millis(100);

/// Grace time configuration for the anti-dogpile wait.
#[derive(Debug, Clone, Copy)]
pub enum GraceTime {
    /// Wait up to the given duration for a concurrent writer to finish.
    Duration(Duration),
    /// Anti-dogpile coordination is disabled entirely; every caller
    /// proceeds straight to its own upstream execution on a miss.
    Disabled,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub grace_time: GraceTime,
    pub max_payload_size: u64,
    /// Consumed only as metadata by the caller; this crate does not
    /// interpret it.
    pub shared_with_all_users: bool,
}

/// Binds one cache and one transaction registry, owning no backend
/// handles itself — those belong exclusively to the components it wraps.
pub struct AsyncCache {
    cache: Arc<dyn Cache>,
    registry: Arc<dyn TransactionRegistry>,
    config: CoordinatorConfig,
}

impl AsyncCache {
    pub fn new(cache: Arc<dyn Cache>, registry: Arc<dyn TransactionRegistry>, config: CoordinatorConfig) -> Self {
        Self { cache, registry, config }
    }

    /// Builds a working coordinator straight from loaded configuration,
    /// choosing the filesystem or shared-store cache/registry backend per
    /// each config's `backend` tag (spec.md §9's "config tag" selection)
    /// and connecting to the shared store at most once when either side
    /// needs it.
    pub async fn from_config(
        cache_cfg: &CacheConfig,
        registry_cfg: &RegistryConfig,
        coordinator_cfg: &CoordinatorSettings,
    ) -> Result<Self, CacheError> {
        let shared_store = if cache_cfg.backend == "redis" || registry_cfg.backend == "redis" {
            let addr = cache_cfg.backend_addr.as_deref().ok_or_else(|| {
                CacheError::UnderlyingIo("cache.backend_addr is required for a redis cache or registry backend".into())
            })?;
            let socket_addr: std::net::SocketAddr = addr
                .parse()
                .map_err(|e| CacheError::UnderlyingIo(format!("invalid cache.backend_addr {addr:?}: {e}")))?;
            Some(Arc::new(BackendClient::connect(socket_addr).await?) as Arc<dyn SharedStore>)
        } else {
            None
        };

        let cache: Arc<dyn Cache> = match cache_cfg.backend.as_str() {
            "redis" => {
                let store = shared_store.clone().expect("connected above because cache.backend == \"redis\"");
                Arc::new(SharedCache::new(store, cache_cfg.cache_dir.as_str(), cache_cfg.expire))
            }
            _ => FsCache::new(
                cache_cfg.cache_dir.as_str(),
                FsCacheConfig {
                    expire: cache_cfg.expire,
                    grace: cache_cfg.grace,
                    max_size: cache_cfg.max_size,
                },
            )
            .await?,
        };

        let pending_deadline = registry_cfg.pending_deadline.unwrap_or(cache_cfg.grace * 2);
        let registry: Arc<dyn TransactionRegistry> = match registry_cfg.backend.as_str() {
            "redis" => {
                let store = shared_store.expect("connected above because registry.backend == \"redis\"");
                Arc::new(SharedRegistry::new(
                    store,
                    SharedRegistryConfig {
                        pending_deadline,
                        terminal_ttl: registry_cfg.terminal_ttl,
                    },
                ))
            }
            _ => LocalRegistry::new(LocalRegistryConfig {
                pending_deadline,
                terminal_ttl: registry_cfg.terminal_ttl,
            }),
        };

        Ok(Self::new(
            cache,
            registry,
            CoordinatorConfig {
                grace_time: coordinator_cfg.resolve_grace_time(),
                max_payload_size: coordinator_cfg.max_payload_size,
                shared_with_all_users: coordinator_cfg.shared_with_all_users,
            },
        ))
    }

    pub async fn get(&self, key: &str) -> Result<Artifact, CacheError> {
        self.cache.get(key).await
    }

    pub async fn put(&self, key: &str, body: BodyStream, meta: ContentMetadata) -> Result<Duration, CacheError> {
        self.cache.put(key, body, meta).await
    }

    pub async fn create_transaction(&self, key: &str) -> Result<(), CacheError> {
        self.registry.create(key).await
    }

    pub async fn complete_transaction(&self, key: &str) -> Result<(), CacheError> {
        self.registry.complete(key).await
    }

    pub async fn fail_transaction(&self, key: &str, reason: &str) -> Result<(), CacheError> {
        self.registry.fail(key, reason).await
    }

    /// Implements the protocol in the interface contract exactly: poll the
    /// registry every [`POLL_QUANTUM`] (or less, near the deadline) until
    /// either a terminal status appears or the grace window elapses.
    ///
    /// `seen` is returned as the last observed state purely as a
    /// diagnostic; a caller that gets back `Absent` after the window
    /// elapses is expected to start its own transaction.
    pub async fn await_for_concurrent_transaction(&self, key: &str) -> TransactionStatus {
        let grace_time = match self.config.grace_time {
            GraceTime::Disabled => return TransactionStatus::Absent,
            GraceTime::Duration(d) => d,
        };

        let start = Instant::now();
        // The last-seen status is a diagnostic only; per the protocol it is
        // never updated inside the loop below, so a timeout always reports
        // `Absent` regardless of how many times a `Pending` record was
        // observed along the way — that's the signal telling the caller to
        // start its own transaction.
        let seen = TransactionStatus::Absent;

        loop {
            if start.elapsed() > grace_time {
                return seen;
            }

            match self.registry.status(key).await {
                Ok(status) => {
                    if !status.is_pending() {
                        return status;
                    }
                }
                Err(e) => {
                    debug!(key, error = %e, "registry status poll failed while awaiting concurrent transaction");
                    return seen;
                }
            }

            let remaining = grace_time.saturating_sub(start.elapsed());
            tokio::time::sleep(POLL_QUANTUM.min(remaining)).await;
        }
    }

    pub async fn stats(&self) -> crate::cache::CacheStats {
        self.cache.stats().await
    }

    pub fn max_payload_size(&self) -> u64 {
        self.config.max_payload_size
    }

    pub fn shared_with_all_users(&self) -> bool {
        self.config.shared_with_all_users
    }

    /// Closes the registry first, then the cache; safe to call twice.
    pub async fn close(&self) {
        self.registry.close().await;
        self.cache.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fs::{FsCache, FsCacheConfig};
    use crate::registry::local::{LocalRegistry, LocalRegistryConfig};
    use std::sync::Arc;

    fn coordinator_config(grace: Duration) -> CoordinatorConfig {
        CoordinatorConfig {
            grace_time: GraceTime::Duration(grace),
            max_payload_size: 1 << 20,
            shared_with_all_users: false,
        }
    }

    async fn make_coordinator(dir: &std::path::Path, grace: Duration) -> AsyncCache {
        let cache = FsCache::new(
            dir,
            FsCacheConfig {
                expire: Duration::from_secs(60),
                grace: Duration::from_secs(1),
                max_size: 1 << 20,
            },
        )
        .await
        .unwrap();
        let registry = LocalRegistry::new(LocalRegistryConfig {
            pending_deadline: grace * 2,
            terminal_ttl: Duration::from_millis(200),
        });
        AsyncCache::new(cache, registry, coordinator_config(grace))
    }

    #[tokio::test]
    async fn waiter_observes_completion_before_grace_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(make_coordinator(dir.path(), Duration::from_millis(300)).await);

        let key = "d".repeat(32);
        coordinator.create_transaction(&key).await.unwrap();

        let writer = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                coordinator.complete_transaction(&key).await.unwrap();
            })
        };

        let started = Instant::now();
        let status = coordinator.await_for_concurrent_transaction(&key).await;
        writer.await.unwrap();

        assert_eq!(status, TransactionStatus::Completed);
        assert!(started.elapsed() < Duration::from_millis(300));
        coordinator.close().await;
    }

    #[tokio::test]
    async fn waiter_observes_failure_with_exact_reason() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(make_coordinator(dir.path(), Duration::from_millis(300)).await);

        let key = "e".repeat(32);
        coordinator.create_transaction(&key).await.unwrap();

        let writer = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                coordinator.fail_transaction(&key, "failed for fun").await.unwrap();
            })
        };

        let status = coordinator.await_for_concurrent_transaction(&key).await;
        writer.await.unwrap();

        assert_eq!(status, TransactionStatus::Failed("failed for fun".into()));
        coordinator.close().await;
    }

    #[tokio::test]
    async fn waiter_times_out_to_absent_when_no_transition_occurs() {
        let dir = tempfile::tempdir().unwrap();
        let grace = Duration::from_millis(200);
        let coordinator = make_coordinator(dir.path(), grace).await;

        let key = "f".repeat(32);
        coordinator.create_transaction(&key).await.unwrap();

        let started = Instant::now();
        let status = coordinator.await_for_concurrent_transaction(&key).await;
        let elapsed = started.elapsed();

        assert_eq!(status, TransactionStatus::Absent);
        assert!(elapsed < grace + Duration::from_millis(100));
        coordinator.close().await;
    }

    #[tokio::test]
    async fn disabled_grace_time_returns_absent_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(
            dir.path(),
            FsCacheConfig {
                expire: Duration::from_secs(60),
                grace: Duration::from_secs(1),
                max_size: 1 << 20,
            },
        )
        .await
        .unwrap();
        let registry = LocalRegistry::new(LocalRegistryConfig {
            pending_deadline: Duration::from_millis(100),
            terminal_ttl: Duration::from_millis(100),
        });
        let coordinator = AsyncCache::new(
            cache,
            registry,
            CoordinatorConfig {
                grace_time: GraceTime::Disabled,
                max_payload_size: 1024,
                shared_with_all_users: false,
            },
        );

        let status = coordinator.await_for_concurrent_transaction("anything").await;
        assert_eq!(status, TransactionStatus::Absent);
        coordinator.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = make_coordinator(dir.path(), Duration::from_millis(100)).await;
        coordinator.close().await;
        coordinator.close().await;
    }

    #[tokio::test]
    async fn from_config_builds_a_working_filesystem_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let cache_cfg = crate::config::CacheConfig {
            backend: "file_system".into(),
            cache_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let registry_cfg = crate::config::RegistryConfig::default();
        let coordinator_cfg = crate::config::CoordinatorSettings::default();

        let coordinator = AsyncCache::from_config(&cache_cfg, &registry_cfg, &coordinator_cfg).await.unwrap();

        let key = "0".repeat(32);
        assert!(coordinator.get(&key).await.is_err());
        coordinator
            .put(
                &key,
                crate::cache::body_stream_from_bytes(bytes::Bytes::from_static(b"hello")),
                ContentMetadata::new("text/plain", "identity", 5),
            )
            .await
            .unwrap();
        assert!(coordinator.get(&key).await.is_ok());
        assert!(matches!(coordinator.config.grace_time, GraceTime::Duration(_)));
        coordinator.close().await;
    }

    #[tokio::test]
    async fn from_config_rejects_redis_backend_without_address() {
        let cache_cfg = crate::config::CacheConfig {
            backend: "redis".into(),
            ..Default::default()
        };
        let registry_cfg = crate::config::RegistryConfig::default();
        let coordinator_cfg = crate::config::CoordinatorSettings::default();

        let err = AsyncCache::from_config(&cache_cfg, &registry_cfg, &coordinator_cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnderlyingIo(_)));
    }
}
