//! C6.1 — in-process transaction registry: a mutex-guarded map plus a
//! background cleaner.

use crate::error::CacheError;
use crate::registry::{TransactionRegistry, TransactionStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone)]
enum State {
    Pending,
    Completed,
    Failed(String),
}

struct Record {
    state: State,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalRegistryConfig {
    pub pending_deadline: Duration,
    pub terminal_ttl: Duration,
}

/// An in-process mapping from fingerprint to transaction state, suitable
/// for a single-instance deployment where C4 (filesystem cache) is also
/// node-local.
pub struct LocalRegistry {
    map: Arc<Mutex<HashMap<String, Record>>>,
    config: LocalRegistryConfig,
    shutdown_tx: broadcast::Sender<()>,
    cleaner: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LocalRegistry {
    pub fn new(config: LocalRegistryConfig) -> Arc<Self> {
        let map = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, _) = broadcast::channel(1);

        let registry = Arc::new(Self {
            map,
            config,
            shutdown_tx,
            cleaner: std::sync::Mutex::new(None),
        });

        let cleaner_handle = tokio::spawn(run_cleaner(
            registry.map.clone(),
            registry.config,
            registry.shutdown_tx.subscribe(),
        ));
        *registry.cleaner.lock().unwrap() = Some(cleaner_handle);

        registry
    }
}

#[async_trait]
impl TransactionRegistry for LocalRegistry {
    async fn create(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.map.lock();
        // Pending -> Pending is idempotent; a prior Completed/Failed
        // record is overwritten by a fresh transaction attempt.
        map.insert(
            key.to_string(),
            Record {
                state: State::Pending,
                deadline: Instant::now() + self.config.pending_deadline,
            },
        );
        Ok(())
    }

    async fn complete(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.map.lock();
        if !map.contains_key(key) {
            warn!(key, "transaction completed past its pending deadline or without a prior create");
        }
        map.insert(
            key.to_string(),
            Record {
                state: State::Completed,
                deadline: Instant::now() + self.config.terminal_ttl,
            },
        );
        Ok(())
    }

    async fn fail(&self, key: &str, reason: &str) -> Result<(), CacheError> {
        let mut map = self.map.lock();
        if !map.contains_key(key) {
            warn!(key, "transaction failed past its pending deadline or without a prior create");
        }
        map.insert(
            key.to_string(),
            Record {
                state: State::Failed(reason.to_string()),
                deadline: Instant::now() + self.config.terminal_ttl,
            },
        );
        Ok(())
    }

    async fn status(&self, key: &str) -> Result<TransactionStatus, CacheError> {
        let map = self.map.lock();
        match map.get(key) {
            Some(record) if record.deadline > Instant::now() => Ok(match &record.state {
                State::Pending => TransactionStatus::Pending,
                State::Completed => TransactionStatus::Completed,
                State::Failed(reason) => TransactionStatus::Failed(reason.clone()),
            }),
            _ => Ok(TransactionStatus::Absent),
        }
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.cleaner.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn cleaner_interval(pending_deadline: Duration) -> Duration {
    pending_deadline.clamp(Duration::from_millis(100), Duration::from_secs(1))
}

async fn run_cleaner(
    map: Arc<Mutex<HashMap<String, Record>>>,
    config: LocalRegistryConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let interval_dur = cleaner_interval(config.pending_deadline);
    info!(?interval_dur, "local transaction registry cleaner started");
    let mut interval = tokio::time::interval(interval_dur);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                map.lock().retain(|_, record| record.deadline > now);
            }
            _ = shutdown_rx.recv() => {
                info!("local transaction registry cleaner shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LocalRegistryConfig {
        LocalRegistryConfig {
            pending_deadline: Duration::from_millis(300),
            terminal_ttl: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn monotonic_create_then_complete_never_reports_failed() {
        let registry = LocalRegistry::new(cfg());
        registry.create("k").await.unwrap();
        assert_eq!(registry.status("k").await.unwrap(), TransactionStatus::Pending);
        registry.complete("k").await.unwrap();
        assert_eq!(registry.status("k").await.unwrap(), TransactionStatus::Completed);
        registry.close().await;
    }

    #[tokio::test]
    async fn terminal_ttl_expires_to_absent() {
        let registry = LocalRegistry::new(cfg());
        registry.create("k").await.unwrap();
        registry.complete("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.status("k").await.unwrap(), TransactionStatus::Absent);
        registry.close().await;
    }

    #[tokio::test]
    async fn fail_carries_exact_reason() {
        let registry = LocalRegistry::new(cfg());
        registry.create("k").await.unwrap();
        registry.fail("k", "failed for fun").await.unwrap();
        assert_eq!(
            registry.status("k").await.unwrap(),
            TransactionStatus::Failed("failed for fun".into())
        );
        registry.close().await;
    }

    #[tokio::test]
    async fn never_created_key_is_absent() {
        let registry = LocalRegistry::new(cfg());
        assert_eq!(registry.status("never").await.unwrap(), TransactionStatus::Absent);
        registry.close().await;
    }
}
